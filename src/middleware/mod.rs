//! Request-pipeline middleware: policy evaluation, the rule engine, and the
//! supporting enforcement/observability modules it dispatches into.

pub mod anomaly;
pub mod audit;
pub mod datadog;
pub mod engine;
pub mod external_guardrail;
pub mod fields;
pub mod guardrail;
pub mod langfuse;
pub mod metrics;
pub mod model_access;
pub mod observer;
pub mod oidc;
pub mod pii_vault;
pub mod policy;
pub mod rbac;
pub mod redact;
pub mod sanitize;
pub mod shadow;
pub mod spend;
pub mod teams;
