//! The policy data model: conditions, actions, rules, and the declarative
//! routing/redaction/guardrail types they carry.
//!
//! Policies are stored as JSONB in Postgres (`rules` column) and deserialized
//! straight into these types. `Condition` is tagged on `type`, `Action` is
//! tagged on `action` — this mirrors how policy authors write rules
//! (`"when": {"type": "always"}`, `"then": {"action": "redact", ...}`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// A named, phase-scoped set of rules evaluated against every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub phase: Phase,
    pub mode: PolicyMode,
    pub rules: Vec<Rule>,
    pub retry: Option<RetryConfig>,
}

/// Which leg of the request lifecycle a policy runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Post,
}

/// `Enforce` applies matched actions to the live request. `Shadow` records
/// what would have happened without affecting the request — equivalent to the
/// `Log` mode described for policy authors, which is just Shadow plus a
/// forced `Log` action in the rule body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Enforce,
    Shadow,
}

/// A single `condition -> actions` pair within a policy.
///
/// `then` accepts either a single action object or an array — older policies
/// and the guardrail preset builder both author one action per rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub when: Condition,
    #[serde(deserialize_with = "one_or_many_actions")]
    pub then: Vec<Action>,
}

fn one_or_many_actions<'de, D>(deserializer: D) -> Result<Vec<Action>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Action),
        Many(Vec<Action>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(a) => vec![a],
        OneOrMany::Many(v) => v,
    })
}

/// A boolean expression evaluated against the request/response context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always {
        always: bool,
    },
    Check {
        field: String,
        op: Operator,
        value: Value,
    },
    All {
        all: Vec<Condition>,
    },
    Any {
        any: Vec<Condition>,
    },
    Not {
        not: Box<Condition>,
    },
}

/// Comparison operators supported by `Condition::Check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Exists,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Glob,
    Regex,
    Contains,
    StartsWith,
    EndsWith,
}

/// The full, implementer-required action set. Every variant here is a
/// declarative effect the engine can apply once its guarding `Condition`
/// matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// No-op; terminates evaluation of the current policy's remaining rules
    /// is NOT implied — each rule is independent. Present for completeness
    /// and for authors who want an explicit "do nothing" branch.
    Allow,

    Deny {
        status: u16,
        message: String,
        #[serde(default)]
        code: Option<String>,
    },

    RateLimit {
        window: String,
        max_requests: u64,
        key: RateLimitKey,
    },

    Throttle {
        delay_ms: u64,
    },

    RequireApproval {
        timeout: String,
        fallback: ApprovalFallback,
        #[serde(default)]
        notify: Option<Vec<String>>,
    },

    Redact {
        direction: RedactDirection,
        patterns: Vec<String>,
        #[serde(default)]
        fields: Vec<String>,
        on_match: RedactOnMatch,
    },

    Transform {
        operations: Vec<TransformOp>,
    },

    Override {
        set_body_fields: Map<String, Value>,
    },

    Split {
        variants: Vec<SplitVariant>,
        #[serde(default)]
        experiment: Option<String>,
    },

    DynamicRoute {
        strategy: RoutingStrategy,
        pool: Vec<RouteTarget>,
        #[serde(default)]
        fallback: Option<RouteTarget>,
    },

    ConditionalRoute {
        branches: Vec<RouteBranch>,
        #[serde(default)]
        fallback: Option<RouteTarget>,
    },

    ContentFilter {
        #[serde(default)]
        block_jailbreak: bool,
        #[serde(default)]
        block_harmful: bool,
        #[serde(default)]
        block_code_injection: bool,
        #[serde(default)]
        topic_allowlist: Vec<String>,
        #[serde(default)]
        topic_denylist: Vec<String>,
        #[serde(default)]
        custom_patterns: Vec<String>,
        #[serde(default = "default_risk_threshold")]
        risk_threshold: f32,
        #[serde(default)]
        max_content_length: u32,
    },

    ExternalGuardrail {
        vendor: ExternalVendor,
        endpoint: String,
        #[serde(default)]
        api_key_env: Option<String>,
        threshold: f32,
        on_fail: String,
    },

    ToolScope {
        #[serde(default)]
        allowed_tools: Vec<String>,
        #[serde(default)]
        blocked_tools: Vec<String>,
        #[serde(default)]
        deny_message: Option<String>,
    },

    /// Response-phase only: validates the extracted completion content
    /// against a JSON schema. `not` inverts the result (deny on match rather
    /// than deny on mismatch), used to express "must not look like X".
    ValidateSchema {
        schema: Value,
        #[serde(default)]
        not: bool,
        #[serde(default)]
        message: Option<String>,
    },

    Webhook {
        url: String,
        timeout_ms: u64,
        on_fail: String,
    },

    /// Declarative override of the per-(token, upstream) circuit breaker
    /// defaults for upstreams touched by this rule.
    CircuitBreaker {
        failure_threshold: u32,
        recovery_cooldown_secs: u64,
        #[serde(default)]
        half_open_after_secs: Option<u64>,
    },

    Log {
        level: String,
        #[serde(default)]
        tags: HashMap<String, String>,
    },

    Tag {
        key: String,
        value: String,
    },
}

fn default_risk_threshold() -> f32 {
    0.5
}

/// The principal dimension a `RateLimit` counter is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    PerToken,
    PerAgent,
    PerIp,
    PerUser,
    Global,
}

/// What happens to a parked `RequireApproval` request once its timeout
/// elapses without an admin decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalFallback {
    Deny,
    Allow,
}

/// Which side of the exchange a `Redact` action inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactDirection {
    Request,
    Response,
    Both,
}

/// What to do once a `Redact` pattern matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactOnMatch {
    /// Destructively replace the match with a `[REDACTED_*]` placeholder.
    Redact,
    /// Deny the request/response outright.
    Block,
    /// Replace the match with an opaque vault token; plaintext is stored
    /// encrypted in the PII vault for later authorized lookup.
    Tokenize,
}

/// A single operation within `Action::Transform`, applied in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformOp {
    SetHeader { name: String, value: String },
    RemoveHeader { name: String },
    AppendSystemPrompt { text: String },
    PrependSystemPrompt { text: String },
    RegexReplace { pattern: String, replacement: String, global: bool },
    SetBodyField { path: String, value: Value },
    RemoveBodyField { path: String },
    AddToMessageList { role: String, content: String, position: String },
}

/// One weighted branch of an `Action::Split` A/B experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitVariant {
    pub weight: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub set_body_fields: Map<String, Value>,
}

/// A candidate upstream/model pair in a `DynamicRoute` pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub model: String,
    pub upstream_url: String,
    #[serde(default)]
    pub credential_id: Option<Uuid>,
    #[serde(default)]
    pub weight: Option<u32>,
}

/// How `DynamicRoute` picks a target from its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    Random,
    LowestCost,
    LowestLatency,
    Weighted,
    LeastBusy,
}

/// One branch of an `Action::ConditionalRoute` first-match chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBranch {
    pub condition: RouteCondition,
    pub target: RouteTarget,
}

/// A single field comparison used by `ConditionalRoute` branches.
///
/// `op` is a plain string (`exists|eq|neq|contains|starts_with|ends_with|regex`)
/// rather than the richer `Operator` enum used by the main policy engine,
/// since conditional routing only ever inspects the request body/headers,
/// never response data or usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCondition {
    pub field: String,
    pub op: String,
    pub value: Value,
}

/// Third-party content-safety vendors supported by `Action::ExternalGuardrail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalVendor {
    AzureContentSafety,
    AwsComprehend,
    LlamaGuard,
    PaloAltoAirs,
    PromptSecurity,
}

/// Retry policy for the upstream dispatcher. Applies to network errors and
/// any status code listed in `status_codes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub status_codes: Vec<u16>,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            status_codes: vec![429, 500, 502, 503, 504],
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter_ms: 100,
        }
    }
}

/// One action triggered by a matched rule, carrying enough of the owning
/// policy for audit logging and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredAction {
    pub policy_id: Uuid,
    pub policy_name: String,
    pub rule_index: usize,
    pub action: Action,
}

/// The result of evaluating a batch of policies for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub actions: Vec<TriggeredAction>,
    pub shadow_violations: Vec<String>,
}
</content>
