//! The data-plane proxy: request handling, upstream dispatch, streaming,
//! load balancing, retries, and cross-provider translation.

pub mod handler;
pub mod loadbalancer;
pub mod model_router;
pub mod realtime;
pub mod response_cache;
pub mod retry;
pub mod sigv4;
pub mod smart_router;
pub mod stream;
pub mod stream_bridge;
pub mod transform;
pub mod upstream;
