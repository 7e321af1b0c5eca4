use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::TieredCache;

/// Fields from the request body that form the cache key.
/// We normalize and hash these so identical prompts always hit cache.
const CACHE_KEY_FIELDS: &[&str] = &["model", "messages", "temperature", "max_tokens", "tools", "tool_choice"];

/// Default cache TTL: 5 minutes.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// A cached LLM response stored in Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub model: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Compute a deterministic cache key from the relevant request body fields.
/// Returns `None` if the body doesn't contain enough info to cache (e.g., no model).
pub fn compute_cache_key(
    token_id: &str,
    body: &serde_json::Value,
) -> Option<String> {
    let obj = body.as_object()?;

    // Must have at least a model to cache
    obj.get("model")?.as_str()?;

    // Build a canonical JSON object with only the cache-relevant fields
    let mut canonical = serde_json::Map::new();
    for &field in CACHE_KEY_FIELDS {
        if let Some(val) = obj.get(field) {
            canonical.insert(field.to_string(), val.clone());
        }
    }

    // Sort keys for deterministic serialization (serde_json::Map is BTreeMap-backed)
    let canonical_json = serde_json::to_string(&serde_json::Value::Object(canonical))
        .ok()?;

    let mut hasher = Sha256::new();
    hasher.update(token_id.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_json.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Some(format!("llm_cache:{}", hash))
}

/// Attempt to retrieve a cached response.
pub async fn get_cached(cache: &TieredCache, key: &str) -> Option<CachedResponse> {
    cache.get::<CachedResponse>(key).await
}

/// Maximum size of a single cached response (256 KB).
/// Responses larger than this are not cached to prevent Redis memory exhaustion.
const MAX_CACHE_ENTRY_BYTES: usize = 256 * 1024;

/// Store a response in cache with the given TTL.
/// Silently skips caching if the serialized response exceeds MAX_CACHE_ENTRY_BYTES.
pub async fn set_cached(
    cache: &TieredCache,
    key: &str,
    response: &CachedResponse,
    ttl_secs: u64,
) {
    // Serialize first to check size before writing to Redis
    let serialized = match serde_json::to_vec(response) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to serialize cache entry: {}", e);
            return;
        }
    };

    if serialized.len() > MAX_CACHE_ENTRY_BYTES {
        tracing::debug!(
            key = key,
            size_bytes = serialized.len(),
            limit_bytes = MAX_CACHE_ENTRY_BYTES,
            "skipping cache — response exceeds size limit"
        );
        return;
    }

    if let Err(e) = cache.set(key, response, ttl_secs).await {
        tracing::warn!("Failed to cache response: {}", e);
    }
}

/// Check if caching should be skipped for this request.
///
/// Skips caching when:
/// - `x-ailink-no-cache: true` header is present (explicit opt-out)
/// - `Cache-Control: no-cache` / `no-store` header is present
/// - `temperature > 0.1` in the request body (non-deterministic — caching is misleading)
/// - `stream: true` in the request body (streaming responses cannot be cached)
pub fn should_skip_cache(headers: &axum::http::HeaderMap, body: Option<&serde_json::Value>) -> bool {
    // Explicit opt-out
    if headers
        .get("x-ailink-no-cache")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
    {
        return true;
    }

    // Standard Cache-Control: no-cache / no-store
    if let Some(cc) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
        let lower = cc.to_lowercase();
        if lower.contains("no-cache") || lower.contains("no-store") {
            return true;
        }
    }

    // Body-based skips (temperature > 0.1 or streaming)
    if let Some(body) = body {
        // Skip non-deterministic requests — caller expects varied output
        if let Some(temp) = body.get("temperature").and_then(|v| v.as_f64()) {
            if temp > 0.1 {
                tracing::debug!(temperature = temp, "skipping cache: temperature > 0.1");
                return true;
            }
        }
        // Streaming responses cannot be cached
        if body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false) {
            return true;
        }
    }

    false
}

// ── Tests ───────────────────────────────────────────────────────
