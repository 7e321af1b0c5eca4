use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// An upstream target parsed from the token's `upstreams` JSONB array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTarget {
    pub url: String,
    pub credential_id: Option<Uuid>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_weight() -> u32 { 100 }
fn default_priority() -> u32 { 1 }

// ── Circuit Breaker Config ─────────────────────────────────────

/// Per-token circuit breaker configuration.
/// Stored as JSONB on the `tokens` table. Missing fields use defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Master toggle — when false, all health checks are skipped (simple round-robin).
    #[serde(default = "default_cb_enabled")]
    pub enabled: bool,
    /// Number of consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to wait before trying an unhealthy upstream again (half-open state).
    #[serde(default = "default_recovery_secs")]
    pub recovery_cooldown_secs: u64,
    /// Max requests to allow through in half-open state before deciding recovery.
    #[serde(default = "default_half_open_max")]
    pub half_open_max_requests: u32,
}

fn default_cb_enabled() -> bool { true }
fn default_failure_threshold() -> u32 { 3 }
fn default_recovery_secs() -> u64 { 30 }
fn default_half_open_max() -> u32 { 1 }

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_cooldown_secs: default_recovery_secs(),
            half_open_max_requests: default_half_open_max(),
        }
    }
}

/// Health state for a single upstream endpoint.
#[derive(Debug)]
struct UpstreamHealth {
    url: String,
    is_healthy: bool,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// In-memory loadbalancer with circuit-breaker health tracking.
/// Uses weighted round-robin within priority tiers and automatic failover.
pub struct LoadBalancer {
    /// Per-token health status: token_id → Vec<UpstreamHealth>
    health: DashMap<String, Vec<UpstreamHealth>>,
    /// Per-token round-robin counter
    counters: DashMap<String, Arc<AtomicU64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            health: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Select the best upstream target using weighted round-robin within priority tiers.
    /// Returns the index into the `upstreams` slice, or `None` if all are unhealthy.
    /// When `config.enabled` is false, bypasses health checks and uses simple round-robin.
    pub fn select(&self, token_id: &str, upstreams: &[UpstreamTarget], config: &CircuitBreakerConfig) -> Option<usize> {
        tracing::info!(token_id = token_id, upstream_count = upstreams.len(), cb_enabled = config.enabled, "LoadBalancer::select called");

        // When CB is disabled, skip all health tracking and do simple round-robin.
        if !config.enabled {
            if upstreams.is_empty() { return None; }
            if upstreams.len() == 1 { return Some(0); }
            let counter = self.counters
                .entry(token_id.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)));
            let idx = counter.fetch_add(1, Ordering::Relaxed) as usize % upstreams.len();
            return Some(idx);
        }
        if upstreams.is_empty() {
            return None;
        }
        if upstreams.len() == 1 {
            // Still track health for single-upstream tokens so get_all_status() works
            self.ensure_health(token_id, upstreams);
            return Some(0);
        }

        // Pass cooldown parameter into health checks
        let cooldown = config.recovery_cooldown_secs;

        // Ensure health entries exist
        self.ensure_health(token_id, upstreams);

        // Get health snapshot
        let health = self.health.get(token_id);
        let health_vec = health.as_ref().map(|h| h.value());

        // Find the highest priority tier (lowest number) that has healthy upstreams
        let mut priorities: Vec<u32> = upstreams.iter().map(|u| u.priority).collect();
        priorities.sort();
        priorities.dedup();

        for priority in priorities {
            let candidates: Vec<(usize, &UpstreamTarget)> = upstreams
                .iter()
                .enumerate()
                .filter(|(i, u)| {
                    u.priority == priority && self.is_healthy_at(health_vec, *i, &u.url, cooldown)
                })
                .collect();

            if candidates.is_empty() {
                continue; // all upstreams at this priority are unhealthy, try next tier
            }

            // Weighted round-robin among candidates
            let counter = self
                .counters
                .entry(token_id.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)));
            let round = counter.fetch_add(1, Ordering::Relaxed);

            // Build weight table
            let total_weight: u32 = candidates.iter().map(|(_, u)| u.weight).sum();
            if total_weight == 0 {
                return candidates.first().map(|(i, _)| *i);
            }

            let target = (round % total_weight as u64) as u32;
            let mut cumulative = 0u32;
            for (idx, upstream) in &candidates {
                cumulative += upstream.weight;
                if target < cumulative {
                    return Some(*idx);
                }
            }

            // Fallback: first candidate
            return candidates.first().map(|(i, _)| *i);
        }

        // All tiers exhausted — try recovery on highest priority
        // Return the first upstream that has cooled down
        for (i, upstream) in upstreams.iter().enumerate() {
            if self.check_recovery(token_id, &upstream.url, cooldown) {
                return Some(i);
            }
        }

        None
    }

    /// Mark an upstream as failed. Opens the circuit once `config.failure_threshold` failures accumulate.
    /// No-op when CB is disabled (`config.enabled == false`).
    pub fn mark_failed(&self, token_id: &str, url: &str, config: &CircuitBreakerConfig) {
        if !config.enabled {
            return;
        }
        if let Some(mut healths) = self.health.get_mut(token_id) {
            if let Some(h) = healths.iter_mut().find(|h| h.url == url) {
                h.failure_count += 1;
                h.last_failure = Some(Instant::now());
                if h.failure_count >= config.failure_threshold {
                    h.is_healthy = false;
                    tracing::warn!(
                        token_id = token_id,
                        url = url,
                        failures = h.failure_count,
                        threshold = config.failure_threshold,
                        "circuit breaker OPENED: upstream marked unhealthy"
                    );
                }
            }
        }
    }

    /// Mark an upstream as healthy. Resets the circuit breaker.
    pub fn mark_healthy(&self, token_id: &str, url: &str) {
        if let Some(mut healths) = self.health.get_mut(token_id) {
            if let Some(h) = healths.iter_mut().find(|h| h.url == url) {
                if !h.is_healthy {
                    tracing::info!(
                        token_id = token_id,
                        url = url,
                        "circuit breaker CLOSED: upstream recovered"
                    );
                }
                h.is_healthy = true;
                h.failure_count = 0;
                h.last_failure = None;
            }
        }
    }

    /// Ensure health entries exist for the token's upstreams.
    fn ensure_health(&self, token_id: &str, upstreams: &[UpstreamTarget]) {
        self.health.entry(token_id.to_string()).or_insert_with(|| {
            tracing::info!(token_id = token_id, "Initializing health map for token");
            upstreams
                .iter()
                .map(|u| UpstreamHealth {
                    url: u.url.clone(),
                    is_healthy: true,
                    failure_count: 0,
                    last_failure: None,
                })
                .collect()
        });
    }

    /// Check if an upstream at a given index is considered healthy.
    fn is_healthy_at(
        &self,
        health_vec: Option<&Vec<UpstreamHealth>>,
        idx: usize,
        url: &str,
        cooldown_secs: u64,
    ) -> bool {
        if let Some(healths) = health_vec {
            if let Some(h) = healths.iter().find(|h| h.url == url) {
                if h.is_healthy {
                    return true;
                }
                // Check if cooldown has passed (half-open state)
                if let Some(last) = h.last_failure {
                    if last.elapsed().as_secs() >= cooldown_secs {
                        return true; // allow retry (half-open)
                    }
                }
                return false;
            }
        }
        // No health data — assume healthy
        let _ = idx;
        true
    }

    /// Check if an unhealthy upstream has cooled down enough for a recovery attempt.
    fn check_recovery(&self, token_id: &str, url: &str, cooldown_secs: u64) -> bool {
        if let Some(healths) = self.health.get(token_id) {
            if let Some(h) = healths.iter().find(|h| h.url == url) {
                if let Some(last) = h.last_failure {
                    return last.elapsed().as_secs() >= cooldown_secs;
                }
            }
        }
        true
    }

    /// Get the circuit breaker state for a specific upstream.
    /// Returns `"closed"` (healthy), `"open"` (unhealthy), or `"half_open"` (cooling down).
    /// Returns `"closed"` if no health data exists yet.
    pub fn get_circuit_state(&self, token_id: &str, url: &str, cooldown_secs: u64) -> &'static str {
        if let Some(healths) = self.health.get(token_id) {
            if let Some(h) = healths.iter().find(|h| h.url == url) {
                if h.is_healthy {
                    return "closed";
                }
                if let Some(last) = h.last_failure {
                    if last.elapsed().as_secs() >= cooldown_secs {
                        return "half_open";
                    }
                }
                return "open";
            }
        }
        "closed"
    }
}

/// Parse upstreams from token JSONB. Returns empty vec if null or invalid.
pub fn parse_upstreams(upstreams_json: Option<&serde_json::Value>) -> Vec<UpstreamTarget> {
    match upstreams_json {
        Some(val) => serde_json::from_value::<Vec<UpstreamTarget>>(val.clone()).unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Status snapshot of a single upstream (for dashboard API).
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub token_id: String,
    pub url: String,
    pub is_healthy: bool,
    pub failure_count: u32,
    pub cooldown_remaining_secs: Option<u64>,
}

impl LoadBalancer {
    /// Return a snapshot of all tracked upstream health status.
    pub fn get_all_status(&self) -> Vec<UpstreamStatus> {
        tracing::info!(map_size = self.health.len(), "LoadBalancer::get_all_status called");
        let mut statuses = Vec::new();
        for entry in self.health.iter() {
            let token_id = entry.key().clone();
            for h in entry.value().iter() {
                let cooldown = if !h.is_healthy {
                    h.last_failure.map(|lf| {
                        let elapsed = lf.elapsed().as_secs();
                        let default_cooldown = default_recovery_secs();
                        if elapsed < default_cooldown {
                            default_cooldown - elapsed
                        } else {
                            0
                        }
                    })
                } else {
                    None
                };

                statuses.push(UpstreamStatus {
                    token_id: token_id.clone(),
                    url: h.url.clone(),
                    is_healthy: h.is_healthy,
                    failure_count: h.failure_count,
                    cooldown_remaining_secs: cooldown,
                });
            }
        }
        statuses
    }
}

// ── Tests ───────────────────────────────────────────────────────
