//! Metrics instrumentation for steer-dns.
//!
//! All metrics are prefixed with `steer_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::backend::HealthState;

/// Record a DNS query handled by the authority.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Success => "success",
        QueryResult::NxDomain => "nxdomain",
        QueryResult::ServFail => "servfail",
        QueryResult::Error => "error",
    };

    counter!("steer_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("steer_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Query returned records successfully.
    Success,
    /// Name not found.
    NxDomain,
    /// No healthy backend; SERVFAIL returned.
    ServFail,
    /// Query failed with an error.
    Error,
}

/// Record one selection attempt.
pub fn record_selection(
    pool: &str,
    policy: &str,
    outcome: SelectionOutcome,
    duration: std::time::Duration,
) {
    let outcome_str = match outcome {
        SelectionOutcome::Selected => "selected",
        SelectionOutcome::NoBackend => "no_backend",
    };

    counter!("steer_dns.selection.count", "pool" => pool.to_string(), "policy" => policy.to_string(), "outcome" => outcome_str)
        .increment(1);
    histogram!("steer_dns.selection.duration.seconds", "pool" => pool.to_string())
        .record(duration.as_secs_f64());
}

/// Selection outcome for metrics.
#[derive(Debug, Clone, Copy)]
pub enum SelectionOutcome {
    /// A backend was chosen.
    Selected,
    /// Every member was Down.
    NoBackend,
}

/// Record a backend health transition.
pub fn record_health_transition(backend: &str, to: HealthState) {
    let state_str = match to {
        HealthState::Up => "up",
        HealthState::Down => "down",
        HealthState::Probing => "probing",
    };
    counter!("steer_dns.health.transition.count", "backend" => backend.to_string(), "to" => state_str)
        .increment(1);
}

/// Record per-pool state gauges (call periodically or on change).
pub fn record_pool_state(pool: &str, up: usize, down: usize, total_weight_up: u64) {
    gauge!("steer_dns.pool.backends.up", "pool" => pool.to_string()).set(up as f64);
    gauge!("steer_dns.pool.backends.down", "pool" => pool.to_string()).set(down as f64);
    gauge!("steer_dns.pool.weight.up", "pool" => pool.to_string()).set(total_weight_up as f64);
}

/// Record per-backend state gauges.
pub fn record_backend_state(backend: &str, outstanding: u64, latency_ewma_us: f64) {
    gauge!("steer_dns.backend.outstanding", "backend" => backend.to_string())
        .set(outstanding as f64);
    gauge!("steer_dns.backend.latency_ewma_us", "backend" => backend.to_string())
        .set(latency_ewma_us);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
