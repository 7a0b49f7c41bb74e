//! Server-selection policies.
//!
//! Each policy is a pure function over a snapshot of currently-Up backends
//! plus the per-query [`QueryContext`](crate::query::QueryContext): it
//! returns an index into the snapshot, or `None` when there is no healthy
//! backend to pick. No policy mutates pool state; counters move on the
//! caller's dispatch path.
//!
//! The weighted policies share one cumulative-weight walk. `wrandom` feeds
//! it a random draw, `whashed` feeds it the query-name hash, so the two
//! differ only in where the value comes from. `chashed` works on the pool's
//! precomputed sorted ring instead.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::Backend;

/// Rejection-sampling attempts for the bounded-load wrandom variant.
const WRANDOM_RETRIES: usize = 10;

/// Selection policy, chosen per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Rotate through Up backends with a per-pool counter.
    RoundRobin,
    /// Fewest in-flight queries, then lowest smoothed latency, then order.
    LeastOutstanding,
    /// First Up backend under its QPS cap; strict active/standby.
    FirstAvailable,
    /// Weight-proportional random choice.
    WRandom,
    /// Deterministic weight-proportional choice keyed on the query name.
    WHashed,
    /// Consistent-hash ring lookup keyed on the query name.
    CHashed,
}

impl Policy {
    /// Configuration name of this policy.
    pub fn name(self) -> &'static str {
        match self {
            Policy::RoundRobin => "roundrobin",
            Policy::LeastOutstanding => "leastOutstanding",
            Policy::FirstAvailable => "firstAvailable",
            Policy::WRandom => "wrandom",
            Policy::WHashed => "whashed",
            Policy::CHashed => "chashed",
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "roundrobin" => Ok(Policy::RoundRobin),
            "leastOutstanding" => Ok(Policy::LeastOutstanding),
            "firstAvailable" => Ok(Policy::FirstAvailable),
            "wrandom" => Ok(Policy::WRandom),
            "whashed" => Ok(Policy::WHashed),
            "chashed" => Ok(Policy::CHashed),
            other => Err(other.to_string()),
        }
    }
}

/// Shared selection tuning: the perturbation seed and the runtime-updatable
/// balancing factors.
///
/// The seed is fixed at startup. The factors are stored as f64 bits in
/// atomics so they can be adjusted while workers select.
#[derive(Debug)]
pub struct BalancerTuning {
    hash_perturbation: u32,
    weighted_balancing_factor: AtomicU64,
    consistent_hash_balancing_factor: AtomicU64,
    roundrobin_fail_on_empty: AtomicBool,
}

impl BalancerTuning {
    /// Create tuning with the given seed and factors disabled.
    pub fn new(hash_perturbation: u32) -> Self {
        Self {
            hash_perturbation,
            weighted_balancing_factor: AtomicU64::new(0f64.to_bits()),
            consistent_hash_balancing_factor: AtomicU64::new(0f64.to_bits()),
            roundrobin_fail_on_empty: AtomicBool::new(false),
        }
    }

    /// The global hash perturbation seed.
    pub fn hash_perturbation(&self) -> u32 {
        self.hash_perturbation
    }

    /// Bounded-load factor for the weighted policies; 0 disables it.
    pub fn weighted_balancing_factor(&self) -> f64 {
        f64::from_bits(self.weighted_balancing_factor.load(Ordering::Relaxed))
    }

    /// Update the weighted bounded-load factor.
    pub fn set_weighted_balancing_factor(&self, factor: f64) {
        self.weighted_balancing_factor
            .store(factor.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Bounded-load factor for chashed; 0 disables it.
    pub fn consistent_hash_balancing_factor(&self) -> f64 {
        f64::from_bits(self.consistent_hash_balancing_factor.load(Ordering::Relaxed))
    }

    /// Update the consistent-hash bounded-load factor.
    pub fn set_consistent_hash_balancing_factor(&self, factor: f64) {
        self.consistent_hash_balancing_factor
            .store(factor.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Whether round-robin reports no-server instead of wrapping when the
    /// Up set is empty. With Up-filtered snapshots both settings answer
    /// `None`; the knob is kept for config compatibility.
    pub fn roundrobin_fail_on_empty(&self) -> bool {
        self.roundrobin_fail_on_empty.load(Ordering::Relaxed)
    }

    /// Update the round-robin empty-set behavior.
    pub fn set_roundrobin_fail_on_empty(&self, fail: bool) {
        self.roundrobin_fail_on_empty.store(fail, Ordering::Relaxed);
    }
}

/// Round-robin: advance the pool counter and wrap over the Up set.
pub fn round_robin(backends: &[Arc<Backend>], counter: &AtomicU64) -> Option<usize> {
    if backends.is_empty() {
        return None;
    }
    let turn = counter.fetch_add(1, Ordering::Relaxed);
    Some((turn % backends.len() as u64) as usize)
}

/// First available: the first backend in order whose QPS gate admits the
/// query. When every backend is gated, traffic stays on the head.
pub fn first_available(backends: &[Arc<Backend>]) -> Option<usize> {
    if backends.is_empty() {
        return None;
    }
    backends
        .iter()
        .position(|b| b.qps_check_only())
        .or(Some(0))
}

/// Least outstanding: minimize `(outstanding, latency bucket, order)`.
///
/// Latency is bucketed to whole milliseconds so microsecond jitter cannot
/// dominate the tie-break. Remaining ties keep the earliest snapshot
/// position.
pub fn least_outstanding(backends: &[Arc<Backend>]) -> Option<usize> {
    if backends.is_empty() {
        return None;
    }
    if backends.len() == 1 {
        return Some(0);
    }

    let mut best = 0usize;
    let mut best_key = selection_key(&backends[0]);
    for (idx, backend) in backends.iter().enumerate().skip(1) {
        let key = selection_key(backend);
        if key < best_key {
            best_key = key;
            best = idx;
        }
    }
    Some(best)
}

fn selection_key(backend: &Backend) -> (u64, u64, i64) {
    (
        backend.outstanding(),
        backend.latency_ewma_us() as u64 / 1000,
        i64::from(backend.order()),
    )
}

/// Weighted random: sample uniformly over the cumulative weights.
///
/// With a balancing factor, draws landing on a backend past its load quota
/// are redrawn up to [`WRANDOM_RETRIES`] times before the last draw is
/// accepted anyway.
pub fn wrandom(backends: &[Arc<Backend>], factor: f64) -> Option<usize> {
    if backends.is_empty() {
        return None;
    }
    if factor <= 0.0 {
        return cumulative_pick(backends, rand::random::<u32>());
    }

    let quota = load_quota_per_weight(backends, factor);
    let mut picked = None;
    for _ in 0..WRANDOM_RETRIES {
        picked = cumulative_pick(backends, rand::random::<u32>());
        match picked {
            Some(idx) if !over_weighted_quota(&backends[idx], quota) => return picked,
            Some(_) => continue,
            None => return None,
        }
    }
    picked
}

/// Weighted hashed: the same cumulative walk as `wrandom`, but keyed on the
/// query-name hash so identical names always land on the same backend.
///
/// With a balancing factor, an over-quota choice advances to the next
/// backend in weight order, wrapping at most once around the set.
pub fn whashed(backends: &[Arc<Backend>], qname_hash: u32, factor: f64) -> Option<usize> {
    if backends.is_empty() {
        return None;
    }
    let initial = cumulative_pick(backends, qname_hash)?;
    if factor <= 0.0 {
        return Some(initial);
    }

    let quota = load_quota_per_weight(backends, factor);
    for step in 0..backends.len() {
        let idx = (initial + step) % backends.len();
        if !over_weighted_quota(&backends[idx], quota) {
            return Some(idx);
        }
    }
    Some(initial)
}

/// Consistent hashed: ceiling search over the pool's sorted ring, wrapping
/// to the first entry.
///
/// `ring` pairs each point hash with an index into `backends`. With a
/// balancing factor, a chosen backend whose outstanding count exceeds
/// `ceil(factor × total_outstanding / n_up)` is skipped by walking the ring
/// clockwise, capped at `n_up` steps before falling back to the initial
/// choice.
pub fn chashed(
    ring: &[(u32, usize)],
    backends: &[Arc<Backend>],
    qname_hash: u32,
    factor: f64,
) -> Option<usize> {
    if backends.is_empty() || ring.is_empty() {
        return None;
    }

    let mut pos = ring.partition_point(|(hash, _)| *hash < qname_hash);
    if pos == ring.len() {
        pos = 0;
    }
    let initial = ring[pos].1;
    if factor <= 0.0 {
        return Some(initial);
    }

    let total_outstanding: u64 = backends.iter().map(|b| b.outstanding()).sum();
    let quota = (factor * (total_outstanding as f64 / backends.len() as f64)).ceil();
    if backends[initial].outstanding() as f64 <= quota {
        return Some(initial);
    }

    let mut cursor = pos;
    for _ in 0..backends.len() {
        cursor = (cursor + 1) % ring.len();
        let candidate = ring[cursor].1;
        if backends[candidate].outstanding() as f64 <= quota {
            return Some(candidate);
        }
    }
    Some(initial)
}

/// Walk the cumulative weights and return the backend whose range contains
/// `val % total_weight`. The sum saturates so absurd weights cannot wrap.
fn cumulative_pick(backends: &[Arc<Backend>], val: u32) -> Option<usize> {
    let mut cumulative: Vec<u64> = Vec::with_capacity(backends.len());
    let mut sum: u64 = 0;
    for backend in backends {
        sum = sum.saturating_add(u64::from(backend.weight()));
        cumulative.push(sum);
    }
    if sum == 0 {
        return None;
    }

    let target = u64::from(val) % sum;
    let pos = cumulative.partition_point(|c| *c <= target);
    (pos < backends.len()).then_some(pos)
}

/// Per-weight-unit load quota: `factor × (1 + Σ outstanding) / Σ weight`.
/// The leading 1 accounts for the query being placed right now.
fn load_quota_per_weight(backends: &[Arc<Backend>], factor: f64) -> f64 {
    let mut current_load = 1.0;
    let mut total_weight: u64 = 0;
    for backend in backends {
        current_load += backend.outstanding() as f64;
        total_weight = total_weight.saturating_add(u64::from(backend.weight()));
    }
    if total_weight == 0 {
        return f64::MAX;
    }
    (current_load / total_weight as f64) * factor
}

fn over_weighted_quota(backend: &Backend, quota_per_weight: f64) -> bool {
    backend.outstanding() as f64 > quota_per_weight * f64::from(backend.weight())
}
