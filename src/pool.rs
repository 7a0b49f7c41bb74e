//! Named groups of backends sharing a selection policy.
//!
//! The hot path never walks the member list: `select()` loads one atomic
//! pointer to an immutable [`PoolSnapshot`] holding the currently-Up
//! members, the merged consistent-hash ring, and the total Up weight.
//! Membership changes and health transitions rebuild a fresh snapshot and
//! publish it with a single store; readers see either the old snapshot or
//! the new one, never a partially-rebuilt ring.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{Backend, BackendId};
use crate::policy::{self, BalancerTuning, Policy};
use crate::query::QueryContext;

/// Immutable view of a pool's Up members, published atomically.
#[derive(Debug)]
pub struct PoolSnapshot {
    /// Up members, stable-sorted by `(order, insertion_seq)`.
    pub members: Vec<Arc<Backend>>,
    /// Merged ring: `(point_hash, index into members)`, sorted by hash.
    pub ring: Vec<(u32, usize)>,
    /// Sum of weights over `members`.
    pub total_weight_up: u64,
}

impl PoolSnapshot {
    fn empty() -> Self {
        Self {
            members: Vec::new(),
            ring: Vec::new(),
            total_weight_up: 0,
        }
    }
}

/// A named, ordered collection of backends with a selection policy.
pub struct Pool {
    name: String,
    policy: RwLock<Policy>,
    rr_counter: AtomicU64,
    /// All members regardless of health, sorted by `(order, insertion_seq)`.
    members: RwLock<Vec<Arc<Backend>>>,
    snapshot: ArcSwap<PoolSnapshot>,
    tuning: Arc<BalancerTuning>,
}

impl Pool {
    /// Create an empty pool.
    pub fn new(name: impl Into<String>, policy: Policy, tuning: Arc<BalancerTuning>) -> Self {
        Self {
            name: name.into(),
            policy: RwLock::new(policy),
            rr_counter: AtomicU64::new(0),
            members: RwLock::new(Vec::new()),
            snapshot: ArcSwap::from_pointee(PoolSnapshot::empty()),
            tuning,
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current policy.
    pub fn policy(&self) -> Policy {
        *self.policy.read()
    }

    /// Swap the policy. Safe against concurrent selection; in-flight
    /// selections finish under the policy they read.
    pub fn set_policy(&self, policy: Policy) {
        *self.policy.write() = policy;
        debug!(pool = %self.name, policy = policy.name(), "pool policy changed");
    }

    /// Add a backend and rebuild caches. Members are kept stable-sorted by
    /// `(order, insertion_seq)` so policies see a deterministic sequence.
    pub fn add_backend(&self, backend: Arc<Backend>) {
        backend.recompute_ring_points(self.tuning.hash_perturbation());
        {
            let mut members = self.members.write();
            members.push(backend);
            members.sort_by_key(|b| (b.order(), b.insertion_seq()));
        }
        self.rebuild_caches();
    }

    /// Remove a backend by id and rebuild caches. Returns whether it was a
    /// member.
    pub fn remove_backend(&self, id: BackendId) -> bool {
        let removed = {
            let mut members = self.members.write();
            let before = members.len();
            members.retain(|b| b.id() != id);
            members.len() != before
        };
        if removed {
            self.rebuild_caches();
        }
        removed
    }

    /// Whether the backend is a member (any health state).
    pub fn contains(&self, id: BackendId) -> bool {
        self.members.read().iter().any(|b| b.id() == id)
    }

    /// All members regardless of health.
    pub fn members(&self) -> Vec<Arc<Backend>> {
        self.members.read().clone()
    }

    /// Rebuild the published snapshot from current members and health.
    ///
    /// Called on membership changes and on every Up/Down transition of a
    /// member. Allocates the new snapshot off the hot path and publishes it
    /// with one atomic store.
    pub fn rebuild_caches(&self) {
        let members = self.members.read();
        let up: Vec<Arc<Backend>> = members.iter().filter(|b| b.is_up()).cloned().collect();
        drop(members);

        let total_weight_up = up.iter().map(|b| u64::from(b.weight())).sum();
        let mut ring: Vec<(u32, usize)> = Vec::new();
        for (idx, backend) in up.iter().enumerate() {
            for point in backend.ring_points() {
                ring.push((point, idx));
            }
        }
        ring.sort_unstable();
        debug_assert!(ring.windows(2).all(|w| w[0] <= w[1]));

        debug!(
            pool = %self.name,
            up = up.len(),
            ring_points = ring.len(),
            total_weight_up,
            "rebuilt pool caches"
        );

        self.snapshot.store(Arc::new(PoolSnapshot {
            members: up,
            ring,
            total_weight_up,
        }));
    }

    /// Load the current snapshot (one atomic pointer read).
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Select a backend for the query, or `None` when no member is Up.
    pub fn select(&self, ctx: &QueryContext) -> Option<Arc<Backend>> {
        let snapshot = self.snapshot.load();
        if snapshot.members.is_empty() {
            return None;
        }

        let chosen = match self.policy() {
            Policy::RoundRobin => policy::round_robin(&snapshot.members, &self.rr_counter),
            Policy::FirstAvailable => policy::first_available(&snapshot.members),
            Policy::LeastOutstanding => policy::least_outstanding(&snapshot.members),
            Policy::WRandom => {
                policy::wrandom(&snapshot.members, self.tuning.weighted_balancing_factor())
            }
            Policy::WHashed => policy::whashed(
                &snapshot.members,
                ctx.qname_hash,
                self.tuning.weighted_balancing_factor(),
            ),
            Policy::CHashed => policy::chashed(
                &snapshot.ring,
                &snapshot.members,
                ctx.qname_hash,
                self.tuning.consistent_hash_balancing_factor(),
            ),
        };

        chosen.map(|idx| snapshot.members[idx].clone())
    }

    /// Count members, optionally restricted to Up ones.
    pub fn count_members(&self, up_only: bool) -> usize {
        if up_only {
            self.snapshot.load().members.len()
        } else {
            self.members.read().len()
        }
    }

    /// Sum of outstanding queries over all members.
    pub fn pool_load(&self) -> u64 {
        self.members.read().iter().map(|b| b.outstanding()).sum()
    }

    /// Whether at least one member is Up.
    pub fn has_available_backend(&self) -> bool {
        !self.snapshot.load().members.is_empty()
    }

    /// Read-only view for the admin snapshot.
    pub fn status(&self) -> PoolStatus {
        let snapshot = self.snapshot.load();
        let total = self.members.read().len();
        let up = snapshot.members.len();
        PoolStatus {
            name: self.name.clone(),
            policy: self.policy().name(),
            total_weight_up: snapshot.total_weight_up,
            up_count: up,
            down_count: total - up,
        }
    }
}

/// Read-only pool view returned by the admin snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Pool name.
    pub name: String,
    /// Active policy name.
    pub policy: &'static str,
    /// Sum of weights over Up members.
    pub total_weight_up: u64,
    /// Number of Up members.
    pub up_count: usize,
    /// Number of members not currently Up.
    pub down_count: usize,
}
