//! Backend server state: identity, runtime counters, health flag, and the
//! precomputed consistent-hash ring contribution.
//!
//! A `Backend` is owned by the [`Balancer`](crate::balancer::Balancer)
//! registry; pools hold shared `Arc` handles. Everything the selection hot
//! path reads is either immutable configuration or an atomic, so worker
//! threads never contend on a backend.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::hash::jenkins_ci;
use crate::qps::QpsLimiter;

/// Runtime handle for a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BackendId(pub u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Health state as observed by the selection engine.
///
/// Only [`HealthState::Up`] backends are selectable. `Probing` marks a
/// backend with an in-flight recovery probe; it behaves as Down for
/// selection but is not itself a failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Selectable.
    Up,
    /// Excluded from selection.
    Down,
    /// Recovery probe outstanding; excluded from selection.
    Probing,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthState::Up,
            1 => HealthState::Down,
            _ => HealthState::Probing,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthState::Up => 0,
            HealthState::Down => 1,
            HealthState::Probing => 2,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => write!(f, "up"),
            HealthState::Down => write!(f, "down"),
            HealthState::Probing => write!(f, "probing"),
        }
    }
}

/// Outcome of a completed query, reported through the feedback API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The backend answered.
    Ok,
    /// The backend answered SERVFAIL.
    ServFail,
    /// The query timed out.
    Timeout,
}

impl ResponseOutcome {
    /// Whether this outcome counts as a failure for health purposes.
    pub fn is_failure(self) -> bool {
        !matches!(self, ResponseOutcome::Ok)
    }
}

/// Static configuration of one backend, resolved from the config file.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Stable identity, unique within the deployment. Used as the ring salt
    /// so ring points survive config reloads and process restarts.
    pub name: String,
    /// Transport address queries are steered to.
    pub address: SocketAddr,
    /// Priority group; lower is preferred.
    pub order: i32,
    /// Relative share for weighted policies. Always >= 1.
    pub weight: u32,
    /// Optional cap on accepted queries per second.
    pub qps_limit: Option<u32>,
}

/// Sliding window of recent dispatch outcomes, fed by the response path and
/// evaluated by the health monitor in lazy mode.
#[derive(Debug)]
pub(crate) struct LazyWindow {
    samples: VecDeque<bool>,
    capacity: usize,
}

impl LazyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, failure: bool) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(failure);
    }

    /// Failure ratio once the window has filled; `None` before that.
    pub(crate) fn failure_ratio(&self) -> Option<f64> {
        if self.samples.len() < self.capacity {
            return None;
        }
        let failures = self.samples.iter().filter(|f| **f).count();
        Some(failures as f64 / self.samples.len() as f64)
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
    }
}

/// One upstream server.
#[derive(Debug)]
pub struct Backend {
    id: BackendId,
    config: BackendConfig,
    insertion_seq: u64,
    weight: AtomicU32,
    pub(crate) outstanding: AtomicU64,
    queries: AtomicU64,
    reuseds: AtomicU64,
    timeouts: AtomicU64,
    /// EWMA of observed latency in microseconds, stored as f64 bits.
    latency_ewma_us: AtomicU64,
    ewma_alpha: f64,
    health: AtomicU8,
    ring_points: RwLock<Vec<u32>>,
    /// `(weight, perturbation)` of the last ring computation.
    ring_key: Mutex<Option<(u32, u32)>>,
    qps: Option<Mutex<QpsLimiter>>,
    lazy_window: Mutex<LazyWindow>,
}

impl Backend {
    /// Create a backend from resolved configuration.
    ///
    /// `insertion_seq` is the registration order, used as the stable
    /// tie-break after `order` when pools sort their members. `ewma_alpha`
    /// is clamped to [0.05, 0.2].
    pub fn new(
        id: BackendId,
        config: BackendConfig,
        insertion_seq: u64,
        ewma_alpha: f64,
        lazy_window_size: usize,
    ) -> Self {
        let qps = config.qps_limit.map(|rate| Mutex::new(QpsLimiter::new(rate)));
        let weight = config.weight.max(1);
        Self {
            id,
            insertion_seq,
            weight: AtomicU32::new(weight),
            outstanding: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            reuseds: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latency_ewma_us: AtomicU64::new(0f64.to_bits()),
            ewma_alpha: ewma_alpha.clamp(0.05, 0.2),
            health: AtomicU8::new(HealthState::Up.as_u8()),
            ring_points: RwLock::new(Vec::new()),
            ring_key: Mutex::new(None),
            qps,
            lazy_window: Mutex::new(LazyWindow::new(lazy_window_size)),
            config,
        }
    }

    /// Runtime handle of this backend.
    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Stable configured name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Address queries are steered to.
    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Priority group; lower is preferred.
    pub fn order(&self) -> i32 {
        self.config.order
    }

    /// Registration sequence, tie-break after `order`.
    pub fn insertion_seq(&self) -> u64 {
        self.insertion_seq
    }

    /// Current weight.
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Change the weight and rebuild ring points with the given seed.
    ///
    /// Owning pools must rebuild their caches afterwards; the balancer's
    /// `set_backend_weight` does both.
    pub fn set_weight(&self, new_weight: u32, perturbation: u32) {
        let clamped = new_weight.max(1);
        self.weight.store(clamped, Ordering::Relaxed);
        self.recompute_ring_points(perturbation);
    }

    /// Current health state.
    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Whether the backend is selectable.
    pub fn is_up(&self) -> bool {
        self.health() == HealthState::Up
    }

    /// Store a new health state. Written only by the health monitor.
    pub(crate) fn set_health(&self, state: HealthState) {
        self.health.store(state.as_u8(), Ordering::Release);
    }

    /// Dispatched-but-unanswered query count.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Total dispatched queries.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Responses that arrived after their slot had been reclaimed.
    pub fn reuseds(&self) -> u64 {
        self.reuseds.load(Ordering::Relaxed)
    }

    /// Timed-out queries.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Smoothed latency in microseconds. Torn reads are acceptable; the
    /// value is statistical.
    pub fn latency_ewma_us(&self) -> f64 {
        f64::from_bits(self.latency_ewma_us.load(Ordering::Relaxed))
    }

    /// Record a query dispatch: bumps `outstanding` and `queries`, and
    /// consumes a QPS token when a limiter is configured.
    pub fn record_dispatch(&self) {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);
        if let Some(qps) = &self.qps {
            qps.lock().account();
        }
    }

    /// Record a query completion.
    ///
    /// Decrements `outstanding`; a completion with no matching dispatch
    /// (the response raced the timeout reclaim) is counted in `reuseds`
    /// and otherwise ignored. Latency feeds the EWMA except on timeouts,
    /// which have no meaningful latency sample. Failures are pushed into
    /// the lazy-health window.
    pub fn record_response(&self, latency: Duration, outcome: ResponseOutcome) {
        let decremented = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        if decremented.is_err() {
            self.reuseds.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match outcome {
            ResponseOutcome::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ResponseOutcome::Ok | ResponseOutcome::ServFail => {
                self.observe_latency(latency.as_micros() as f64);
            }
        }

        self.lazy_window.lock().push(outcome.is_failure());
    }

    fn observe_latency(&self, latency_us: f64) {
        let current = f64::from_bits(self.latency_ewma_us.load(Ordering::Relaxed));
        let next = if current == 0.0 {
            latency_us
        } else {
            current + self.ewma_alpha * (latency_us - current)
        };
        self.latency_ewma_us.store(next.to_bits(), Ordering::Relaxed);
    }

    /// Whether the QPS gate currently admits a query. Backends without a
    /// limiter always pass. Does not consume a token.
    pub fn qps_check_only(&self) -> bool {
        match &self.qps {
            Some(qps) => qps.lock().check_only(),
            None => true,
        }
    }

    /// Rebuild the ring contribution: one point per weight unit, salted
    /// `name:i`, sorted. Skipped when `(weight, perturbation)` is unchanged
    /// since the last computation, so repeated calls are idempotent and
    /// cheap.
    pub fn recompute_ring_points(&self, perturbation: u32) {
        let weight = self.weight();
        let key = (weight, perturbation);
        let mut ring_key = self.ring_key.lock();
        if *ring_key == Some(key) {
            return;
        }

        let mut points = Vec::with_capacity(weight as usize);
        for i in 1..=weight {
            let salt = format!("{}:{}", self.config.name, i);
            points.push(jenkins_ci(salt.as_bytes(), perturbation));
        }
        points.sort_unstable();

        *self.ring_points.write() = points;
        *ring_key = Some(key);
    }

    /// Copy the current ring points (used by pool cache rebuilds).
    pub fn ring_points(&self) -> Vec<u32> {
        self.ring_points.read().clone()
    }

    /// Evaluate the lazy-health window; `None` until it has filled.
    pub(crate) fn lazy_failure_ratio(&self) -> Option<f64> {
        self.lazy_window.lock().failure_ratio()
    }

    /// Reset the lazy-health window (after a health transition, so stale
    /// samples do not immediately re-trigger).
    pub(crate) fn reset_lazy_window(&self) {
        self.lazy_window.lock().clear();
    }

    /// Coherent read-only view for admin/introspection.
    pub fn status(&self, pools: Vec<String>) -> BackendStatus {
        BackendStatus {
            id: self.id,
            name: self.config.name.clone(),
            address: self.config.address,
            health: self.health(),
            weight: self.weight(),
            order: self.config.order,
            qps_limit: self.config.qps_limit,
            queries: self.queries(),
            reuseds: self.reuseds(),
            timeouts: self.timeouts(),
            outstanding: self.outstanding(),
            latency_ewma_us: self.latency_ewma_us(),
            pools,
        }
    }
}

/// Read-only backend view returned by the admin snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    /// Runtime handle.
    pub id: BackendId,
    /// Configured name.
    pub name: String,
    /// Backend address.
    pub address: SocketAddr,
    /// Current health state.
    pub health: HealthState,
    /// Current weight.
    pub weight: u32,
    /// Priority group.
    pub order: i32,
    /// Configured QPS cap, if any.
    pub qps_limit: Option<u32>,
    /// Total dispatched queries.
    pub queries: u64,
    /// Late responses racing a timeout reclaim.
    pub reuseds: u64,
    /// Timed-out queries.
    pub timeouts: u64,
    /// In-flight queries.
    pub outstanding: u64,
    /// Smoothed latency in microseconds.
    pub latency_ewma_us: f64,
    /// Pools this backend belongs to.
    pub pools: Vec<String>,
}
