//! The backend registry and the selection/feedback API surface.
//!
//! A [`Balancer`] owns every [`Backend`] and [`Pool`]; pools hold shared
//! handles into the registry. The DNS receive path calls [`Balancer::select`]
//! per query, dispatchers report through [`Balancer::record_dispatch`] /
//! [`Balancer::record_response`], and the health monitor applies state
//! transitions through [`Balancer::apply_health_transition`]. The handle is
//! cheap to clone and share across tasks.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{
    Backend, BackendConfig, BackendId, BackendStatus, HealthState, ResponseOutcome,
};
use crate::config::Config;
use crate::error::{ConfigError, SteerError};
use crate::metrics::{self, SelectionOutcome, Timer};
use crate::policy::{BalancerTuning, Policy};
use crate::pool::{Pool, PoolStatus};
use crate::query::QueryContext;

/// Minimum gap between no-backend warnings for one pool.
const NO_BACKEND_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of one selection call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectResult {
    /// A healthy backend was chosen.
    Backend(SelectedBackend),
    /// Every member of the pool is Down; the caller must answer SERVFAIL.
    NoBackend,
}

/// The chosen backend and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedBackend {
    /// Registry handle of the chosen backend.
    pub id: BackendId,
    /// Address to steer the client to.
    pub address: SocketAddr,
    /// Name of the policy that made the decision.
    pub reason: &'static str,
}

/// Thread-safe backend registry and pool directory.
#[derive(Clone)]
pub struct Balancer {
    inner: Arc<BalancerInner>,
}

struct BalancerInner {
    backends: RwLock<HashMap<BackendId, Arc<Backend>>>,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    tuning: Arc<BalancerTuning>,
    next_seq: AtomicU64,
    /// Bumped on registry and health changes; feeds the zone SOA serial.
    generation: AtomicU64,
    ewma_alpha: f64,
    lazy_window: usize,
    no_backend_logged: Mutex<HashMap<String, Instant>>,
}

impl Balancer {
    /// Create an empty registry with the given tuning.
    pub fn new(tuning: BalancerTuning) -> Self {
        Self::with_options(tuning, 0.1, 100)
    }

    /// Create an empty registry with explicit EWMA smoothing and lazy
    /// window size (normally taken from configuration).
    pub fn with_options(tuning: BalancerTuning, ewma_alpha: f64, lazy_window: usize) -> Self {
        Self {
            inner: Arc::new(BalancerInner {
                backends: RwLock::new(HashMap::new()),
                pools: RwLock::new(HashMap::new()),
                tuning: Arc::new(tuning),
                next_seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                ewma_alpha,
                lazy_window,
                no_backend_logged: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Build a registry from validated configuration: every pool created,
    /// every server registered, ring points computed. Fails before any
    /// listener binds when the configuration is invalid.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let perturbation = config
            .balancer
            .hash_perturbation
            .unwrap_or_else(rand::random);
        let tuning = BalancerTuning::new(perturbation);
        tuning.set_weighted_balancing_factor(config.balancer.weighted_balancing_factor);
        tuning.set_consistent_hash_balancing_factor(
            config.balancer.consistent_hash_balancing_factor,
        );
        tuning.set_roundrobin_fail_on_empty(config.balancer.roundrobin_fail_on_empty);

        let balancer = Self::with_options(
            tuning,
            config.balancer.latency_ewma_alpha,
            config.health.lazy_window,
        );

        for pool_config in &config.pools {
            let policy = Policy::from_str(&pool_config.policy)
                .map_err(ConfigError::UnknownPolicy)?;
            let pool = balancer.create_pool(&pool_config.name, policy);

            for server in &pool_config.servers {
                let backend = balancer.register_backend(BackendConfig {
                    name: server.identity(),
                    address: server.address,
                    order: server.order,
                    weight: server.weight as u32,
                    qps_limit: server.qps_limit,
                });
                pool.add_backend(backend);
            }

            info!(
                pool = %pool_config.name,
                policy = %pool_config.policy,
                servers = pool_config.servers.len(),
                "configured pool"
            );
        }

        Ok(balancer)
    }

    /// The shared tuning handle.
    pub fn tuning(&self) -> Arc<BalancerTuning> {
        self.inner.tuning.clone()
    }

    /// Register a backend. Ring points are computed immediately so pool
    /// rebuilds never observe an empty contribution.
    pub fn register_backend(&self, config: BackendConfig) -> Arc<Backend> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let backend = Arc::new(Backend::new(
            BackendId(seq),
            config,
            seq,
            self.inner.ewma_alpha,
            self.inner.lazy_window,
        ));
        backend.recompute_ring_points(self.inner.tuning.hash_perturbation());

        debug!(
            backend = %backend.name(),
            address = %backend.address(),
            weight = backend.weight(),
            order = backend.order(),
            "registered backend"
        );
        self.inner
            .backends
            .write()
            .insert(backend.id(), backend.clone());
        self.bump_generation();
        backend
    }

    /// Monotonic change counter, used as the zone SOA serial.
    pub fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::Relaxed) as u32
    }

    fn bump_generation(&self) {
        self.inner.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a backend from the registry and every pool holding it.
    pub fn remove_backend(&self, id: BackendId) -> bool {
        let removed = self.inner.backends.write().remove(&id).is_some();
        if removed {
            for pool in self.inner.pools.read().values() {
                pool.remove_backend(id);
            }
            self.bump_generation();
        }
        removed
    }

    /// Create (or return) the pool with this name.
    pub fn create_pool(&self, name: &str, policy: Policy) -> Arc<Pool> {
        let mut pools = self.inner.pools.write();
        pools
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Pool::new(name, policy, self.inner.tuning.clone()))
            })
            .clone()
    }

    /// Look up a pool.
    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.inner.pools.read().get(name).cloned()
    }

    /// Look up a backend.
    pub fn backend(&self, id: BackendId) -> Option<Arc<Backend>> {
        self.inner.backends.read().get(&id).cloned()
    }

    /// All registered backends.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.inner.backends.read().values().cloned().collect()
    }

    /// Select a backend from `pool_name` for the given query.
    ///
    /// Builds the per-query context (name and client hashes with the
    /// global perturbation), snapshots the pool, and runs its policy.
    /// `NoBackend` means every member is Down; the DNS edge answers
    /// SERVFAIL.
    pub fn select(
        &self,
        pool_name: &str,
        qname: &str,
        client: IpAddr,
        qtype: u16,
    ) -> Result<SelectResult, SteerError> {
        let timer = Timer::start();
        let pool = self
            .pool(pool_name)
            .ok_or_else(|| SteerError::UnknownPool(pool_name.to_string()))?;

        let ctx = QueryContext::new(
            qname,
            client,
            qtype,
            1, // IN
            self.inner.tuning.hash_perturbation(),
        );

        match pool.select(&ctx) {
            Some(backend) => {
                let policy = pool.policy().name();
                metrics::record_selection(pool_name, policy, SelectionOutcome::Selected, timer.elapsed());
                Ok(SelectResult::Backend(SelectedBackend {
                    id: backend.id(),
                    address: backend.address(),
                    reason: policy,
                }))
            }
            None => {
                self.note_no_backend(pool_name);
                metrics::record_selection(
                    pool_name,
                    pool.policy().name(),
                    SelectionOutcome::NoBackend,
                    timer.elapsed(),
                );
                Ok(SelectResult::NoBackend)
            }
        }
    }

    /// Rate-limited warning for a pool with no Up member.
    fn note_no_backend(&self, pool_name: &str) {
        let mut logged = self.inner.no_backend_logged.lock();
        let now = Instant::now();
        let due = logged
            .get(pool_name)
            .map_or(true, |last| now.duration_since(*last) >= NO_BACKEND_LOG_INTERVAL);
        if due {
            logged.insert(pool_name.to_string(), now);
            warn!(pool = %pool_name, "no healthy backend available");
        }
    }

    /// Report a query dispatch to a backend.
    pub fn record_dispatch(&self, id: BackendId) -> Result<(), SteerError> {
        let backend = self.backend(id).ok_or(SteerError::UnknownBackend(id))?;
        backend.record_dispatch();
        Ok(())
    }

    /// Report a query completion for a backend.
    pub fn record_response(
        &self,
        id: BackendId,
        latency: Duration,
        outcome: ResponseOutcome,
    ) -> Result<(), SteerError> {
        let backend = self.backend(id).ok_or(SteerError::UnknownBackend(id))?;
        backend.record_response(latency, outcome);
        Ok(())
    }

    /// Change a backend's weight and rebuild the caches of every pool
    /// holding it.
    pub fn set_backend_weight(&self, id: BackendId, weight: u32) -> Result<(), SteerError> {
        let backend = self.backend(id).ok_or(SteerError::UnknownBackend(id))?;
        backend.set_weight(weight, self.inner.tuning.hash_perturbation());
        self.rebuild_pools_containing(id);
        Ok(())
    }

    /// Apply a health transition decided by the health monitor.
    ///
    /// Pools are rebuilt only when selectability actually changed, so a
    /// Down backend moving to Probing does not churn snapshots.
    pub fn apply_health_transition(&self, id: BackendId, state: HealthState) {
        let Some(backend) = self.backend(id) else {
            return;
        };
        let previous = backend.health();
        if previous == state {
            return;
        }

        backend.set_health(state);
        let selectable_changed =
            (previous == HealthState::Up) != (state == HealthState::Up);

        if selectable_changed {
            info!(
                backend = %backend.name(),
                address = %backend.address(),
                from = %previous,
                to = %state,
                "backend health transition"
            );
            metrics::record_health_transition(backend.name(), state);
            self.rebuild_pools_containing(id);
            self.bump_generation();
        } else {
            debug!(
                backend = %backend.name(),
                from = %previous,
                to = %state,
                "backend health state updated"
            );
        }
    }

    fn rebuild_pools_containing(&self, id: BackendId) {
        for pool in self.inner.pools.read().values() {
            if pool.contains(id) {
                pool.rebuild_caches();
            }
        }
    }

    /// Read-only snapshot for admin/introspection.
    pub fn status(&self) -> BalancerStatus {
        let pools = self.inner.pools.read();
        let mut pool_statuses: Vec<PoolStatus> = pools.values().map(|p| p.status()).collect();
        pool_statuses.sort_by(|a, b| a.name.cmp(&b.name));

        let mut backend_statuses: Vec<BackendStatus> = self
            .inner
            .backends
            .read()
            .values()
            .map(|backend| {
                let mut member_of: Vec<String> = pools
                    .values()
                    .filter(|pool| pool.contains(backend.id()))
                    .map(|pool| pool.name().to_string())
                    .collect();
                member_of.sort();
                backend.status(member_of)
            })
            .collect();
        backend_statuses.sort_by_key(|status| status.id);

        BalancerStatus {
            pools: pool_statuses,
            backends: backend_statuses,
        }
    }

    /// Emit the periodic state gauges.
    pub fn emit_metrics(&self) {
        for pool in self.inner.pools.read().values() {
            let status = pool.status();
            metrics::record_pool_state(
                &status.name,
                status.up_count,
                status.down_count,
                status.total_weight_up,
            );
        }
        for backend in self.inner.backends.read().values() {
            metrics::record_backend_state(
                backend.name(),
                backend.outstanding(),
                backend.latency_ewma_us(),
            );
        }
    }
}

/// Full admin snapshot: pools and backends.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStatus {
    /// Per-pool summaries.
    pub pools: Vec<PoolStatus>,
    /// Per-backend detail.
    pub backends: Vec<BackendStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_balancer() -> Balancer {
        Balancer::new(BalancerTuning::new(42))
    }

    fn server(name: &str, last_octet: u8, order: i32, weight: u32) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            address: format!("192.0.2.{last_octet}:53").parse().unwrap(),
            order,
            weight,
            qps_limit: None,
        }
    }

    #[test]
    fn test_select_from_registered_pool() {
        let balancer = test_balancer();
        let pool = balancer.create_pool("web", Policy::RoundRobin);
        pool.add_backend(balancer.register_backend(server("a", 10, 1, 1)));

        let result = balancer
            .select("web", "x.lb.example.com", "198.51.100.1".parse().unwrap(), 1)
            .unwrap();
        match result {
            SelectResult::Backend(selected) => {
                assert_eq!(selected.address, "192.0.2.10:53".parse().unwrap());
                assert_eq!(selected.reason, "roundrobin");
            }
            SelectResult::NoBackend => panic!("expected a backend"),
        }
    }

    #[test]
    fn test_select_unknown_pool_errors() {
        let balancer = test_balancer();
        let err = balancer
            .select("nope", "x.example.com", "198.51.100.1".parse().unwrap(), 1)
            .unwrap_err();
        assert!(matches!(err, SteerError::UnknownPool(_)));
    }

    #[test]
    fn test_select_no_backend_when_all_down() {
        let balancer = test_balancer();
        let pool = balancer.create_pool("web", Policy::RoundRobin);
        let backend = balancer.register_backend(server("a", 10, 1, 1));
        pool.add_backend(backend.clone());

        balancer.apply_health_transition(backend.id(), HealthState::Down);

        let result = balancer
            .select("web", "x.lb.example.com", "198.51.100.1".parse().unwrap(), 1)
            .unwrap();
        assert_eq!(result, SelectResult::NoBackend);
    }

    #[test]
    fn test_health_transition_rebuilds_pools() {
        let balancer = test_balancer();
        let pool = balancer.create_pool("web", Policy::CHashed);
        let a = balancer.register_backend(server("a", 10, 1, 2));
        let b = balancer.register_backend(server("b", 11, 1, 2));
        pool.add_backend(a.clone());
        pool.add_backend(b.clone());
        assert_eq!(pool.snapshot().ring.len(), 4);

        balancer.apply_health_transition(a.id(), HealthState::Down);
        assert_eq!(pool.snapshot().ring.len(), 2);
        assert_eq!(pool.snapshot().members.len(), 1);

        balancer.apply_health_transition(a.id(), HealthState::Up);
        assert_eq!(pool.snapshot().ring.len(), 4);
    }

    #[test]
    fn test_down_to_probing_does_not_rebuild() {
        let balancer = test_balancer();
        let pool = balancer.create_pool("web", Policy::RoundRobin);
        let a = balancer.register_backend(server("a", 10, 1, 1));
        pool.add_backend(a.clone());

        balancer.apply_health_transition(a.id(), HealthState::Down);
        let snapshot = pool.snapshot();
        balancer.apply_health_transition(a.id(), HealthState::Probing);
        // same snapshot instance: no rebuild happened
        assert!(Arc::ptr_eq(&snapshot, &pool.snapshot()));
    }

    #[test]
    fn test_feedback_roundtrip() {
        let balancer = test_balancer();
        let backend = balancer.register_backend(server("a", 10, 1, 1));

        balancer.record_dispatch(backend.id()).unwrap();
        assert_eq!(backend.outstanding(), 1);
        balancer
            .record_response(backend.id(), Duration::from_micros(300), ResponseOutcome::Ok)
            .unwrap();
        assert_eq!(backend.outstanding(), 0);

        assert!(balancer.record_dispatch(BackendId(999)).is_err());
    }

    #[test]
    fn test_remove_backend_clears_pools() {
        let balancer = test_balancer();
        let pool = balancer.create_pool("web", Policy::RoundRobin);
        let a = balancer.register_backend(server("a", 10, 1, 1));
        pool.add_backend(a.clone());

        assert!(balancer.remove_backend(a.id()));
        assert!(!pool.contains(a.id()));
        assert!(balancer.backend(a.id()).is_none());
        assert!(!balancer.remove_backend(a.id()));
    }

    #[test]
    fn test_set_backend_weight_rebuilds_ring() {
        let balancer = test_balancer();
        let pool = balancer.create_pool("web", Policy::CHashed);
        let a = balancer.register_backend(server("a", 10, 1, 1));
        pool.add_backend(a.clone());
        assert_eq!(pool.snapshot().ring.len(), 1);

        balancer.set_backend_weight(a.id(), 5).unwrap();
        assert_eq!(pool.snapshot().ring.len(), 5);
        assert_eq!(pool.snapshot().total_weight_up, 5);
    }

    #[test]
    fn test_status_reports_membership() {
        let balancer = test_balancer();
        let web = balancer.create_pool("web", Policy::RoundRobin);
        let api = balancer.create_pool("api", Policy::LeastOutstanding);
        let shared = balancer.register_backend(server("shared", 10, 1, 1));
        web.add_backend(shared.clone());
        api.add_backend(shared.clone());

        let status = balancer.status();
        assert_eq!(status.pools.len(), 2);
        assert_eq!(status.backends.len(), 1);
        assert_eq!(status.backends[0].pools, vec!["api", "web"]);
    }

    #[test]
    fn test_from_config_builds_everything() {
        use crate::config::{DnsConfig, PoolConfig, ServerConfig, SoaConfig};

        let config = Config {
            dns: DnsConfig {
                listen_addr: "127.0.0.1:5353".parse().unwrap(),
                zone: "lb.example.com".to_string(),
                ttl: 5,
                default_pool: "web".to_string(),
                soa: SoaConfig::default(),
            },
            balancer: Default::default(),
            health: Default::default(),
            pools: vec![PoolConfig {
                name: "web".to_string(),
                policy: "chashed".to_string(),
                servers: vec![
                    ServerConfig {
                        address: "192.0.2.10:53".parse().unwrap(),
                        name: None,
                        weight: 2,
                        order: 1,
                        qps_limit: None,
                    },
                    ServerConfig {
                        address: "192.0.2.11:53".parse().unwrap(),
                        name: Some("backup".to_string()),
                        weight: 1,
                        order: 2,
                        qps_limit: None,
                    },
                ],
            }],
            telemetry: Default::default(),
        };

        let balancer = Balancer::from_config(&config).unwrap();
        let pool = balancer.pool("web").unwrap();
        assert_eq!(pool.policy(), Policy::CHashed);
        assert_eq!(pool.count_members(true), 2);
        assert_eq!(pool.snapshot().ring.len(), 3);
        assert_eq!(balancer.backends().len(), 2);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        use crate::config::{DnsConfig, PoolConfig, SoaConfig};

        let config = Config {
            dns: DnsConfig {
                listen_addr: "127.0.0.1:5353".parse().unwrap(),
                zone: "lb.example.com".to_string(),
                ttl: 5,
                default_pool: "web".to_string(),
                soa: SoaConfig::default(),
            },
            balancer: Default::default(),
            health: Default::default(),
            pools: vec![PoolConfig {
                name: "web".to_string(),
                policy: "roundrobin".to_string(),
                servers: vec![],
            }],
            telemetry: Default::default(),
        };

        assert!(matches!(
            Balancer::from_config(&config),
            Err(ConfigError::EmptyPool(_))
        ));
    }
}
