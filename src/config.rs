//! Configuration types for steer-dns.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::policy::Policy;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Selection-engine tuning.
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Health monitoring configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Backend pools. At least one is required.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Validate the whole configuration. Every violation here is fatal at
    /// startup, before any listener binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }

        for pool in &self.pools {
            if pool.servers.is_empty() {
                return Err(ConfigError::EmptyPool(pool.name.clone()));
            }
            if Policy::from_str(&pool.policy).is_err() {
                return Err(ConfigError::UnknownPolicy(pool.policy.clone()));
            }

            let mut seen = HashSet::new();
            for server in &pool.servers {
                if server.weight < 1 {
                    return Err(ConfigError::InvalidWeight {
                        name: server.identity(),
                        weight: server.weight,
                    });
                }
                if !seen.insert(server.identity()) {
                    return Err(ConfigError::DuplicateBackend {
                        name: server.identity(),
                        pool: pool.name.clone(),
                    });
                }
            }
        }

        if !self.pools.iter().any(|p| p.name == self.dns.default_pool) {
            return Err(ConfigError::UnknownDefaultPool(
                self.dns.default_pool.clone(),
            ));
        }

        Ok(())
    }
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Zone this front end is authoritative for (e.g. "lb.example.com").
    /// Queries for `<pool>.<zone>` select from pool `<pool>`; queries for
    /// the bare zone use `default_pool`.
    pub zone: String,

    /// TTL for answer records in seconds. Kept short: answers encode a
    /// live load-balancing decision.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Pool used for queries on the bare zone apex.
    #[serde(default = "default_pool_name")]
    pub default_pool: String,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,
}

fn default_ttl() -> u32 {
    5
}

fn default_pool_name() -> String {
    "default".to_string()
}

/// Selection-engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Seed mixed into all hashes so two deployments produce different
    /// rings. Chosen randomly at startup when absent.
    #[serde(default)]
    pub hash_perturbation: Option<u32>,

    /// Bounded-load factor for wrandom/whashed; 0 disables it.
    #[serde(default)]
    pub weighted_balancing_factor: f64,

    /// Bounded-load factor for chashed; 0 disables it.
    #[serde(default)]
    pub consistent_hash_balancing_factor: f64,

    /// Round-robin empty-set behavior knob.
    #[serde(default)]
    pub roundrobin_fail_on_empty: bool,

    /// Latency EWMA smoothing factor, clamped to [0.05, 0.2].
    #[serde(default = "default_ewma_alpha")]
    pub latency_ewma_alpha: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            hash_perturbation: None,
            weighted_balancing_factor: 0.0,
            consistent_hash_balancing_factor: 0.0,
            roundrobin_fail_on_empty: false,
            latency_ewma_alpha: default_ewma_alpha(),
        }
    }
}

fn default_ewma_alpha() -> f64 {
    0.1
}

/// How backend health is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthMode {
    /// Periodic probes drive the state machine.
    Active,
    /// Dispatch outcomes drive it; probes run only for recovery.
    Lazy,
}

/// Health monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Active or lazy observation.
    #[serde(default = "default_health_mode")]
    pub mode: HealthMode,

    /// Probe interval for Up backends in active mode, seconds.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Initial probe interval for Down backends, seconds. Backs off
    /// exponentially up to `probe_backoff_cap_secs`.
    #[serde(default = "default_probe_interval_down")]
    pub probe_interval_down_secs: u64,

    /// Upper bound for the Down-probe backoff, seconds.
    #[serde(default = "default_probe_backoff_cap")]
    pub probe_backoff_cap_secs: u64,

    /// Per-probe timeout, milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive probe failures before an Up backend goes Down.
    #[serde(default = "default_n_fail")]
    pub n_fail: u32,

    /// Consecutive probe successes before a Down backend comes back Up.
    #[serde(default = "default_n_ok")]
    pub n_ok: u32,

    /// Sample window size for lazy mode.
    #[serde(default = "default_lazy_window")]
    pub lazy_window: usize,

    /// Failure ratio over a full window that flips a backend Down in lazy
    /// mode.
    #[serde(default = "default_lazy_failure_ratio")]
    pub lazy_failure_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            mode: default_health_mode(),
            probe_interval_secs: default_probe_interval(),
            probe_interval_down_secs: default_probe_interval_down(),
            probe_backoff_cap_secs: default_probe_backoff_cap(),
            probe_timeout_ms: default_probe_timeout_ms(),
            n_fail: default_n_fail(),
            n_ok: default_n_ok(),
            lazy_window: default_lazy_window(),
            lazy_failure_ratio: default_lazy_failure_ratio(),
        }
    }
}

fn default_health_mode() -> HealthMode {
    HealthMode::Active
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_interval_down() -> u64 {
    1
}

fn default_probe_backoff_cap() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_n_fail() -> u32 {
    3
}

fn default_n_ok() -> u32 {
    2
}

fn default_lazy_window() -> usize {
    100
}

fn default_lazy_failure_ratio() -> f64 {
    0.2
}

/// One backend pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name; also the routing label under the zone.
    pub name: String,

    /// Selection policy name.
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Member servers, in declaration order.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn default_policy() -> String {
    "roundrobin".to_string()
}

/// One backend server inside a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport address (IP + port).
    pub address: SocketAddr,

    /// Optional stable name; defaults to the address string.
    #[serde(default)]
    pub name: Option<String>,

    /// Relative share for weighted policies.
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// Priority group; lower is preferred.
    #[serde(default = "default_order")]
    pub order: i32,

    /// Optional cap on accepted queries per second.
    #[serde(default)]
    pub qps_limit: Option<u32>,
}

impl ServerConfig {
    /// Stable identity used for ring salting and duplicate detection.
    pub fn identity(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

fn default_weight() -> i64 {
    1
}

fn default_order() -> i32 {
    1
}

/// SOA (Start of Authority) record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Primary nameserver hostname (e.g., "ns1.example.com").
    pub mname: String,

    /// Admin email in DNS format (e.g., "admin.example.com").
    pub rname: String,

    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: u32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,

    /// Minimum TTL in seconds.
    #[serde(default = "default_minimum")]
    pub minimum: u32,
}

fn default_refresh() -> u32 {
    3600
}

fn default_retry() -> u32 {
    600
}

fn default_expire() -> u32 {
    604800
}

fn default_minimum() -> u32 {
    60
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            mname: "ns1.example.com".to_string(),
            rname: "admin.example.com".to_string(),
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
            minimum: default_minimum(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "steer_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(address: &str, weight: i64) -> ServerConfig {
        ServerConfig {
            address: address.parse().unwrap(),
            name: None,
            weight,
            order: 1,
            qps_limit: None,
        }
    }

    fn base_config() -> Config {
        Config {
            dns: DnsConfig {
                listen_addr: "127.0.0.1:5353".parse().unwrap(),
                zone: "lb.example.com".to_string(),
                ttl: 5,
                default_pool: "default".to_string(),
                soa: SoaConfig::default(),
            },
            balancer: BalancerConfig::default(),
            health: HealthConfig::default(),
            pools: vec![PoolConfig {
                name: "default".to_string(),
                policy: "roundrobin".to_string(),
                servers: vec![server("192.0.2.10:53", 1)],
            }],
            telemetry: TelemetryConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_no_pools_rejected() {
        let mut config = base_config();
        config.pools.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoPools)));
    }

    #[test]
    fn test_empty_pool_rejected() {
        let mut config = base_config();
        config.pools[0].servers.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyPool(_))));
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let mut config = base_config();
        config.pools[0].policy = "fastest".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_invalid_weight_rejected() {
        let mut config = base_config();
        config.pools[0].servers[0].weight = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let mut config = base_config();
        config.pools[0].servers.push(server("192.0.2.10:53", 1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateBackend { .. })
        ));
    }

    #[test]
    fn test_unknown_default_pool_rejected() {
        let mut config = base_config();
        config.dns.default_pool = "nope".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownDefaultPool(_))
        ));
    }

    #[test]
    fn test_server_identity_falls_back_to_address() {
        let anon = server("192.0.2.10:53", 1);
        assert_eq!(anon.identity(), "192.0.2.10:53");

        let named = ServerConfig {
            name: Some("primary".to_string()),
            ..anon
        };
        assert_eq!(named.identity(), "primary");
    }
}
