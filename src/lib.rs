//! steer-dns - An authoritative DNS front end that load-balances across
//! backend pools.
//!
//! This crate answers address queries for a configured zone by returning
//! the address of a healthy backend chosen by a policy-driven selection
//! engine. Backends carry weights, priority orders, live counters, and a
//! health state fed by active probes or observed dispatch outcomes.
//!
//! ## Features
//!
//! - Six selection policies: roundrobin, leastOutstanding, firstAvailable,
//!   wrandom, whashed, chashed (with Bounded-Load variants)
//! - Health state machine with active and lazy observation modes
//! - Lock-free selection hot path over atomically published pool snapshots
//! - Per-backend QPS caps, latency EWMA, and outstanding-query tracking
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          steer-dns                             │
//! │                                                                │
//! │  ┌──────────────────┐     ┌──────────────────┐                │
//! │  │  Health monitor  │────▶│    Balancer      │                │
//! │  │  (probes, lazy   │     │  pools/backends  │                │
//! │  │   windows)       │     │  + snapshots     │                │
//! │  └──────────────────┘     └────────┬─────────┘                │
//! │         │                          │                          │
//! │         │ Up/Down                  ▼                          │
//! │         │ transitions        ┌──────────────────┐             │
//! │         │                    │  Hickory DNS     │◀── UDP/TCP  │
//! │         │                    │  Server          │     :53     │
//! │         └───────────────────▶└──────────────────┘             │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! web.lb.example.com  →  pool "web"  →  policy picks a healthy backend
//!                                    →  answer with its address
//! lb.example.com      →  default pool
//! ```
//!
//! A pool with no healthy member answers SERVFAIL; unknown names under the
//! zone answer NXDOMAIN.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use steer_dns::{Config, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!
//!     let shutdown = CancellationToken::new();
//!     let server = DnsServer::new(config).expect("invalid configuration");
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod authority;
pub mod backend;
pub mod balancer;
pub mod config;
pub mod error;
pub mod hash;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod qps;
pub mod query;
pub mod server;
pub mod telemetry;

// Re-export main types
pub use backend::{Backend, BackendId, HealthState, ResponseOutcome};
pub use balancer::{Balancer, SelectResult, SelectedBackend};
pub use config::{Config, DnsConfig, HealthMode, TelemetryConfig};
pub use error::{ConfigError, SteerError};
pub use policy::Policy;
pub use pool::Pool;
pub use server::DnsServer;
