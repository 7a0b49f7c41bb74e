//! Backend health monitoring.
//!
//! The monitor owns every health transition: it is the single writer of
//! backend health state, so the Up/Down machine never races itself. In
//! active mode, periodic probes drive the machine with `n_fail`/`n_ok`
//! debounce. In lazy mode, dispatch outcomes observed on the response path
//! fill a per-backend window; crossing the failure threshold flips the
//! backend Down, after which active probes take over until recovery.
//!
//! Probes are opaque: the monitor consumes a success flag and a latency
//! sample from a [`Prober`] and knows nothing about the wire. The crate
//! ships [`DnsProber`], a UDP DNS round-trip; tests script their own.

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendId, HealthState};
use crate::balancer::Balancer;
use crate::config::{HealthConfig, HealthMode};

/// How often the monitor wakes up to look for due probes.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Result of one probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    /// Whether the backend answered acceptably.
    pub success: bool,
    /// Observed round-trip time.
    pub latency: Duration,
}

/// Something that can check one backend.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe the backend at `address` once.
    async fn probe(&self, address: SocketAddr) -> ProbeOutcome;
}

/// UDP DNS round-trip probe: send an SOA query for the zone, accept any
/// response carrying the matching message id.
pub struct DnsProber {
    qname: Name,
    timeout: Duration,
}

impl DnsProber {
    /// Create a prober querying SOA for `zone`.
    pub fn new(zone: &str, timeout: Duration) -> Result<Self, hickory_proto::ProtoError> {
        Ok(Self {
            qname: Name::from_ascii(zone)?,
            timeout,
        })
    }

    async fn roundtrip(&self, address: SocketAddr) -> io::Result<()> {
        let bind_addr: SocketAddr = if address.is_ipv4() {
            "0.0.0.0:0".parse().expect("fixed address")
        } else {
            "[::]:0".parse().expect("fixed address")
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let id: u16 = rand::random();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(false);
        let mut query = Query::new();
        query.set_name(self.qname.clone());
        query.set_query_type(RecordType::SOA);
        query.set_query_class(DNSClass::IN);
        message.add_query(query);

        let bytes = message
            .to_vec()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        socket.send_to(&bytes, address).await?;

        let mut buf = [0u8; 512];
        let (len, _) = socket.recv_from(&mut buf).await?;
        let response = Message::from_vec(&buf[..len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if response.id() == id {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "response id mismatch",
            ))
        }
    }
}

#[async_trait]
impl Prober for DnsProber {
    async fn probe(&self, address: SocketAddr) -> ProbeOutcome {
        let started = Instant::now();
        let success = matches!(
            tokio::time::timeout(self.timeout, self.roundtrip(address)).await,
            Ok(Ok(()))
        );
        ProbeOutcome {
            success,
            latency: started.elapsed(),
        }
    }
}

/// Per-backend debounce and scheduling state, owned by the monitor.
#[derive(Debug)]
struct MonitorEntry {
    consecutive_failures: u32,
    consecutive_successes: u32,
    backoff: Duration,
    next_probe_at: Instant,
}

impl MonitorEntry {
    fn new(now: Instant, initial_backoff: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            backoff: initial_backoff,
            next_probe_at: now,
        }
    }
}

/// Drives the per-backend health state machines.
pub struct HealthMonitor {
    balancer: Balancer,
    prober: Arc<dyn Prober>,
    config: HealthConfig,
    entries: HashMap<BackendId, MonitorEntry>,
}

impl HealthMonitor {
    /// Create a monitor over the balancer's backends.
    pub fn new(balancer: Balancer, prober: Arc<dyn Prober>, config: HealthConfig) -> Self {
        Self {
            balancer,
            prober,
            config,
            entries: HashMap::new(),
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        info!(mode = ?self.config.mode, "health monitor started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("health monitor shutting down");
                    return;
                }

                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass over all backends: evaluate lazy windows, run due probes.
    pub(crate) async fn sweep(&mut self) {
        let now = Instant::now();
        let backends = self.balancer.backends();

        self.entries
            .retain(|id, _| backends.iter().any(|b| b.id() == *id));

        let initial_backoff = Duration::from_secs(self.config.probe_interval_down_secs);
        for backend in backends {
            let entry = self
                .entries
                .entry(backend.id())
                .or_insert_with(|| MonitorEntry::new(now, initial_backoff));

            match backend.health() {
                HealthState::Up => match self.config.mode {
                    HealthMode::Active => {
                        if now >= entry.next_probe_at {
                            probe_up_backend(
                                &self.balancer,
                                &self.config,
                                self.prober.as_ref(),
                                &backend,
                                entry,
                            )
                            .await;
                        }
                    }
                    HealthMode::Lazy => {
                        evaluate_lazy_window(&self.balancer, &self.config, &backend, entry);
                    }
                },
                HealthState::Down | HealthState::Probing => {
                    if now >= entry.next_probe_at {
                        probe_down_backend(
                            &self.balancer,
                            &self.config,
                            self.prober.as_ref(),
                            &backend,
                            entry,
                        )
                        .await;
                    }
                }
            }
        }
    }
}

/// Check the lazy window of an Up backend and flip it Down past the
/// threshold. Active probes then take over until recovery.
fn evaluate_lazy_window(
    balancer: &Balancer,
    config: &HealthConfig,
    backend: &Arc<Backend>,
    entry: &mut MonitorEntry,
) {
    let Some(ratio) = backend.lazy_failure_ratio() else {
        return;
    };
    if ratio < config.lazy_failure_ratio {
        return;
    }

    warn!(
        backend = %backend.name(),
        ratio = format!("{ratio:.2}"),
        threshold = config.lazy_failure_ratio,
        "dispatch failure ratio over threshold"
    );
    balancer.apply_health_transition(backend.id(), HealthState::Down);
    backend.reset_lazy_window();
    arm_down_probing(config, entry);
}

/// Routine probe of an Up backend (active mode), with `n_fail` debounce.
async fn probe_up_backend(
    balancer: &Balancer,
    config: &HealthConfig,
    prober: &dyn Prober,
    backend: &Arc<Backend>,
    entry: &mut MonitorEntry,
) {
    entry.next_probe_at = Instant::now() + Duration::from_secs(config.probe_interval_secs);

    let outcome = prober.probe(backend.address()).await;
    debug!(
        backend = %backend.name(),
        success = outcome.success,
        latency_us = outcome.latency.as_micros() as u64,
        "health probe"
    );

    if outcome.success {
        entry.consecutive_failures = 0;
        return;
    }

    entry.consecutive_failures += 1;
    warn!(
        backend = %backend.name(),
        failures = entry.consecutive_failures,
        threshold = config.n_fail,
        "health probe failed"
    );
    if entry.consecutive_failures >= config.n_fail {
        balancer.apply_health_transition(backend.id(), HealthState::Down);
        backend.reset_lazy_window();
        arm_down_probing(config, entry);
    }
}

/// Recovery probe of a Down backend, with `n_ok` debounce and exponential
/// backoff on repeated failures. The backend sits in `Probing` while the
/// probe is in flight.
async fn probe_down_backend(
    balancer: &Balancer,
    config: &HealthConfig,
    prober: &dyn Prober,
    backend: &Arc<Backend>,
    entry: &mut MonitorEntry,
) {
    balancer.apply_health_transition(backend.id(), HealthState::Probing);
    let outcome = prober.probe(backend.address()).await;

    if outcome.success {
        entry.consecutive_failures = 0;
        entry.consecutive_successes += 1;
        if entry.consecutive_successes >= config.n_ok {
            balancer.apply_health_transition(backend.id(), HealthState::Up);
            backend.reset_lazy_window();
            entry.consecutive_successes = 0;
            entry.next_probe_at =
                Instant::now() + Duration::from_secs(config.probe_interval_secs);
            return;
        }
        // recovering but not there yet; keep probing briskly
        balancer.apply_health_transition(backend.id(), HealthState::Down);
        entry.backoff = Duration::from_secs(config.probe_interval_down_secs);
        entry.next_probe_at = Instant::now() + entry.backoff;
    } else {
        entry.consecutive_successes = 0;
        balancer.apply_health_transition(backend.id(), HealthState::Down);
        entry.next_probe_at = Instant::now() + entry.backoff;
        entry.backoff = (entry.backoff * 2)
            .min(Duration::from_secs(config.probe_backoff_cap_secs));
    }
}

fn arm_down_probing(config: &HealthConfig, entry: &mut MonitorEntry) {
    entry.consecutive_failures = 0;
    entry.consecutive_successes = 0;
    entry.backoff = Duration::from_secs(config.probe_interval_down_secs);
    entry.next_probe_at = Instant::now() + entry.backoff;
}
