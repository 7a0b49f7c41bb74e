//! DNS server setup and lifecycle management.

use hickory_server::authority::{AuthorityObject, Catalog};
use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::authority::SteerAuthority;
use crate::balancer::Balancer;
use crate::config::Config;
use crate::error::SteerError;
use crate::health::{DnsProber, HealthMonitor, Prober};

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// TCP connection idle timeout.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodically emit balancer state metrics.
async fn metrics_loop(balancer: Balancer, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                balancer.emit_metrics();
                debug!("emitted balancer metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// The steer-dns server: selection engine, health monitor, DNS front end.
pub struct DnsServer {
    config: Config,
    balancer: Balancer,
}

impl DnsServer {
    /// Build the server from validated configuration.
    pub fn new(config: Config) -> Result<Self, SteerError> {
        let balancer = Balancer::from_config(&config)?;
        Ok(Self { config, balancer })
    }

    /// Get a handle to the balancer (selection, feedback, admin snapshot).
    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    /// Run the DNS server until `shutdown` fires, with the default UDP DNS
    /// prober driving the health monitor.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SteerError> {
        let prober = Arc::new(DnsProber::new(
            &self.config.dns.zone,
            Duration::from_millis(self.config.health.probe_timeout_ms),
        )?);
        self.run_with_prober(shutdown, prober).await
    }

    /// Run with a caller-supplied prober.
    pub async fn run_with_prober(
        self,
        shutdown: CancellationToken,
        prober: Arc<dyn Prober>,
    ) -> Result<(), SteerError> {
        info!(
            listen_addr = %self.config.dns.listen_addr,
            zone = %self.config.dns.zone,
            pools = self.config.pools.len(),
            "starting steer-dns server"
        );

        // Start the health monitor
        let monitor = HealthMonitor::new(
            self.balancer.clone(),
            prober,
            self.config.health.clone(),
        );
        let monitor_shutdown = shutdown.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        });

        // Create authority and catalog
        let authority = SteerAuthority::new(self.config.dns.clone(), self.balancer.clone())?;

        let mut catalog = Catalog::new();
        let authority: Arc<dyn AuthorityObject> = Arc::new(authority);
        catalog.upsert(authority.origin().clone(), vec![authority]);

        // Create server
        let mut server = ServerFuture::new(catalog);

        // Bind UDP
        let udp_socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        // Bind TCP
        let tcp_listener = TcpListener::bind(self.config.dns.listen_addr).await?;
        info!(addr = %self.config.dns.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        info!(zone = %self.config.dns.zone, "DNS server ready to serve queries");

        // Start metrics loop
        let metrics_balancer = self.balancer.clone();
        let metrics_shutdown = shutdown.clone();
        let metrics_handle = tokio::spawn(async move {
            metrics_loop(metrics_balancer, metrics_shutdown).await;
        });

        // Emit initial metrics
        self.balancer.emit_metrics();

        // Run server until shutdown
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        // Wait for metrics loop to stop
        let _ = metrics_handle.await;

        // Wait for health monitor to stop
        info!("waiting for health monitor to stop...");
        let _ = monitor_handle.await;

        info!("DNS server stopped");
        Ok(())
    }
}
