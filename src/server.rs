//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::fallback::Fallback;
use crate::handler::DiscoveryHandler;
use crate::orchestrator::{DockerClient, Orchestrator};
use crate::registry::Registry;
use crate::updater::RegistryUpdater;

/// Interval for emitting registry metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Wait for a background task, logging a panic or abort. Returns false if it
/// did not finish normally.
async fn join_task(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(task = name, "{} task failed: {}", name, e);
            false
        }
    }
}

/// Periodically emit registry metrics.
async fn metrics_loop(registry: Registry, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.emit_metrics();
                debug!(
                    services = registry.len(),
                    hostnames = registry.hostname_count(),
                    "emitted registry metrics"
                );
            }
            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// DNS server answering for orchestrator services.
pub struct DnsServer {
    config: DiscoveryConfig,
    registry: Registry,
    orchestrator: Option<Arc<dyn Orchestrator>>,
}

impl DnsServer {
    /// Create a server talking to the configured Docker endpoint.
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            orchestrator: None,
        }
    }

    /// Create a server backed by the given orchestrator.
    pub fn with_orchestrator(config: DiscoveryConfig, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            config,
            registry: Registry::new(),
            orchestrator: Some(orchestrator),
        }
    }

    /// Get a reference to the service registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the DNS server until cancelled.
    ///
    /// Returns an error if the configuration is invalid, the sockets cannot
    /// be bound, or the registry updater fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        self.config.validate()?;

        info!(
            listen_addr = %self.config.listen_addr,
            orchestrator = %self.config.orchestrator_endpoint,
            ttl = self.config.ttl,
            "Starting swarm-dns server"
        );

        let orchestrator: Arc<dyn Orchestrator> = match self.orchestrator {
            Some(orchestrator) => orchestrator,
            None => Arc::new(DockerClient::new(&self.config.orchestrator_endpoint)?),
        };

        let fallback = Fallback::from_config(&self.config);
        match &fallback {
            Fallback::Forward(forwarder) => {
                info!(upstream = %forwarder.upstream(), "Forwarding unanswered queries")
            }
            Fallback::ServFail(_) => info!("No upstream configured, unanswered queries get SERVFAIL"),
        }

        let handler = DiscoveryHandler::new(self.registry.clone(), self.config.ttl, fallback);
        let mut server = ServerFuture::new(handler);

        let udp_socket = UdpSocket::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, self.config.tcp_timeout());

        // Start registry updater
        let updater = RegistryUpdater::new(orchestrator, self.registry.clone())
            .with_workers(self.config.event_workers, self.config.event_queue_depth);
        let updater_cancel = cancel.child_token();
        let mut updater_handle = tokio::spawn(updater.run(updater_cancel.clone()));

        // Start metrics loop
        let metrics_cancel = cancel.child_token();
        let metrics_handle = tokio::spawn(metrics_loop(self.registry.clone(), metrics_cancel.clone()));

        info!("DNS server ready to serve queries");

        let (result, updater_finished) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("DNS server shutdown requested");
                (Ok(()), false)
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
                (Ok(()), false)
            }
            joined = &mut updater_handle => {
                let result = match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!("Registry updater failed: {}", e);
                        Err(e)
                    }
                    Err(e) => Err(DiscoveryError::Subscription(format!(
                        "registry updater task failed: {}",
                        e
                    ))),
                };
                (result, true)
            }
        };

        metrics_cancel.cancel();
        join_task("metrics", metrics_handle).await;

        if !updater_finished {
            info!("Waiting for registry updater to stop...");
            updater_cancel.cancel();
            match updater_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Registry updater error: {}", e),
                Err(e) => error!("Registry updater task failed: {}", e),
            }
        }

        info!("DNS server stopped");
        result
    }
}
