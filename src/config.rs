//! Configuration types for swarm-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::DiscoveryError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DiscoveryConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server and service discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Docker Engine API endpoint: a unix socket
    /// (e.g., "unix:///var/run/docker.sock") or an http(s) URL.
    #[serde(default = "default_orchestrator_endpoint")]
    pub orchestrator_endpoint: String,

    /// TTL for DNS records in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Upstream resolver for queries we do not answer.
    /// Without one, unanswered queries get SERVFAIL.
    #[serde(default)]
    pub upstream: Option<SocketAddr>,

    /// Upstream query timeout in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Idle timeout for TCP DNS connections in seconds.
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,

    /// Number of workers applying orchestrator events.
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,

    /// Queue depth per event worker.
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl DiscoveryConfig {
    /// Create a config listening on `listen_addr` with every other field defaulted.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            orchestrator_endpoint: default_orchestrator_endpoint(),
            ttl: default_ttl(),
            upstream: None,
            upstream_timeout_ms: default_upstream_timeout_ms(),
            tcp_timeout_secs: default_tcp_timeout_secs(),
            event_workers: default_event_workers(),
            event_queue_depth: default_event_queue_depth(),
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.ttl == 0 {
            return Err(DiscoveryError::Config("ttl must be positive".into()));
        }
        if self.event_workers == 0 {
            return Err(DiscoveryError::Config(
                "event_workers must be at least 1".into(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(DiscoveryError::Config(
                "event_queue_depth must be at least 1".into(),
            ));
        }
        let endpoint = reqwest::Url::parse(&self.orchestrator_endpoint).map_err(|e| {
            DiscoveryError::Config(format!(
                "orchestrator_endpoint {:?}: {}",
                self.orchestrator_endpoint, e
            ))
        })?;
        match endpoint.scheme() {
            "http" | "https" => {}
            "unix" if !endpoint.path().is_empty() => {}
            "unix" => {
                return Err(DiscoveryError::Config(
                    "orchestrator_endpoint unix socket path is empty".into(),
                ))
            }
            scheme => {
                return Err(DiscoveryError::Config(format!(
                    "orchestrator_endpoint must be a unix socket or http(s) URL, got scheme {:?}",
                    scheme
                )))
            }
        }
        Ok(())
    }

    /// Upstream query timeout.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// TCP idle timeout.
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "swarm_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "swarm-dns".to_string()
}

fn default_orchestrator_endpoint() -> String {
    "unix:///var/run/docker.sock".to_string()
}

fn default_ttl() -> u32 {
    3600
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_tcp_timeout_secs() -> u64 {
    30
}

fn default_event_workers() -> usize {
    4
}

fn default_event_queue_depth() -> usize {
    256
}
