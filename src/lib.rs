//! Swarm DNS - service discovery DNS for Docker Swarm clusters.
//!
//! Services opt in by carrying labels: every `coredns.hostname.*` label names
//! a hostname, and `coredns.worker` names the target those hostnames resolve
//! to. The registry of labelled services is bootstrapped from the service
//! listing and kept current from the Docker event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          swarm-dns                              │
//! │                                                                 │
//! │  ┌──────────────────┐    ┌──────────────────┐                   │
//! │  │ Docker Engine    │───▶│ Registry Updater │                   │
//! │  │ (list + events)  │    │ (sharded workers)│                   │
//! │  └──────────────────┘    └────────┬─────────┘                   │
//! │                                   ▼                             │
//! │                          ┌──────────────────┐                   │
//! │                          │    Registry      │                   │
//! │                          └────────┬─────────┘                   │
//! │                                   ▼                             │
//! │  UDP/TCP ──────────────▶ ┌──────────────────┐    ┌───────────┐  │
//! │                          │ DiscoveryHandler │───▶│ Fallback  │  │
//! │                          └──────────────────┘    └───────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! web.example.com. A      (target 203.0.113.5)
//!   → A web.example.com. 203.0.113.5, authoritative
//!
//! web.example.com. A      (target node-7)
//!   → CNAME web.example.com. node-7.
//!   → query for node-7. A handed to the fallback
//!
//! anything else
//!   → handed to the fallback
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use swarm_dns::{DiscoveryConfig, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = DiscoveryConfig::new("0.0.0.0:5353".parse().unwrap());
//!     config.upstream = Some("10.0.0.53:53".parse().unwrap());
//!
//!     let cancel = CancellationToken::new();
//!     DnsServer::new(config).run(cancel).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod answer;
pub mod config;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod updater;

// Re-export main types
pub use config::{Config, DiscoveryConfig, OpenTelemetryConfig, TelemetryConfig};
pub use error::DiscoveryError;
pub use fallback::{Fallback, Forwarder, ServFail};
pub use handler::{DiscoveryHandler, Handled};
pub use orchestrator::{DockerClient, Orchestrator};
pub use registry::Registry;
pub use server::DnsServer;
pub use service::ServiceRecord;
pub use updater::RegistryUpdater;
