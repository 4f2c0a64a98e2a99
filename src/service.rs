//! Service records derived from orchestrator service labels.
//!
//! Label contract:
//! - `coredns.hostname.<anything>` = hostname to register for the service
//! - `coredns.worker` = target the hostnames resolve to (IP or node name)

use hickory_proto::rr::Name;
use tracing::warn;

use crate::orchestrator::ServiceDescriptor;

/// Label key prefix whose values are hostnames to register.
pub const HOSTNAME_LABEL_PREFIX: &str = "coredns.hostname.";

/// Label key whose value is the resolution target.
pub const WORKER_LABEL: &str = "coredns.worker";

/// A service as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Orchestrator-assigned service id.
    pub id: String,
    /// Service name (for logging).
    pub name: String,
    /// Registered hostnames, unqualified, sorted and de-duplicated.
    pub hostnames: Vec<String>,
    /// IP literal or symbolic name the hostnames resolve to. Empty if unset.
    pub target: String,
}

impl ServiceRecord {
    /// Build a record from a service descriptor's labels.
    ///
    /// The returned record may have no hostnames; the registry refuses to
    /// store such records.
    pub fn from_descriptor(service: &ServiceDescriptor) -> Self {
        Self {
            id: service.id.clone(),
            name: service.name.clone(),
            hostnames: hostnames_from_labels(service),
            target: worker_from_labels(service),
        }
    }

    /// True if the record answers no hostname at all.
    pub fn is_empty(&self) -> bool {
        self.hostnames.is_empty()
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Truncate an orchestrator id to 12 characters for logging.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Collect the hostname label values of a service.
fn hostnames_from_labels(service: &ServiceDescriptor) -> Vec<String> {
    let mut hostnames: Vec<String> = service
        .labels
        .iter()
        .filter(|(key, _)| key.starts_with(HOSTNAME_LABEL_PREFIX))
        .filter_map(|(key, value)| {
            let hostname = value.trim().trim_end_matches('.');
            if hostname.is_empty() {
                warn!(service = %service.name, label = %key, "empty hostname label, ignoring");
                return None;
            }
            if let Err(e) = Name::from_ascii(hostname) {
                warn!(
                    service = %service.name,
                    label = %key,
                    hostname,
                    error = %e,
                    "invalid hostname label, ignoring"
                );
                return None;
            }
            Some(hostname.to_string())
        })
        .collect();

    hostnames.sort();
    hostnames.dedup();
    hostnames
}

/// Get the worker target of a service, empty if not labelled.
fn worker_from_labels(service: &ServiceDescriptor) -> String {
    service
        .labels
        .get(WORKER_LABEL)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}
