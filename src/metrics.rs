//! Metrics instrumentation for swarm-dns.
//!
//! All metrics are prefixed with `swarm_dns.`

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a handled DNS query.
pub fn record_query(record_type: &str, outcome: QueryOutcome, duration: Duration) {
    let outcome_str = match outcome {
        QueryOutcome::Answered => "answered",
        QueryOutcome::Chained => "chained",
        QueryOutcome::Delegated => "delegated",
        QueryOutcome::Error => "error",
    };

    counter!("swarm_dns.query.count", "type" => record_type.to_string(), "outcome" => outcome_str)
        .increment(1);
    histogram!("swarm_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// How a query was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Answered entirely from the registry.
    Answered,
    /// Partial CNAME answer written, rewritten query handed downstream.
    Chained,
    /// Handed to the next handler untouched.
    Delegated,
    /// Lookup or write failed; handed to the next handler.
    Error,
}

/// Record an orchestrator event.
pub fn record_orchestrator_event(kind: &str, action: &str) {
    counter!(
        "swarm_dns.orchestrator.event.count",
        "type" => kind.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record an event subscription (re)connect.
pub fn record_subscription_reconnect(reason: ReconnectReason) {
    let reason_str = match reason {
        ReconnectReason::InitialConnect => "initial_connect",
        ReconnectReason::StreamEnded => "stream_ended",
        ReconnectReason::Error => "error",
    };

    counter!("swarm_dns.subscription.reconnect.count", "reason" => reason_str).increment(1);
}

/// Reconnect reasons.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// First connection to the orchestrator.
    InitialConnect,
    /// Event stream ended.
    StreamEnded,
    /// Event stream or reconnect attempt failed.
    Error,
}

/// Record a full registry resync from a fresh service listing.
pub fn record_resync() {
    counter!("swarm_dns.registry.resync.count").increment(1);
}

/// Record a create/update event whose service could not be fetched.
pub fn record_refresh_failure() {
    counter!("swarm_dns.orchestrator.refresh_failures.count").increment(1);
}

/// Record registry sizes.
pub fn record_registry_counts(services: usize, hostnames: usize) {
    gauge!("swarm_dns.registry.services.count").set(services as f64);
    gauge!("swarm_dns.registry.hostnames.count").set(hostnames as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
