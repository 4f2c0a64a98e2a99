//! In-memory service registry kept current by orchestrator events.
//!
//! Records are keyed by service id and replaced wholesale on update. A derived
//! index maps each fully-qualified hostname to the ids claiming it:
//! - `<hostname>.` -> [(seq, service id), ...] ordered by seq
//!
//! When two services claim the same hostname, the one registered first keeps
//! it. Registration order is tracked per id and survives updates, so a later
//! update of the loser never steals the name. The index is patched for the
//! hostnames of the record being changed only.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::answer::fqdn;
use crate::metrics;
use crate::service::{short_id, ServiceRecord};

/// Thread-safe service registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Debug)]
struct Entry {
    record: Arc<ServiceRecord>,
    /// Registration order, assigned on first insert.
    seq: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// service id -> registered record
    services: HashMap<String, Entry>,

    /// `<hostname>.` -> claimants as (seq, id), first registered first.
    /// Never holds an empty list.
    hostnames: HashMap<String, Vec<(u64, String)>>,

    /// Next registration sequence number.
    next_seq: u64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the record registered for a service id.
    pub fn get(&self, id: &str) -> Option<Arc<ServiceRecord>> {
        self.inner
            .read()
            .services
            .get(id)
            .map(|entry| entry.record.clone())
    }

    /// Insert or replace the record for `record.id`.
    ///
    /// A record without hostnames answers nothing and is treated as a removal.
    pub fn put(&self, record: ServiceRecord) {
        if record.is_empty() {
            self.remove(&record.id);
            return;
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let seq = match inner.services.remove(&record.id) {
            Some(previous) => {
                unindex(&mut inner.hostnames, &previous);
                previous.seq
            }
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        debug!(
            id = %record.short_id(),
            service = %record.name,
            hostnames = ?record.hostnames,
            target = %record.target,
            "upserting service"
        );
        let entry = Entry {
            record: Arc::new(record),
            seq,
        };
        index(&mut inner.hostnames, &entry);
        inner.services.insert(entry.record.id.clone(), entry);
    }

    /// Remove the record for a service id, returning it if present.
    pub fn remove(&self, id: &str) -> Option<Arc<ServiceRecord>> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let removed = inner.services.remove(id)?;
        unindex(&mut inner.hostnames, &removed);
        debug!(id = %removed.record.short_id(), service = %removed.record.name, "removed service");
        Some(removed.record)
    }

    /// Point-in-time copy of every record, in registration order.
    pub fn snapshot_all(&self) -> Vec<Arc<ServiceRecord>> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.services.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.iter().map(|entry| entry.record.clone()).collect()
    }

    /// Record owning a fully-qualified hostname (exact, case-sensitive).
    pub fn owner_of(&self, fqdn: &str) -> Option<Arc<ServiceRecord>> {
        let inner = self.inner.read();
        let (_, id) = inner.hostnames.get(fqdn)?.first()?;
        inner.services.get(id).map(|entry| entry.record.clone())
    }

    /// Ids of every registered service.
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().services.keys().cloned().collect()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    /// True if no service is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().services.is_empty()
    }

    /// Number of hostnames currently answerable.
    pub fn hostname_count(&self) -> usize {
        self.inner.read().hostnames.len()
    }

    /// Emit current registry metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        metrics::record_registry_counts(inner.services.len(), inner.hostnames.len());
    }
}

/// Add `entry` as a claimant of each of its hostnames.
fn index(hostnames: &mut HashMap<String, Vec<(u64, String)>>, entry: &Entry) {
    let record = &entry.record;
    for hostname in &record.hostnames {
        let claims = hostnames.entry(fqdn(hostname)).or_default();
        let position = claims.partition_point(|(seq, _)| *seq < entry.seq);
        claims.insert(position, (entry.seq, record.id.clone()));

        if claims.len() > 1 {
            let (_, owner) = &claims[0];
            warn!(
                hostname = %hostname,
                owner = %short_id(owner),
                claimants = claims.len(),
                "hostname claimed by more than one service, keeping first registered"
            );
        }
    }
}

/// Drop `entry`'s claims. The next claimant in line takes over a freed name.
fn unindex(hostnames: &mut HashMap<String, Vec<(u64, String)>>, entry: &Entry) {
    for hostname in &entry.record.hostnames {
        let key = fqdn(hostname);
        let Some(claims) = hostnames.get_mut(&key) else {
            continue;
        };
        claims.retain(|(seq, _)| *seq != entry.seq);
        if claims.is_empty() {
            hostnames.remove(&key);
        } else {
            debug!(
                hostname = %hostname,
                owner = %short_id(&claims[0].1),
                "hostname still claimed by another service"
            );
        }
    }
}
