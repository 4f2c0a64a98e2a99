//! Registry updater driven by the orchestrator's service listing and events.
//!
//! Events are applied by a fixed pool of workers. Each service id hashes to
//! one worker, so events for the same id are applied in the order received
//! while different ids proceed in parallel.

use futures::StreamExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::DiscoveryError;
use crate::metrics::{self, ReconnectReason};
use crate::orchestrator::{Event, Orchestrator, ServiceDescriptor};
use crate::registry::Registry;
use crate::service::{short_id, ServiceRecord};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Inspect attempts per create/update event before falling back to a resync.
const REFRESH_ATTEMPTS: u32 = 4;
const REFRESH_BACKOFF: Duration = Duration::from_millis(200);

/// Default number of event workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default queue depth per event worker.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Work item for an event worker.
#[derive(Debug)]
enum Command {
    /// Apply a descriptor already in hand (listing).
    Apply(ServiceDescriptor),
    /// Re-fetch a service and apply it.
    Refresh { id: String, created: bool },
    /// Drop a service.
    Remove(String),
}

impl Command {
    fn id(&self) -> &str {
        match self {
            Command::Apply(service) => &service.id,
            Command::Refresh { id, .. } => id,
            Command::Remove(id) => id,
        }
    }
}

/// Apply a service descriptor to the registry.
///
/// The record is replaced wholesale; a service left without hostname labels
/// is removed.
pub fn apply_service(registry: &Registry, service: &ServiceDescriptor) {
    let record = ServiceRecord::from_descriptor(service);
    let existed = registry.get(&record.id).is_some();

    if record.is_empty() {
        if existed {
            info!(service = %service.name, id = %short_id(&service.id), "Remove service entry");
            registry.remove(&service.id);
        }
        return;
    }

    if !existed {
        info!(
            service = %record.name,
            id = %record.short_id(),
            hostnames = ?record.hostnames,
            target = %record.target,
            "Add service entry"
        );
    }
    registry.put(record);
}

/// Remove a service from the registry.
pub fn remove_service(registry: &Registry, id: &str) {
    match registry.remove(id) {
        Some(record) => {
            info!(service = %record.name, id = %record.short_id(), "Deleting service entry");
        }
        None => debug!(id = %short_id(id), "No entry associated with the service"),
    }
}

/// Fan-out of registry commands to per-shard workers.
pub struct EventDispatcher {
    senders: Vec<mpsc::Sender<Command>>,
    handles: Vec<JoinHandle<()>>,
    resync: Arc<Notify>,
}

impl EventDispatcher {
    fn spawn(
        orchestrator: Arc<dyn Orchestrator>,
        registry: Registry,
        workers: usize,
        queue_depth: usize,
    ) -> Self {
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        let resync = Arc::new(Notify::new());

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                index,
                orchestrator.clone(),
                registry.clone(),
                resync.clone(),
                rx,
            )));
        }

        Self {
            senders,
            handles,
            resync,
        }
    }

    /// Resolves once a worker gave up on a service and wants a full resync.
    ///
    /// A request made while nobody is waiting is kept for the next call.
    pub fn resync_requested(&self) -> Notified<'_> {
        self.resync.notified()
    }

    fn shard(&self, id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    async fn send(&self, command: Command) {
        let shard = self.shard(command.id());
        if self.senders[shard].send(command).await.is_err() {
            error!(shard, "event worker stopped unexpectedly, dropping command");
        }
    }

    /// Route an orchestrator event to the worker owning its service id.
    pub async fn dispatch(&self, event: Event) {
        metrics::record_orchestrator_event(&event.kind, &event.action);

        let id = event.actor_id().to_string();
        let command = match (event.kind.as_str(), event.action.as_str()) {
            ("service", "create") => Command::Refresh { id, created: true },
            ("service", "update") => Command::Refresh { id, created: false },
            ("service", "remove") => Command::Remove(id),
            (kind, action) => {
                trace!(kind, action, "ignoring event");
                return;
            }
        };

        if command.id().is_empty() {
            warn!(action = %event.action, "service event without actor id, ignoring");
            return;
        }

        debug!(
            event = %format!("{}:{}", event.kind, event.action),
            id = %short_id(command.id()),
            "dispatching event"
        );
        self.send(command).await;
    }

    /// Close the queues and wait until every queued command is applied.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Event worker task panicked: {}", e);
            }
        }
    }
}

async fn run_worker(
    index: usize,
    orchestrator: Arc<dyn Orchestrator>,
    registry: Registry,
    resync: Arc<Notify>,
    mut rx: mpsc::Receiver<Command>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Apply(service) => apply_service(&registry, &service),
            Command::Remove(id) => remove_service(&registry, &id),
            Command::Refresh { id, created } => {
                refresh_service(orchestrator.as_ref(), &registry, &resync, &id, created).await
            }
        }
    }
    debug!(worker = index, "event worker stopped");
}

/// Re-fetch a service and apply it, retrying failed fetches.
///
/// Retries happen inline so later commands on this shard, which include
/// every later event for the same id, wait behind this one.
async fn refresh_service(
    orchestrator: &dyn Orchestrator,
    registry: &Registry,
    resync: &Notify,
    id: &str,
    created: bool,
) {
    let mut backoff = REFRESH_BACKOFF;
    for attempt in 1..=REFRESH_ATTEMPTS {
        match orchestrator.inspect_service(id).await {
            Ok(Some(service)) => {
                apply_service(registry, &service);
                if created {
                    log_node_tasks(orchestrator, registry, id).await;
                }
                return;
            }
            Ok(None) => {
                debug!(id = %short_id(id), "service no longer exists");
                remove_service(registry, id);
                return;
            }
            Err(e) if attempt < REFRESH_ATTEMPTS => {
                warn!(
                    id = %short_id(id),
                    attempt,
                    retry_in = ?backoff,
                    error = %e,
                    "failed to fetch service, retrying"
                );
                sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!(
                    id = %short_id(id),
                    attempts = REFRESH_ATTEMPTS,
                    error = %e,
                    "giving up fetching service, requesting resync"
                );
                metrics::record_refresh_failure();
                resync.notify_one();
            }
        }
    }
}

/// Log the tasks running on a newly created service's worker node.
async fn log_node_tasks(orchestrator: &dyn Orchestrator, registry: &Registry, id: &str) {
    let Some(record) = registry.get(id) else {
        return;
    };
    if record.target.is_empty() || record.target.parse::<IpAddr>().is_ok() {
        return;
    }

    match orchestrator.list_tasks_for_node(&record.target).await {
        Ok(tasks) => debug!(
            node = %record.target,
            service = %record.name,
            tasks = tasks.len(),
            running = tasks.iter().filter(|t| t.state == "running").count(),
            "tasks on worker node"
        ),
        Err(e) => debug!(node = %record.target, error = %e, "failed to list tasks for node"),
    }
}

/// Keeps the registry in sync with the orchestrator.
pub struct RegistryUpdater {
    orchestrator: Arc<dyn Orchestrator>,
    registry: Registry,
    workers: usize,
    queue_depth: usize,
}

impl RegistryUpdater {
    /// Create an updater with the default worker pool.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, registry: Registry) -> Self {
        Self {
            orchestrator,
            registry,
            workers: DEFAULT_WORKERS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Set the worker count and per-worker queue depth.
    pub fn with_workers(mut self, workers: usize, queue_depth: usize) -> Self {
        self.workers = workers.max(1);
        self.queue_depth = queue_depth.max(1);
        self
    }

    /// Start the event workers.
    pub fn spawn_dispatcher(&self) -> EventDispatcher {
        EventDispatcher::spawn(
            self.orchestrator.clone(),
            self.registry.clone(),
            self.workers,
            self.queue_depth,
        )
    }

    /// Bring the registry to the orchestrator's current service listing.
    ///
    /// Returns false if the listing could not be fetched, in which case the
    /// registry is left as is.
    pub async fn sync_from_listing(&self, dispatcher: &EventDispatcher) -> bool {
        let services = match self.orchestrator.list_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "Error listing services");
                return false;
            }
        };
        info!(count = services.len(), "Found services");

        let listed: HashSet<&str> = services.iter().map(|s| s.id.as_str()).collect();
        let stale: Vec<String> = self
            .registry
            .ids()
            .into_iter()
            .filter(|id| !listed.contains(id.as_str()))
            .collect();

        for id in stale {
            dispatcher.send(Command::Remove(id)).await;
        }
        for service in services {
            dispatcher.send(Command::Apply(service)).await;
        }
        true
    }

    /// Subscribe, bootstrap and follow events until cancelled.
    ///
    /// Failing to establish the first subscription is fatal and returned.
    /// Later stream failures are retried with backoff and followed by a
    /// resync, since events may have been missed.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        info!("Subscribing to orchestrator events");
        let mut stream = self
            .orchestrator
            .subscribe_events()
            .await
            .map_err(|e| match e {
                DiscoveryError::Subscription(_) => e,
                other => DiscoveryError::Subscription(other.to_string()),
            })?;
        metrics::record_subscription_reconnect(ReconnectReason::InitialConnect);

        let dispatcher = self.spawn_dispatcher();
        self.sync_from_listing(&dispatcher).await;

        let mut backoff = INITIAL_BACKOFF;
        loop {
            let reason = loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("Registry updater received shutdown signal");
                        dispatcher.shutdown().await;
                        return Ok(());
                    }

                    _ = dispatcher.resync_requested() => {
                        info!("Resyncing registry after failed service fetch");
                        metrics::record_resync();
                        self.sync_from_listing(&dispatcher).await;
                    }

                    next = stream.next() => match next {
                        Some(Ok(event)) => dispatcher.dispatch(event).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "Event stream error");
                            break ReconnectReason::Error;
                        }
                        None => {
                            info!("Event stream ended");
                            break ReconnectReason::StreamEnded;
                        }
                    }
                }
            };
            metrics::record_subscription_reconnect(reason);

            stream = loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!("Registry updater shutting down while reconnecting");
                        dispatcher.shutdown().await;
                        return Ok(());
                    }

                    _ = sleep(backoff) => {}
                }

                match self.orchestrator.subscribe_events().await {
                    Ok(stream) => {
                        backoff = INITIAL_BACKOFF;
                        break stream;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to re-subscribe to events");
                        metrics::record_subscription_reconnect(ReconnectReason::Error);
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            };

            info!("Event subscription re-established, resyncing registry");
            metrics::record_resync();
            self.sync_from_listing(&dispatcher).await;
        }
    }
}
