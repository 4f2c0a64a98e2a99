//! Interface to the container orchestrator.
//!
//! The updater only needs a one-shot service listing, a per-service fetch,
//! a long-lived event stream and (for diagnostics) a task listing.
//! [`docker::DockerClient`] implements this against the Docker Engine API.

pub mod docker;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::DiscoveryError;

pub use docker::DockerClient;

/// Orchestrator event stream. Ends when the subscription is lost.
pub type EventStream = BoxStream<'static, Result<Event, DiscoveryError>>;

/// A service as described by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service id.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Service metadata labels.
    pub labels: HashMap<String, String>,
}

/// A task (container instance) of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Task id.
    pub id: String,
    /// Owning service id.
    pub service_id: String,
    /// Node the task is scheduled on.
    pub node_id: String,
    /// Current task state (e.g., "running").
    pub state: String,
}

/// An orchestrator state-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Event {
    /// Object type (e.g., "service", "container").
    #[serde(rename = "Type", default)]
    pub kind: String,
    /// What happened (e.g., "create", "update", "remove").
    #[serde(rename = "Action", default)]
    pub action: String,
    /// Object the event is about.
    #[serde(rename = "Actor", default)]
    pub actor: Actor,
}

/// The object an [`Event`] refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Actor {
    /// Object id.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Free-form attributes (e.g., `name`).
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl Event {
    /// Build a service event.
    pub fn service(action: &str, id: &str) -> Self {
        Self {
            kind: "service".to_string(),
            action: action.to_string(),
            actor: Actor {
                id: id.to_string(),
                attributes: HashMap::new(),
            },
        }
    }

    /// Id of the object the event refers to.
    pub fn actor_id(&self) -> &str {
        &self.actor.id
    }
}

/// Operations the registry updater consumes from the orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    /// List every service currently known.
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, DiscoveryError>;

    /// Fetch one service. `Ok(None)` if it no longer exists.
    async fn inspect_service(&self, id: &str)
        -> Result<Option<ServiceDescriptor>, DiscoveryError>;

    /// Subscribe to service events.
    async fn subscribe_events(&self) -> Result<EventStream, DiscoveryError>;

    /// List the tasks scheduled on a node.
    async fn list_tasks_for_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<TaskDescriptor>, DiscoveryError>;
}
