//! Docker Engine API client (Swarm services, tasks and events).

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{Event, EventStream, Orchestrator, ServiceDescriptor, TaskDescriptor};
use crate::error::DiscoveryError;

/// Timeout for connecting to the Docker endpoint.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one-shot requests. The event stream has none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Host used in request URLs when talking over a unix socket.
const UNIX_SOCKET_BASE: &str = "http://localhost";

/// Docker Engine API client over HTTP or a unix socket.
#[derive(Debug, Clone)]
pub struct DockerClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ServiceJson {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Spec", default)]
    spec: ServiceSpecJson,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpecJson {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

impl From<ServiceJson> for ServiceDescriptor {
    fn from(service: ServiceJson) -> Self {
        Self {
            id: service.id,
            name: service.spec.name,
            labels: service.spec.labels.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TaskJson {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(rename = "Status", default)]
    status: TaskStatusJson,
}

#[derive(Debug, Default, Deserialize)]
struct TaskStatusJson {
    #[serde(rename = "State", default)]
    state: String,
}

impl From<TaskJson> for TaskDescriptor {
    fn from(task: TaskJson) -> Self {
        Self {
            id: task.id,
            service_id: task.service_id,
            node_id: task.node_id,
            state: task.status.state,
        }
    }
}

impl DockerClient {
    /// Create a client for the given endpoint.
    ///
    /// Accepts `unix:///var/run/docker.sock` style socket paths as well as
    /// `http://` and `https://` URLs.
    pub fn new(endpoint: &str) -> Result<Self, DiscoveryError> {
        let builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        match endpoint.strip_prefix("unix://") {
            Some(path) => Self::over_unix_socket(builder, path),
            None => Ok(Self {
                http: builder.build()?,
                base_url: endpoint.trim_end_matches('/').to_string(),
            }),
        }
    }

    #[cfg(unix)]
    fn over_unix_socket(
        builder: reqwest::ClientBuilder,
        path: &str,
    ) -> Result<Self, DiscoveryError> {
        if path.is_empty() {
            return Err(DiscoveryError::Config("unix socket path is empty".into()));
        }
        debug!(socket = path, "using Docker unix socket");
        Ok(Self {
            http: builder.unix_socket(std::path::PathBuf::from(path)).build()?,
            base_url: UNIX_SOCKET_BASE.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn over_unix_socket(
        _builder: reqwest::ClientBuilder,
        path: &str,
    ) -> Result<Self, DiscoveryError> {
        Err(DiscoveryError::Config(format!(
            "unix socket endpoint {:?} is not supported on this platform",
            path
        )))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `filters` query parameter in the Engine API's JSON map format.
    fn filters(key: &str, value: &str) -> Result<String, DiscoveryError> {
        let mut filters = HashMap::new();
        filters.insert(key, vec![value]);
        Ok(serde_json::to_string(&filters)?)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response, DiscoveryError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Turn a non-success response into [`DiscoveryError::Orchestrator`].
async fn check_status(response: Response) -> Result<Response, DiscoveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(DiscoveryError::Orchestrator {
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

#[async_trait]
impl Orchestrator for DockerClient {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, DiscoveryError> {
        let services: Vec<ServiceJson> = self.get("/services", &[]).await?.json().await?;
        Ok(services.into_iter().map(ServiceDescriptor::from).collect())
    }

    async fn inspect_service(
        &self,
        id: &str,
    ) -> Result<Option<ServiceDescriptor>, DiscoveryError> {
        match self.get(&format!("/services/{}", id), &[]).await {
            Ok(response) => {
                let service: ServiceJson = response.json().await?;
                Ok(Some(service.into()))
            }
            Err(DiscoveryError::Orchestrator { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe_events(&self) -> Result<EventStream, DiscoveryError> {
        let url = self.url("/events");
        let filters = Self::filters("type", "service")?;
        debug!(url = %url, filters = %filters, "subscribing to events");

        let response = self
            .http
            .get(&url)
            .query(&[("filters", filters)])
            .send()
            .await
            .map_err(|e| DiscoveryError::Subscription(e.to_string()))?;
        let response = check_status(response)
            .await
            .map_err(|e| DiscoveryError::Subscription(e.to_string()))?;

        Ok(decode_events(response.bytes_stream()))
    }

    async fn list_tasks_for_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<TaskDescriptor>, DiscoveryError> {
        let filters = Self::filters("node", node_id)?;
        let tasks: Vec<TaskJson> = self
            .get("/tasks", &[("filters", filters)])
            .await?
            .json()
            .await?;
        Ok(tasks.into_iter().map(TaskDescriptor::from).collect())
    }
}

/// Decode a newline-delimited JSON event stream.
///
/// Chunk boundaries need not line up with event boundaries.
fn decode_events<S, B, E>(chunks: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<DiscoveryError> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(chunks), Vec::<u8>::new()),
        |(mut chunks, mut buf)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let event = serde_json::from_slice::<Event>(&line).map_err(DiscoveryError::from);
                    return Some((event, (chunks, buf)));
                }

                match chunks.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                    Some(Err(e)) => {
                        let err: DiscoveryError = e.into();
                        return Some((Err(err), (chunks, buf)));
                    }
                    None => {
                        if buf.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        // Final event without a trailing newline.
                        let line = std::mem::take(&mut buf);
                        let event =
                            serde_json::from_slice::<Event>(&line).map_err(DiscoveryError::from);
                        return Some((event, (chunks, buf)));
                    }
                }
            }
        },
    )
    .boxed()
}
