//! Docker-backed implementations of the monitor seams.
//!
//! Health inspection goes through bollard, the event feed is tailed from
//! the `docker events` CLI so that it can be killed like any subprocess.

use std::process::Stdio;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::ContainerInspectResponse;
use bollard::query_parameters::{InspectContainerOptions, InspectContainerOptionsBuilder};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{
    MonitorError,
    events::{EventSource, EventSubscription},
    health::HealthInspector,
    types::HealthStatus,
};

/// Connects to the local Docker daemon (Unix socket on Linux/macOS, named
/// pipe on Windows).
pub fn connect() -> Result<Docker, MonitorError> {
    Ok(Docker::connect_with_local_defaults()?)
}

pub struct DockerEventSource {
    binary: String,
}

impl DockerEventSource {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerEventSource {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl EventSource for DockerEventSource {
    async fn subscribe(&self) -> Result<EventSubscription, MonitorError> {
        let mut child = Command::new(&self.binary)
            .args(["events", "--format", "{{json .}}"])
            .args(["--filter", "type=container"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(MonitorError::Spawn)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            MonitorError::Spawn(std::io::Error::other("event subprocess has no stdout"))
        })?;
        log::debug!("Tailing `{} events` (pid {:?})", self.binary, child.id());

        let reader = BufReader::new(stdout).lines();
        let lines = futures_util::stream::unfold(reader, |mut reader| async move {
            match reader.next_line().await {
                Ok(Some(line)) => Some((Ok(line), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
        .boxed();

        Ok(EventSubscription {
            lines,
            process: Some(child),
        })
    }
}

pub struct DockerHealthInspector {
    docker: Docker,
}

impl DockerHealthInspector {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInspectResponse, MonitorError> {
        let options: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();

        match self.docker.inspect_container(name, Some(options)).await {
            Ok(info) => Ok(info),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(MonitorError::ContainerNotFound(name.to_string())),
            Err(e) => Err(MonitorError::Docker(e)),
        }
    }
}

#[async_trait]
impl HealthInspector for DockerHealthInspector {
    async fn resolve(&self, name: &str) -> Result<String, MonitorError> {
        self.inspect(name)
            .await?
            .id
            .ok_or_else(|| MonitorError::ContainerNotFound(name.to_string()))
    }

    async fn health_status(&self, id: &str) -> Result<HealthStatus, MonitorError> {
        let info = self.inspect(id).await?;
        Ok(info
            .state
            .and_then(|state| state.health)
            .and_then(|health| health.status)
            .map(HealthStatus::from)
            .unwrap_or(HealthStatus::None))
    }
}
