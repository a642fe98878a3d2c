//! Background observers of the container runtime.
//!
//! [`EventListener`] tails the runtime's event feed and [`HealthPoller`]
//! periodically inspects health checks. Both are started and stopped by the
//! orchestrator around every iteration and keep an in-memory history that
//! the metrics aggregator replays.

pub mod docker;
pub mod events;
pub mod health;
pub mod types;

pub use docker::{DockerEventSource, DockerHealthInspector};
pub use events::{EventListener, EventSource, EventSubscription, ListenerSettings};
pub use health::{HealthInspector, HealthPoller, PollerSettings};
pub use types::{ContainerAction, ContainerEvent, HealthRecord, HealthStatus};

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Unable to spawn event subscription: {0}")]
    Spawn(std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Event decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Container {0} not found")]
    ContainerNotFound(String),
}

/// Locks a history buffer, ignoring poisoning from a panicked callback.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
