//! Fakes for the runtime and lifecycle seams, shared by unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::process::Child;

use crate::lifecycle::{Lifecycle, LifecycleOutcome};
use crate::monitor::{
    EventSource, EventSubscription, HealthInspector, HealthStatus, MonitorError, lock,
};

pub fn event_line(action: &str, name: &str, time_nano: i64) -> String {
    serde_json::json!({
        "Type": "container",
        "Action": action,
        "Actor": {
            "ID": format!("id-{name}"),
            "Attributes": { "name": name, "image": format!("{name}:latest") }
        },
        "time": time_nano / 1_000_000_000,
        "timeNano": time_nano,
    })
    .to_string()
}

pub fn health_line(status: &str, name: &str, time_nano: i64) -> String {
    event_line(&format!("health_status: {status}"), name, time_nano)
}

/// Replays a fixed list of lines on every subscription, then stays open.
pub struct FakeEventSource {
    lines: Vec<String>,
    process: Mutex<Option<Child>>,
}

impl FakeEventSource {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            process: Mutex::new(None),
        }
    }

    pub fn with_process(lines: Vec<String>, process: Child) -> Self {
        Self {
            lines,
            process: Mutex::new(Some(process)),
        }
    }
}

#[async_trait]
impl EventSource for FakeEventSource {
    async fn subscribe(&self) -> Result<EventSubscription, MonitorError> {
        let lines = futures_util::stream::iter(self.lines.clone().into_iter().map(Ok))
            .chain(futures_util::stream::pending())
            .boxed();
        Ok(EventSubscription {
            lines,
            process: lock(&self.process).take(),
        })
    }
}

enum Scripted {
    Status(HealthStatus),
    HealthyAt(Instant),
}

/// Resolves a container to its own name as id.
pub struct FakeInspector {
    containers: Mutex<HashMap<String, Scripted>>,
}

impl FakeInspector {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_status(&self, name: &str, status: HealthStatus) {
        lock(&self.containers).insert(name.to_string(), Scripted::Status(status));
    }

    /// Reports `starting` until `delay` from now has elapsed.
    pub fn healthy_after(&self, name: &str, delay: Duration) {
        lock(&self.containers).insert(name.to_string(), Scripted::HealthyAt(Instant::now() + delay));
    }

    pub fn remove(&self, name: &str) {
        lock(&self.containers).remove(name);
    }
}

#[async_trait]
impl HealthInspector for FakeInspector {
    async fn resolve(&self, name: &str) -> Result<String, MonitorError> {
        if lock(&self.containers).contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(MonitorError::ContainerNotFound(name.to_string()))
        }
    }

    async fn health_status(&self, id: &str) -> Result<HealthStatus, MonitorError> {
        match lock(&self.containers).get(id) {
            Some(Scripted::Status(status)) => Ok(*status),
            Some(Scripted::HealthyAt(at)) if Instant::now() >= *at => Ok(HealthStatus::Healthy),
            Some(Scripted::HealthyAt(_)) => Ok(HealthStatus::Starting),
            None => Err(MonitorError::ContainerNotFound(id.to_string())),
        }
    }
}

/// Records every call; `start` fails for the configured environments.
pub struct FakeLifecycle {
    environments: Vec<String>,
    failing_starts: HashSet<String>,
    calls: Mutex<Vec<(String, &'static str)>>,
}

impl FakeLifecycle {
    pub fn new(environments: &[&str]) -> Self {
        Self {
            environments: environments.iter().map(|env| env.to_string()).collect(),
            failing_starts: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_start(mut self, env: &str) -> Self {
        self.failing_starts.insert(env.to_string());
        self
    }

    pub fn calls(&self, env: &str, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(e, op)| e == env && *op == operation)
            .count()
    }

    fn record(&self, env: &str, operation: &'static str) {
        lock(&self.calls).push((env.to_string(), operation));
    }
}

#[async_trait]
impl Lifecycle for FakeLifecycle {
    async fn start(&self, env: &str, _timeout: Duration) -> LifecycleOutcome {
        self.record(env, "start");
        if self.failing_starts.contains(env) {
            LifecycleOutcome::failed("port already allocated")
        } else {
            LifecycleOutcome::ok("started")
        }
    }

    async fn stop(&self, env: &str, _remove_volumes: bool, _timeout: Duration) -> LifecycleOutcome {
        self.record(env, "stop");
        LifecycleOutcome::ok("stopped")
    }

    async fn cleanup(&self, env: &str, _timeout: Duration) -> LifecycleOutcome {
        self.record(env, "cleanup");
        LifecycleOutcome::ok("cleaned")
    }

    async fn list_environments(&self) -> Vec<String> {
        self.environments.clone()
    }
}
