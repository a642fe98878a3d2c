use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream::BoxStream};
use serde::Deserialize;
use tokio::{
    process::Child,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use super::{
    MonitorError, lock,
    types::{ContainerAction, ContainerEvent, HealthStatus},
};

/// Observer invoked once per accepted event, on the listener task.
/// Must return quickly, a blocking callback stalls ingestion.
pub type EventCallback = Arc<dyn Fn(&ContainerEvent) + Send + Sync>;

const BROADCAST_CAPACITY: usize = 1024;

/// A live subscription to the runtime event feed.
pub struct EventSubscription {
    /// One JSON document per line.
    pub lines: BoxStream<'static, std::io::Result<String>>,
    /// The process producing `lines`, if any. It is terminated on stop.
    pub process: Option<Child>,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self) -> Result<EventSubscription, MonitorError>;
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Record every container event regardless of the name filters and keep
    /// the raw lines in an audit log.
    pub capture_all: bool,
    /// Containers with this name prefix are always dropped.
    pub reserved_prefix: String,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Docker event as printed by `docker events --format '{{json .}}'`.
/// Older engines only fill `status`, `id` and `from`.
#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
    #[serde(default)]
    time: Option<i64>,
    #[serde(rename = "timeNano", default)]
    time_nano: Option<i64>,
}

/// Prefers the runtime's nanosecond clock, then its second clock, and only
/// then our own capture time.
fn event_timestamp(time_nano: Option<i64>, time: Option<i64>) -> DateTime<Utc> {
    if let Some(nanos) = time_nano.filter(|nanos| *nanos > 0) {
        return DateTime::from_timestamp_nanos(nanos);
    }
    if let Some(ts) = time
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
    {
        return ts;
    }
    Utc::now()
}

/// Decodes one line of the event feed.
///
/// Returns `Ok(None)` for events that are valid but not lifecycle events of
/// a container.
pub fn decode_event(line: &str) -> Result<Option<ContainerEvent>, serde_json::Error> {
    let raw: RawEvent = serde_json::from_str(line)?;

    if raw.kind.as_deref().unwrap_or("container") != "container" {
        return Ok(None);
    }

    let Some(action_str) = raw.action.as_deref().or(raw.status.as_deref()) else {
        return Ok(None);
    };
    // Health events look like "health_status: healthy"
    let (verb, detail) = match action_str.split_once(':') {
        Some((verb, detail)) => (verb.trim(), Some(detail.trim())),
        None => (action_str.trim(), None),
    };
    let Some(action) = ContainerAction::parse(verb) else {
        return Ok(None);
    };

    let health_status = match action {
        ContainerAction::HealthStatus => {
            match detail
                .or(raw.actor.attributes.get("health_status").map(String::as_str))
                .and_then(HealthStatus::parse)
            {
                Some(status) => Some(status),
                None => {
                    log::debug!("Health event without a usable status: {action_str}");
                    return Ok(None);
                }
            }
        }
        _ => None,
    };

    let container_id = raw.actor.id.or(raw.id).unwrap_or_default();
    let container_name = raw
        .actor
        .attributes
        .get("name")
        .cloned()
        .unwrap_or_else(|| container_id.clone());
    let image = raw
        .actor
        .attributes
        .get("image")
        .cloned()
        .or(raw.from)
        .unwrap_or_default();
    let exit_code = match action {
        ContainerAction::Die => raw
            .actor
            .attributes
            .get("exitCode")
            .and_then(|code| code.parse().ok()),
        _ => None,
    };

    Ok(Some(ContainerEvent {
        action,
        container_name,
        container_id,
        image,
        timestamp: event_timestamp(raw.time_nano, raw.time),
        health_status,
        exit_code,
    }))
}

#[derive(Debug, Clone)]
struct EventFilter {
    names: Vec<String>,
    capture_all: bool,
    reserved_prefix: String,
}

impl EventFilter {
    fn accepts(&self, container_name: &str) -> bool {
        if !self.reserved_prefix.is_empty() && container_name.starts_with(&self.reserved_prefix) {
            return false;
        }
        self.capture_all
            || self
                .names
                .iter()
                .any(|name| container_name.contains(name.as_str()))
    }
}

/// Everything the background task needs to process a line.
struct Ingest {
    filter: EventFilter,
    callbacks: Vec<EventCallback>,
    events: Arc<Mutex<Vec<ContainerEvent>>>,
    audit_log: Arc<Mutex<Vec<String>>>,
    sender: broadcast::Sender<ContainerEvent>,
}

impl Ingest {
    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event = match decode_event(line) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Skipping undecodable event line: {e}");
                return;
            }
        };
        if !self.filter.accepts(&event.container_name) {
            log::trace!("Ignoring event for {}", event.container_name);
            return;
        }

        log::debug!(
            "{} {} at {}",
            event.container_name,
            event.action.as_ref(),
            event.timestamp
        );
        lock(&self.events).push(event.clone());
        if self.filter.capture_all {
            lock(&self.audit_log).push(line.to_string());
        }
        for callback in &self.callbacks {
            callback(&event);
        }
        // Fails only when nobody subscribed
        let _ = self.sender.send(event);
    }
}

/// Tails the container runtime event feed in a background task.
pub struct EventListener {
    source: Arc<dyn EventSource>,
    settings: ListenerSettings,
    filters: Vec<String>,
    callbacks: Vec<EventCallback>,
    events: Arc<Mutex<Vec<ContainerEvent>>>,
    audit_log: Arc<Mutex<Vec<String>>>,
    sender: broadcast::Sender<ContainerEvent>,
    task: Option<JoinHandle<()>>,
    cancel_tx: Option<mpsc::Sender<()>>,
    process: Option<Child>,
}

impl EventListener {
    pub fn new(source: Arc<dyn EventSource>, settings: ListenerSettings) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            source,
            settings,
            filters: Vec::new(),
            callbacks: Vec::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            audit_log: Arc::new(Mutex::new(Vec::new())),
            sender,
            task: None,
            cancel_tx: None,
            process: None,
        }
    }

    /// Container name substrings to record. Applied on the next `start`.
    pub fn set_filters(&mut self, filters: Vec<String>) {
        self.filters = filters;
    }

    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: Fn(&ContainerEvent) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    /// Receives every accepted event after it has been recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn start(&mut self) -> Result<(), MonitorError> {
        if self.task.is_some() {
            log::warn!("Event listener already started");
            return Ok(());
        }

        let EventSubscription { mut lines, process } = self.source.subscribe().await?;
        let ingest = Ingest {
            filter: EventFilter {
                names: self.filters.clone(),
                capture_all: self.settings.capture_all,
                reserved_prefix: self.settings.reserved_prefix.clone(),
            },
            callbacks: self.callbacks.clone(),
            events: Arc::clone(&self.events),
            audit_log: Arc::clone(&self.audit_log),
            sender: self.sender.clone(),
        };
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break,
                    line = lines.next() => match line {
                        Some(Ok(line)) => ingest.handle_line(&line),
                        Some(Err(e)) => {
                            log::error!("Event stream read failed, listener stops ingesting: {e}");
                            break;
                        }
                        None => {
                            log::warn!("Event stream closed");
                            break;
                        }
                    }
                }
            }
        });

        log::info!(
            "Event listener started (filters: {:?}, capture all: {})",
            self.filters,
            self.settings.capture_all
        );
        self.task = Some(task);
        self.cancel_tx = Some(cancel_tx);
        self.process = process;
        Ok(())
    }

    /// Stops ingestion. Safe to call when not running.
    pub async fn stop(&mut self) {
        let grace = self.settings.stop_grace;
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.try_send(());
        }

        let abort = task.abort_handle();
        if tokio::time::timeout(grace, task).await.is_err() {
            log::warn!("Event listener task did not exit within {grace:?}, aborting it");
            abort.abort();
        }
        if let Some(process) = self.process.take() {
            terminate_process(process, grace).await;
        }
        log::info!("Event listener stopped");
    }

    /// Snapshot of every accepted event, in arrival order.
    pub fn events(&self) -> Vec<ContainerEvent> {
        lock(&self.events).clone()
    }

    /// Raw lines recorded in capture-all mode.
    pub fn audit_log(&self) -> Vec<String> {
        lock(&self.audit_log).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.events).clear();
        lock(&self.audit_log).clear();
    }

    pub async fn write_audit_log(&self, path: &Path) -> Result<(), MonitorError> {
        let mut contents = self.audit_log().join("\n");
        contents.push('\n');
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

/// SIGTERM, wait `grace`, then SIGKILL.
async fn terminate_process(mut process: Child, grace: Duration) {
    if let Some(pid) = process.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            log::debug!("Unable to send SIGTERM to event subprocess: {e}");
        }
    }
    match tokio::time::timeout(grace, process.wait()).await {
        Ok(Ok(status)) => log::debug!("Event subprocess exited with {status}"),
        Ok(Err(e)) => log::warn!("Unable to wait for event subprocess: {e}"),
        Err(_) => {
            log::warn!("Event subprocess ignored SIGTERM for {grace:?}, killing it");
            if let Err(e) = process.kill().await {
                log::error!("Unable to kill event subprocess: {e}");
            }
        }
    }
}
