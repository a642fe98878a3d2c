use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use super::{
    MonitorError, lock,
    types::{HealthRecord, HealthStatus},
};

/// Observer invoked on every health transition, on the poller task.
pub type HealthCallback = Arc<dyn Fn(&HealthRecord) + Send + Sync>;

#[async_trait]
pub trait HealthInspector: Send + Sync {
    /// Resolves a container name to the id used for inspection.
    async fn resolve(&self, name: &str) -> Result<String, MonitorError>;
    async fn health_status(&self, id: &str) -> Result<HealthStatus, MonitorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    /// Interval between two inspection rounds.
    pub poll_interval: Duration,
    /// Cadence at which `wait_for_*` re-reads the status map.
    pub wait_interval: Duration,
    pub stop_grace: Duration,
}

#[derive(Default)]
struct PollerState {
    /// name -> id
    containers: Mutex<BTreeMap<String, String>>,
    current: Mutex<HashMap<String, HealthStatus>>,
    history: Mutex<Vec<HealthRecord>>,
}

impl PollerState {
    /// Records `status` for `name` and returns a record if it is a transition.
    fn observe(&self, name: &str, status: HealthStatus) -> Option<HealthRecord> {
        let previous = lock(&self.current).insert(name.to_string(), status);
        match previous {
            Some(previous) if previous == status => return None,
            // Containers without a health check never transition
            None if status == HealthStatus::None => return None,
            _ => {}
        }
        let record = HealthRecord {
            container_name: name.to_string(),
            status,
            timestamp: Utc::now(),
        };
        lock(&self.history).push(record.clone());
        Some(record)
    }
}

/// Periodically inspects registered containers and publishes health
/// transitions.
pub struct HealthPoller {
    inspector: Arc<dyn HealthInspector>,
    settings: PollerSettings,
    state: Arc<PollerState>,
    callbacks: Vec<HealthCallback>,
    task: Option<JoinHandle<()>>,
    cancel_tx: Option<mpsc::Sender<()>>,
}

impl HealthPoller {
    pub fn new(inspector: Arc<dyn HealthInspector>, settings: PollerSettings) -> Self {
        Self {
            inspector,
            settings,
            state: Arc::new(PollerState::default()),
            callbacks: Vec::new(),
            task: None,
            cancel_tx: None,
        }
    }

    /// Registers a container for polling, resolving its id when not given.
    /// Returns false when the container could not be resolved; it is then
    /// not polled until added again.
    pub async fn add_container(&self, name: &str, id: Option<String>) -> bool {
        let id = match id {
            Some(id) => id,
            None => match self.inspector.resolve(name).await {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("Unable to resolve container {name}, not polling it: {e}");
                    return false;
                }
            },
        };
        log::debug!("Polling health of {name} ({id})");
        lock(&self.state.containers).insert(name.to_string(), id);
        true
    }

    pub fn remove_container(&self, name: &str) {
        lock(&self.state.containers).remove(name);
        lock(&self.state.current).remove(name);
    }

    pub fn add_callback<F>(&mut self, callback: F)
    where
        F: Fn(&HealthRecord) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
    }

    /// Drops registrations, current statuses and history.
    pub fn clear(&self) {
        lock(&self.state.containers).clear();
        lock(&self.state.current).clear();
        lock(&self.state.history).clear();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            log::warn!("Health poller already started");
            return;
        }

        let inspector = Arc::clone(&self.inspector);
        let state = Arc::clone(&self.state);
        let callbacks = self.callbacks.clone();
        let poll_interval = self.settings.poll_interval;
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => break,
                    _ = ticker.tick() => {
                        poll_once(inspector.as_ref(), &state, &callbacks).await;
                    }
                }
            }
        });

        log::info!("Health poller started (interval {poll_interval:?})");
        self.task = Some(task);
        self.cancel_tx = Some(cancel_tx);
    }

    /// Stops polling. Safe to call when not running.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.try_send(());
        }
        let grace = self.settings.stop_grace;
        let abort = task.abort_handle();
        if tokio::time::timeout(grace, task).await.is_err() {
            log::warn!("Health poller did not exit within {grace:?}, aborting it");
            abort.abort();
        }
        log::info!("Health poller stopped");
    }

    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        lock(&self.state.current).get(name).copied()
    }

    /// Snapshot of every transition, in observation order.
    pub fn history(&self) -> Vec<HealthRecord> {
        lock(&self.state.history).clone()
    }

    pub async fn wait_for_healthy(&self, name: &str, timeout: Duration) -> bool {
        self.wait_for_status(name, HealthStatus::Healthy, timeout)
            .await
    }

    pub async fn wait_for_status(
        &self,
        name: &str,
        target: HealthStatus,
        timeout: Duration,
    ) -> bool {
        self.wait_for_any(name, &[target], timeout).await
    }

    /// Healthy, or running without a health check.
    pub async fn wait_for_ready(&self, name: &str, timeout: Duration) -> bool {
        self.wait_for_any(name, &[HealthStatus::Healthy, HealthStatus::None], timeout)
            .await
    }

    async fn wait_for_any(&self, name: &str, targets: &[HealthStatus], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .status(name)
                .is_some_and(|status| targets.contains(&status))
            {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("Timed out after {timeout:?} waiting for {name} to reach {targets:?}");
                return false;
            }
            tokio::time::sleep(self.settings.wait_interval.min(deadline - now)).await;
        }
    }
}

async fn poll_once(
    inspector: &dyn HealthInspector,
    state: &PollerState,
    callbacks: &[HealthCallback],
) {
    let targets: Vec<(String, String)> = lock(&state.containers)
        .iter()
        .map(|(name, id)| (name.clone(), id.clone()))
        .collect();

    for (name, id) in targets {
        match inspector.health_status(&id).await {
            Ok(status) => {
                if let Some(record) = state.observe(&name, status) {
                    log::debug!("{name} is now {status}");
                    for callback in callbacks {
                        callback(&record);
                    }
                }
            }
            Err(e) => log::warn!("Health inspection of {name} failed, retrying next cycle: {e}"),
        }
    }
}
