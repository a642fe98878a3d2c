use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures_util::future;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::{CombinedResult, IterationResult, OrchestratorError, TestResult, TestSummary};
use crate::config::{EnvironmentConfig, PerfConfig};
use crate::lifecycle::Lifecycle;
use crate::metrics::{
    EnvironmentRecord, MetricsAggregator, MetricsSnapshot, PerformanceReport,
    aggregator::{timestamped, write_json},
    container::seconds_between,
};
use crate::monitor::{
    ContainerEvent, EventListener, EventSource, HealthInspector, HealthPoller, HealthRecord,
    HealthStatus, ListenerSettings, PollerSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    HealthWait,
    StartupCapture,
    Stopping,
    CleaningUp,
    FinalCapture,
    Done,
}

impl AsRef<str> for Phase {
    fn as_ref(&self) -> &str {
        match self {
            Phase::Starting => "starting",
            Phase::HealthWait => "healthy-wait",
            Phase::StartupCapture => "metrics-capture(startup)",
            Phase::Stopping => "stopping",
            Phase::CleaningUp => "cleaning-up",
            Phase::FinalCapture => "metrics-capture(final)",
            Phase::Done => "done",
        }
    }
}

/// Seconds from `since` to the first healthy observation of `container`.
/// The event feed carries the runtime's own clock and is preferred over
/// polls; observations from before `since` are ignored.
fn first_healthy(
    events: &[ContainerEvent],
    records: &[HealthRecord],
    container: &str,
    since: DateTime<Utc>,
) -> Option<f64> {
    let from_events = events
        .iter()
        .filter(|e| e.container_name == container && e.health_status == Some(HealthStatus::Healthy))
        .map(|e| e.timestamp)
        .filter(|at| *at >= since)
        .min();
    let from_polls = || {
        records
            .iter()
            .filter(|r| r.container_name == container && r.status == HealthStatus::Healthy)
            .map(|r| r.timestamp)
            .filter(|at| *at >= since)
            .min()
    };
    from_events
        .or_else(from_polls)
        .map(|at| seconds_between(since, at))
}

#[derive(Serialize)]
struct ResultsDocument<'a, T: Serialize> {
    #[serde(flatten)]
    snapshot: MetricsSnapshot,
    results: &'a T,
}

/// Drives environments through start/stop iterations while the event
/// listener and health poller record what happens.
///
/// Environments are run one at a time; both monitors filter by container
/// name and cannot tell two environments apart.
pub struct TestOrchestrator {
    config: PerfConfig,
    lifecycle: Arc<dyn Lifecycle>,
    listener: EventListener,
    poller: HealthPoller,
    aggregator: MetricsAggregator,
    /// Environment of the iteration in progress, until its cleanup ran.
    active: Option<String>,
}

impl TestOrchestrator {
    pub fn new(
        config: PerfConfig,
        lifecycle: Arc<dyn Lifecycle>,
        events: Arc<dyn EventSource>,
        inspector: Arc<dyn HealthInspector>,
    ) -> Self {
        let timing = &config.timing;
        let mut listener = EventListener::new(
            events,
            ListenerSettings {
                capture_all: config.capture_all_events,
                reserved_prefix: config.reserved_container_prefix.clone(),
                stop_grace: timing.stop_grace(),
            },
        );
        let mut poller = HealthPoller::new(
            inspector,
            PollerSettings {
                poll_interval: timing.health_poll_interval(),
                wait_interval: timing.health_wait_interval(),
                stop_grace: timing.stop_grace(),
            },
        );
        listener.add_callback(|event| {
            log::debug!("{} {}", event.container_name, event.action.as_ref());
        });
        poller.add_callback(|record| {
            log::info!("{} is {}", record.container_name, record.status);
        });
        let aggregator =
            MetricsAggregator::new(config.output_dir.clone(), config.thresholds.clone());

        Self {
            config,
            lifecycle,
            listener,
            poller,
            aggregator,
            active: None,
        }
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn aggregator_mut(&mut self) -> &mut MetricsAggregator {
        &mut self.aggregator
    }

    async fn resolve_environment(&self, env: &str) -> Result<EnvironmentConfig, OrchestratorError> {
        let known = self.lifecycle.list_environments().await;
        match self.config.environment(env) {
            Some(config) if known.iter().any(|name| name == env) => Ok(config.clone()),
            _ => Err(OrchestratorError::UnknownEnvironment(env.to_string())),
        }
    }

    pub async fn run_environment_test(
        &mut self,
        env: &str,
        iterations: usize,
        include_warmup: bool,
    ) -> Result<TestResult, OrchestratorError> {
        let env_config = self.resolve_environment(env).await?;
        let started_at = Utc::now();
        log::info!(
            "Testing {env}: {iterations} iteration(s){}",
            if include_warmup { " after a warm-up" } else { "" }
        );

        let warmup = if include_warmup {
            let result = self.run_iteration(&env_config, 0).await;
            if iterations > 0 {
                self.cooldown().await;
            }
            Some(result)
        } else {
            None
        };

        let mut results = Vec::with_capacity(iterations);
        for iteration in 1..=iterations {
            results.push(self.run_iteration(&env_config, iteration).await);
            if iteration < iterations {
                self.cooldown().await;
            }
        }

        let summary = TestSummary::from_iterations(&results);
        let baseline = self
            .aggregator
            .compare_average(env, summary.average_container_startup);
        log::info!(
            "{env}: {}/{} iteration(s) succeeded",
            summary.successful_iterations,
            summary.total_iterations
        );

        Ok(TestResult {
            run_id: Uuid::now_v7(),
            environment: env.to_string(),
            started_at,
            finished_at: Utc::now(),
            warmup,
            iterations: results,
            summary,
            baseline,
        })
    }

    /// Runs every environment of `filter`, or every environment known to
    /// the lifecycle collaborator, one after the other. A failing
    /// environment never stops the others.
    pub async fn run_all_environments_test(&mut self, filter: Option<&[String]>) -> CombinedResult {
        let started_at = Utc::now();
        let names = match filter {
            Some(names) => names.to_vec(),
            None => self.lifecycle.list_environments().await,
        };
        let (iterations, include_warmup) = (self.config.iterations, self.config.include_warmup);

        let mut results = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (i, env) in names.iter().enumerate() {
            match self
                .run_environment_test(env, iterations, include_warmup)
                .await
            {
                Ok(result) => {
                    results.insert(env.clone(), result);
                    if i + 1 < names.len() {
                        self.cooldown().await;
                    }
                }
                Err(e) => {
                    log::error!("Skipping {env}: {e}");
                    errors.insert(env.clone(), e.to_string());
                }
            }
        }

        let combined = CombinedResult::new(started_at, results, errors);
        log::info!(
            "{}/{} environment(s) succeeded",
            combined.summary.successful_environments,
            combined.summary.total_environments
        );
        combined
    }

    pub fn generate_performance_report(&self) -> PerformanceReport {
        self.aggregator.generate_report()
    }

    /// Writes `result` next to the current metrics snapshot. A relative
    /// `filename` is placed in the output directory.
    pub fn save_results<T: Serialize>(
        &self,
        result: &T,
        filename: Option<&Path>,
    ) -> Result<PathBuf, OrchestratorError> {
        let path = match filename {
            Some(filename) => self.config.output_dir.join(filename),
            None => timestamped(&self.config.output_dir, "perf_results"),
        };
        let document = ResultsDocument {
            snapshot: self.aggregator.snapshot(),
            results: result,
        };
        write_json(&path, &document)?;
        log::info!("Results saved to {path:?}");
        Ok(path)
    }

    /// Tears down the environment of an iteration whose future was dropped
    /// before its cleanup ran, e.g. on Ctrl-C. Does nothing otherwise.
    pub async fn abort(&mut self) {
        let Some(env) = self.active.take() else {
            return;
        };
        log::warn!("Tearing down {env} after an interrupted iteration");
        let timing = self.config.timing.clone();
        let stop = self
            .lifecycle
            .stop(&env, self.config.remove_volumes, timing.shutdown_timeout())
            .await;
        if !stop.success {
            log::error!("{env}: stop failed: {}", stop.message);
        }
        let cleanup = self.lifecycle.cleanup(&env, timing.cleanup_timeout()).await;
        if !cleanup.success {
            log::error!("{env}: cleanup failed: {}", cleanup.message);
        }
        self.listener.stop().await;
        self.poller.stop().await;
    }

    async fn cooldown(&self) {
        let cooldown = self.config.timing.cooldown();
        if !cooldown.is_zero() {
            log::info!("Cooling down for {cooldown:?}");
            tokio::time::sleep(cooldown).await;
        }
    }

    /// Replays the monitors' history into the aggregator and returns a copy
    /// of the finalized record.
    fn capture(&mut self, env: &str) -> EnvironmentRecord {
        let events = self.listener.events();
        let records = self.poller.history();
        self.aggregator.ingest_events(&events, env);
        self.aggregator.ingest_health_records(&records, env);
        if let Err(e) = self.aggregator.finalize(env) {
            log::error!("Unable to finalize metrics of {env}: {e}");
        }
        self.aggregator.capture(env).unwrap_or_default()
    }

    async fn write_audit_log(&self, env: &str, iteration: usize) {
        if !self.config.capture_all_events {
            return;
        }
        let dir = &self.config.output_dir;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            log::warn!("Unable to create {dir:?}: {e}");
            return;
        }
        let path = dir.join(format!(
            "events_{env}_{iteration}_{}.jsonl",
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        match self.listener.write_audit_log(&path).await {
            Ok(()) => log::info!("Event audit log written to {path:?}"),
            Err(e) => log::warn!("Unable to write event audit log {path:?}: {e}"),
        }
    }

    /// Wait for every persistent container, concurrently. Returns the
    /// seconds from the start call until each became healthy, falling back
    /// to the moment the wait noticed; containers that time out get the
    /// full timeout.
    async fn wait_for_containers(
        &self,
        containers: &[String],
        start_time: DateTime<Utc>,
        started: Instant,
        timeout: Duration,
    ) -> Vec<(String, bool, f64)> {
        let (listener, poller) = (&self.listener, &self.poller);
        let waits = containers.iter().map(|container| async move {
            let ready = poller.wait_for_ready(container, timeout).await;
            let elapsed = if ready {
                first_healthy(&listener.events(), &poller.history(), container, start_time)
                    .unwrap_or_else(|| started.elapsed().as_secs_f64())
            } else {
                timeout.as_secs_f64()
            };
            (container.clone(), ready, elapsed)
        });
        future::join_all(waits).await
    }

    async fn run_iteration(&mut self, env: &EnvironmentConfig, iteration: usize) -> IterationResult {
        let name = env.name.as_str();
        let timing = self.config.timing.clone();
        let expected = env.expected_containers();
        let persistent = env.persistent_containers(&self.config.one_shot_markers);
        let label = match iteration {
            0 => "warm-up".to_string(),
            n => format!("iteration {n}"),
        };
        let enter = |phase: Phase| log::debug!("{name} {label}: {}", phase.as_ref());
        log::info!("{name}: {label} with {} container(s)", expected.len());

        let mut errors: Vec<String> = Vec::new();

        self.aggregator.reset_environment(name);
        self.listener.set_filters(expected.clone());
        self.listener.clear_history();
        self.poller.clear();
        for container in &persistent {
            // Usually not created yet, registered again once started
            self.poller.add_container(container, None).await;
        }
        let listener_ok = match self.listener.start().await {
            Ok(()) => true,
            Err(e) => {
                log::error!("{name}: event listener unavailable: {e}");
                errors.push(format!("Event listener unavailable: {e}"));
                false
            }
        };
        let start_time = Utc::now();
        let started = Instant::now();
        self.poller.start();

        enter(Phase::Starting);
        self.active = Some(name.to_string());
        let start = self.lifecycle.start(name, timing.startup_timeout()).await;

        let mut startup_record = None;
        let mut startup_time = None;
        let mut container_healthy_times = BTreeMap::new();
        let mut all_healthy = false;

        if start.success {
            tokio::time::sleep(timing.settle_delay()).await;
            for container in &persistent {
                self.poller.add_container(container, None).await;
            }

            enter(Phase::HealthWait);
            let outcomes = self
                .wait_for_containers(&persistent, start_time, started, timing.startup_timeout())
                .await;
            let wall_clock = started.elapsed().as_secs_f64();
            all_healthy = outcomes.iter().all(|(_, ready, _)| *ready);
            for (container, ready, elapsed) in outcomes {
                if !ready {
                    log::warn!("{name}: {container} not ready within {:?}", timing.startup_timeout());
                    errors.push(format!("{container} not ready within {:?}", timing.startup_timeout()));
                }
                container_healthy_times.insert(container, elapsed);
            }

            // Listeners keep running, shutdown events are still to come
            enter(Phase::StartupCapture);
            let record = self.capture(name);
            if record.containers.is_empty() {
                log::warn!("{name}: no lifecycle events recorded, is the event feed running?");
            }
            startup_time = match record.environment_metrics.total_startup_time {
                Some(total) if all_healthy => Some(total),
                _ => Some(wall_clock),
            };
            startup_record = Some(record);
        } else {
            log::error!("{name}: start failed: {}", start.message);
            errors.push(format!("Start failed: {}", start.message));
        }

        // Inspecting containers that are being torn down only yields errors
        for container in &persistent {
            self.poller.remove_container(container);
        }

        enter(Phase::Stopping);
        let stop_began = Instant::now();
        let stop = self
            .lifecycle
            .stop(name, self.config.remove_volumes, timing.shutdown_timeout())
            .await;
        let shutdown_time = Some(stop_began.elapsed().as_secs_f64());
        if !stop.success {
            log::error!("{name}: stop failed: {}", stop.message);
            errors.push(format!("Stop failed: {}", stop.message));
        }

        enter(Phase::CleaningUp);
        let cleanup = self
            .lifecycle
            .cleanup(name, timing.cleanup_timeout())
            .await;
        if !cleanup.success {
            log::error!("{name}: cleanup failed: {}", cleanup.message);
            errors.push(format!("Cleanup failed: {}", cleanup.message));
        }
        self.active = None;

        tokio::time::sleep(timing.drain_delay()).await;
        self.listener.stop().await;
        self.poller.stop().await;

        enter(Phase::FinalCapture);
        let final_record = self.capture(name);
        let record = match startup_record {
            Some(mut startup) => {
                startup.merge(final_record);
                startup
            }
            None => final_record,
        };
        *self.aggregator.for_environment(name) = record.clone();
        self.write_audit_log(name, iteration).await;

        let success =
            listener_ok && start.success && all_healthy && stop.success && cleanup.success;
        enter(Phase::Done);
        match startup_time {
            Some(secs) => log::info!(
                "{name}: {label} {} (startup {secs:.2}s)",
                if success { "succeeded" } else { "failed" }
            ),
            None => log::info!("{name}: {label} failed"),
        }

        IterationResult {
            iteration,
            warmup: iteration == 0,
            start_time,
            end_time: Utc::now(),
            startup_time,
            shutdown_time,
            container_healthy_times,
            startup_success: start.success,
            all_healthy,
            shutdown_success: stop.success,
            cleanup_success: cleanup.success,
            success,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            metrics: Some(record),
        }
    }
}
