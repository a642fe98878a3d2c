use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Baseline, BaselineComparison, ContainerMetrics, EnvironmentMetrics, EnvironmentRecord,
    EnvironmentReport, MetricsError, PerformanceReport,
};
use crate::config::Thresholds;
use crate::monitor::{ContainerEvent, HealthRecord};

pub const BASELINE_FILE: &str = "baseline.json";

/// The persisted form of the aggregator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub environments: BTreeMap<String, EnvironmentRecord>,
    pub baselines: BTreeMap<String, Baseline>,
}

pub(crate) fn timestamped(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}_{}.json", Utc::now().format("%Y%m%d_%H%M%S")))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MetricsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn load_baselines(path: &Path) -> BTreeMap<String, Baseline> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            log::warn!("Unable to read baseline {path:?}: {e}");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(baselines) => {
            log::info!("Loaded baseline from {path:?}");
            baselines
        }
        Err(e) => {
            log::warn!("Ignoring corrupt baseline {path:?}: {e}");
            BTreeMap::new()
        }
    }
}

/// Folds listener and poller history into per environment metrics.
///
/// Ingestion replays the complete history every time, so each call costs
/// O(events so far). Only occurrences beyond those applied by earlier
/// replays are counted.
pub struct MetricsAggregator {
    output_dir: PathBuf,
    thresholds: Thresholds,
    environments: BTreeMap<String, EnvironmentRecord>,
    baselines: BTreeMap<String, Baseline>,
}

impl MetricsAggregator {
    /// Loads `baseline.json` from `output_dir` when present.
    pub fn new(output_dir: impl Into<PathBuf>, thresholds: Thresholds) -> Self {
        let output_dir = output_dir.into();
        let baselines = load_baselines(&output_dir.join(BASELINE_FILE));
        Self {
            output_dir,
            thresholds,
            environments: BTreeMap::new(),
            baselines,
        }
    }

    pub fn for_environment(&mut self, env: &str) -> &mut EnvironmentRecord {
        self.environments.entry(env.to_string()).or_default()
    }

    /// Drops everything tracked for `env`; container names do not carry
    /// over between iterations.
    pub fn reset_environment(&mut self, env: &str) {
        self.environments
            .insert(env.to_string(), EnvironmentRecord::default());
    }

    fn begin_replay(&mut self, env: &str) -> &mut EnvironmentRecord {
        let record = self.for_environment(env);
        record
            .containers
            .values_mut()
            .for_each(ContainerMetrics::begin_replay);
        record
    }

    /// Folds the complete event history of `env` in. Returns how many
    /// events were new.
    pub fn ingest_events(&mut self, events: &[ContainerEvent], env: &str) -> usize {
        let record = self.begin_replay(env);
        let applied = events
            .iter()
            .filter(|event| record.container(&event.container_name).apply_event(event))
            .count();
        if applied > 0 {
            record.environment_metrics.finalized = false;
        }
        log::debug!("{env}: ingested {applied} new of {} events", events.len());
        applied
    }

    /// Folds the complete health history of `env` in. Returns how many
    /// records were new.
    pub fn ingest_health_records(&mut self, records: &[HealthRecord], env: &str) -> usize {
        let record = self.begin_replay(env);
        let applied = records
            .iter()
            .filter(|health| {
                record
                    .container(&health.container_name)
                    .apply_health_record(health)
            })
            .count();
        if applied > 0 {
            record.environment_metrics.finalized = false;
        }
        log::debug!("{env}: ingested {applied} new of {} health records", records.len());
        applied
    }

    pub fn finalize(&mut self, env: &str) -> Result<EnvironmentMetrics, MetricsError> {
        let record = self
            .environments
            .get_mut(env)
            .ok_or_else(|| MetricsError::UnknownEnvironment(env.to_string()))?;
        Ok(record.finalize().clone())
    }

    pub fn environment_metrics(&self, env: &str) -> Result<&EnvironmentMetrics, MetricsError> {
        let record = self
            .environments
            .get(env)
            .ok_or_else(|| MetricsError::UnknownEnvironment(env.to_string()))?;
        if !record.environment_metrics.finalized {
            return Err(MetricsError::NotFinalized(env.to_string()));
        }
        Ok(&record.environment_metrics)
    }

    /// Copy of the current record of `env`, e.g. to keep it past a reset.
    pub fn capture(&self, env: &str) -> Option<EnvironmentRecord> {
        self.environments.get(env).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            environments: self.environments.clone(),
            baselines: self.baselines.clone(),
        }
    }

    /// Writes the snapshot to `path`, or to a timestamped file in the
    /// output directory.
    pub fn save_snapshot(&self, path: Option<&Path>) -> Result<PathBuf, MetricsError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => timestamped(&self.output_dir, "metrics"),
        };
        write_json(&path, &self.snapshot())?;
        log::info!("Metrics snapshot saved to {path:?}");
        Ok(path)
    }

    /// Replaces the tracked environments and baselines with the contents
    /// of a saved snapshot.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<(), MetricsError> {
        let raw = std::fs::read_to_string(path)?;
        let snapshot: MetricsSnapshot = serde_json::from_str(&raw)?;
        log::info!(
            "Loaded snapshot of {} taken at {}",
            path.display(),
            snapshot.timestamp
        );
        self.environments = snapshot.environments;
        self.baselines = snapshot.baselines;
        Ok(())
    }

    /// Recomputes the baseline of every finalized environment with startup
    /// data and overwrites the baseline file.
    pub fn save_baseline(&mut self) -> Result<PathBuf, MetricsError> {
        let mut updated = BTreeMap::new();
        for env in self.environments.keys() {
            let metrics = match self.environment_metrics(env) {
                Ok(metrics) => metrics,
                Err(e) => {
                    log::warn!("Baseline for {env} not updated: {e}");
                    continue;
                }
            };
            match Baseline::from_metrics(metrics) {
                Some(baseline) => {
                    log::info!(
                        "Baseline for {env}: {:.2}s average startup",
                        baseline.average_startup_time
                    );
                    updated.insert(env.clone(), baseline);
                }
                None => log::warn!("No startup data for {env}, baseline not updated"),
            }
        }
        self.baselines.extend(updated);
        let path = self.output_dir.join(BASELINE_FILE);
        write_json(&path, &self.baselines)?;
        Ok(path)
    }

    pub fn baseline(&self, env: &str) -> Option<&Baseline> {
        self.baselines.get(env)
    }

    /// Compares the finalized metrics of `env` to its baseline.
    pub fn compare_to_baseline(&self, env: &str) -> BaselineComparison {
        let current = self
            .environment_metrics(env)
            .ok()
            .and_then(|metrics| metrics.average_startup_time);
        self.compare_average(env, current)
    }

    /// Compares an externally computed average, such as the mean over
    /// several iterations, to the baseline of `env`.
    pub fn compare_average(&self, env: &str, current: Option<f64>) -> BaselineComparison {
        BaselineComparison::compare(
            self.baseline(env),
            current,
            self.thresholds.regression_percent,
        )
    }

    /// Reports every finalized environment. Environments with pending
    /// ingestions are left out.
    pub fn generate_report(&self) -> PerformanceReport {
        let environments = self
            .environments
            .iter()
            .filter_map(|(env, record)| match self.environment_metrics(env) {
                Ok(metrics) => {
                    let report = EnvironmentReport::new(
                        record,
                        metrics.clone(),
                        self.compare_to_baseline(env),
                        &self.thresholds,
                    );
                    Some((env.clone(), report))
                }
                Err(e) => {
                    log::warn!("Leaving {env} out of the report: {e}");
                    None
                }
            })
            .collect();
        PerformanceReport {
            generated_at: Utc::now(),
            environments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Verdict;
    use crate::monitor::{ContainerAction, HealthStatus};
    use chrono::TimeDelta;
    use quickcheck_macros::quickcheck;

    fn at(secs: f64) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(1_700_000_000_000_000_000) + TimeDelta::milliseconds((secs * 1000.0) as i64)
    }

    fn event(action: ContainerAction, name: &str, secs: f64) -> ContainerEvent {
        ContainerEvent {
            action,
            container_name: name.to_string(),
            container_id: format!("id-{name}"),
            image: String::new(),
            timestamp: at(secs),
            health_status: None,
            exit_code: None,
        }
    }

    fn healthy(name: &str, secs: f64) -> ContainerEvent {
        ContainerEvent {
            health_status: Some(HealthStatus::Healthy),
            ..event(ContainerAction::HealthStatus, name, secs)
        }
    }

    fn startup_events(name: &str, offset: f64, healthy_after: f64) -> Vec<ContainerEvent> {
        vec![
            event(ContainerAction::Create, name, offset),
            event(ContainerAction::Start, name, offset + 0.5),
            healthy(name, offset + healthy_after),
        ]
    }

    fn aggregator() -> MetricsAggregator {
        let dir = tempfile::tempdir().unwrap();
        MetricsAggregator::new(dir.path(), Thresholds::default())
    }

    #[test]
    fn test_ingest_and_finalize() {
        let mut agg = aggregator();
        let mut events = startup_events("db", 0.0, 4.0);
        events.extend(startup_events("web", 0.2, 5.0));

        assert_eq!(agg.ingest_events(&events, "env-a"), 6);
        assert!(matches!(
            agg.environment_metrics("env-a"),
            Err(MetricsError::NotFinalized(_))
        ));

        let metrics = agg.finalize("env-a").unwrap();
        assert_eq!(metrics.container_count, 2);
        assert_eq!(metrics.total_startup_time, Some(5.0));
        assert_eq!(metrics.slowest_container.as_deref(), Some("web"));
        assert_eq!(agg.environment_metrics("env-a").unwrap(), &metrics);
    }

    #[test]
    fn test_full_replay_is_idempotent() {
        let mut agg = aggregator();
        let mut events = startup_events("db", 0.0, 4.0);
        events.push(event(ContainerAction::Restart, "db", 6.0));

        agg.ingest_events(&events, "env-a");
        let once = agg.finalize("env-a").unwrap();

        events.push(event(ContainerAction::Stop, "db", 10.0));
        assert_eq!(agg.ingest_events(&events, "env-a"), 1);
        let twice = agg.finalize("env-a").unwrap();

        assert_eq!(once.total_restarts, 1);
        assert_eq!(twice.total_restarts, 1);
        assert_eq!(once.average_startup_time, twice.average_startup_time);
    }

    #[test]
    fn test_identical_events_in_one_history_all_count() {
        let mut agg = aggregator();
        let mut events = startup_events("db", 0.0, 4.0);
        // restart and kill/die pairs within the same second
        events.push(event(ContainerAction::Restart, "db", 6.0));
        events.push(event(ContainerAction::Restart, "db", 6.0));

        assert_eq!(agg.ingest_events(&events, "env-a"), 5);
        assert_eq!(agg.ingest_events(&events, "env-a"), 0);
        assert_eq!(agg.finalize("env-a").unwrap().total_restarts, 2);

        events.push(event(ContainerAction::Restart, "db", 6.0));
        assert_eq!(agg.ingest_events(&events, "env-a"), 1);
        assert_eq!(agg.finalize("env-a").unwrap().total_restarts, 3);
    }

    #[test]
    fn test_reads_require_finalize() {
        let mut agg = aggregator();
        agg.ingest_events(&startup_events("db", 0.0, 4.0), "env-a");
        assert!(agg.generate_report().environments.is_empty());
        assert_eq!(agg.compare_to_baseline("env-a").current_average, None);

        agg.finalize("env-a").unwrap();
        let report = agg.generate_report();
        assert_eq!(
            report.environments["env-a"].metrics.average_startup_time,
            Some(4.0)
        );
        assert_eq!(agg.compare_to_baseline("env-a").current_average, Some(4.0));

        // new data invalidates the finalized metrics again
        agg.ingest_events(&[event(ContainerAction::Stop, "db", 9.0)], "env-a");
        assert!(matches!(
            agg.environment_metrics("env-a"),
            Err(MetricsError::NotFinalized(_))
        ));
    }

    #[test]
    fn test_poll_records_fill_in_missing_health() {
        let mut agg = aggregator();
        agg.ingest_events(
            &[
                event(ContainerAction::Create, "db", 0.0),
                event(ContainerAction::Start, "db", 0.5),
            ],
            "env-a",
        );
        let record = HealthRecord {
            container_name: "db".to_string(),
            status: HealthStatus::Healthy,
            timestamp: at(3.0),
        };
        assert_eq!(agg.ingest_health_records(&[record.clone()], "env-a"), 1);
        assert_eq!(agg.ingest_health_records(&[record], "env-a"), 0);

        let metrics = agg.finalize("env-a").unwrap();
        assert_eq!(metrics.average_startup_time, Some(3.0));
    }

    #[test]
    fn test_reset_environment_discards_containers() {
        let mut agg = aggregator();
        agg.ingest_events(&startup_events("db", 0.0, 4.0), "env-a");
        agg.reset_environment("env-a");
        assert_eq!(agg.finalize("env-a").unwrap().container_count, 0);
    }

    #[test]
    fn test_unknown_environment() {
        let mut agg = aggregator();
        assert!(matches!(
            agg.finalize("nope"),
            Err(MetricsError::UnknownEnvironment(_))
        ));
        assert_eq!(agg.compare_to_baseline("nope").verdict, Verdict::Unavailable);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = MetricsAggregator::new(dir.path(), Thresholds::default());
        agg.ingest_events(&startup_events("db", 0.0, 4.0), "env-a");
        agg.finalize("env-a").unwrap();

        let path = agg.save_snapshot(None).unwrap();
        assert!(path.starts_with(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("metrics_") && name.ends_with(".json"), "{name}");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["timestamp"].is_string());
        assert!(raw["environments"]["env-a"]["containers"]["db"].is_object());
        assert!(raw["baselines"].is_object());

        let mut offline = aggregator();
        offline.load_snapshot(&path).unwrap();
        assert_eq!(
            offline.environment_metrics("env-a").unwrap().average_startup_time,
            Some(4.0)
        );
    }

    #[test]
    fn test_baseline_persists_and_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = MetricsAggregator::new(dir.path(), Thresholds::default());
        agg.ingest_events(&startup_events("db", 0.0, 10.0), "env-a");
        agg.finalize("env-a").unwrap();
        let path = agg.save_baseline().unwrap();
        assert_eq!(path, dir.path().join(BASELINE_FILE));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let mut keys: Vec<_> = raw["env-a"].as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec!["average_startup_time", "max_startup_time", "min_startup_time"]
        );

        let mut next = MetricsAggregator::new(dir.path(), Thresholds::default());
        assert_eq!(next.baseline("env-a").unwrap().average_startup_time, 10.0);

        next.ingest_events(&startup_events("db", 0.0, 11.0), "env-a");
        next.finalize("env-a").unwrap();
        let comparison = next.compare_to_baseline("env-a");
        assert_eq!(comparison.verdict, Verdict::Regression);

        let report = next.generate_report();
        assert!(report.environments["env-a"]
            .recommendations
            .iter()
            .any(|line| line.contains("regressed")));
    }

    #[test]
    fn test_corrupt_baseline_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BASELINE_FILE), "{ not json").unwrap();
        let agg = MetricsAggregator::new(dir.path(), Thresholds::default());
        assert!(agg.baseline("env-a").is_none());
    }

    #[quickcheck]
    fn prop_ingest_twice_equals_once(offsets: Vec<(bool, u8, u16)>) -> bool {
        let events: Vec<ContainerEvent> = offsets
            .iter()
            .map(|(web, kind, ms)| {
                let name = if *web { "web" } else { "db" };
                let secs = *ms as f64 / 1000.0;
                match kind % 4 {
                    0 => event(ContainerAction::Create, name, secs),
                    1 => event(ContainerAction::Start, name, secs),
                    2 => event(ContainerAction::Restart, name, secs),
                    _ => healthy(name, secs),
                }
            })
            .collect();

        let mut once = aggregator();
        once.ingest_events(&events, "env");
        let mut twice = aggregator();
        twice.ingest_events(&events, "env");
        twice.ingest_events(&events, "env");

        once.finalize("env").unwrap() == twice.finalize("env").unwrap()
            && once.capture("env").map(|r| r.containers) == twice.capture("env").map(|r| r.containers)
    }
}
