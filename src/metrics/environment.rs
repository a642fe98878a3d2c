use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::container::ContainerMetrics;

/// Aggregate over every container of one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentMetrics {
    pub container_count: usize,
    pub average_startup_time: Option<f64>,
    /// Startup of the slowest container, i.e. when the environment as a
    /// whole was up.
    pub total_startup_time: Option<f64>,
    pub fastest_startup_time: Option<f64>,
    pub slowest_container: Option<String>,
    pub fastest_container: Option<String>,
    pub average_shutdown_time: Option<f64>,
    pub health_check_failure_rate: f64,
    pub total_health_check_failures: u32,
    pub total_restarts: u32,
    pub data_quality_errors: usize,
    pub finalized: bool,
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

impl EnvironmentMetrics {
    /// Startup per container is its `total_startup_time`. Containers
    /// without one are counted but do not take part in the timing fields.
    pub fn compute<'a>(containers: impl IntoIterator<Item = &'a ContainerMetrics>) -> Self {
        let mut metrics = Self::default();
        let mut startups: Vec<(&str, f64)> = Vec::new();
        let mut shutdowns = Vec::new();
        let mut observations = 0u32;

        for container in containers {
            metrics.container_count += 1;
            metrics.total_health_check_failures += container.health_check_failures;
            metrics.total_restarts += container.restart_count;
            metrics.data_quality_errors += container.data_quality_errors.len();
            observations += container.health_observations;

            if let Some(startup) = container.total_startup_time {
                startups.push((container.container_name.as_str(), startup));
            }
            if let Some(shutdown) = container.shutdown_duration {
                shutdowns.push(shutdown);
            }
        }

        let times: Vec<f64> = startups.iter().map(|(_, t)| *t).collect();
        metrics.average_startup_time = average(&times);
        metrics.average_shutdown_time = average(&shutdowns);

        // max_by keeps the last of equal elements, min_by the first
        if let Some((name, time)) = startups.iter().rev().max_by(|a, b| a.1.total_cmp(&b.1)) {
            metrics.slowest_container = Some(name.to_string());
            metrics.total_startup_time = Some(*time);
        }
        if let Some((name, time)) = startups.iter().min_by(|a, b| a.1.total_cmp(&b.1)) {
            metrics.fastest_container = Some(name.to_string());
            metrics.fastest_startup_time = Some(*time);
        }

        if observations > 0 {
            metrics.health_check_failure_rate =
                metrics.total_health_check_failures as f64 / observations as f64;
        }
        metrics
    }
}

/// Everything tracked for one environment during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub environment_metrics: EnvironmentMetrics,
    pub containers: BTreeMap<String, ContainerMetrics>,
}

impl Default for EnvironmentRecord {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            environment_metrics: EnvironmentMetrics::default(),
            containers: BTreeMap::new(),
        }
    }
}

impl EnvironmentRecord {
    pub fn container(&mut self, name: &str) -> &mut ContainerMetrics {
        self.containers
            .entry(name.to_string())
            .or_insert_with(|| ContainerMetrics::new(name))
    }

    /// Stamps `end_time` and recomputes the aggregate.
    pub fn finalize(&mut self) -> &EnvironmentMetrics {
        self.end_time = Some(Utc::now());
        self.environment_metrics = EnvironmentMetrics::compute(self.containers.values());
        self.environment_metrics.finalized = true;
        &self.environment_metrics
    }

    /// Folds a later capture of the same iteration into this one. Containers
    /// seen later replace earlier entries, containers only seen earlier are
    /// kept.
    pub fn merge(&mut self, later: EnvironmentRecord) {
        self.start_time = self.start_time.min(later.start_time);
        self.end_time = later.end_time.or(self.end_time);
        self.containers.extend(later.containers);
        self.environment_metrics = EnvironmentMetrics::compute(self.containers.values());
        self.environment_metrics.finalized = true;
    }
}
