use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::{BaselineComparison, EnvironmentRecord};

/// Outcome of one start/stop cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based; the warm-up iteration is 0.
    pub iteration: usize,
    pub warmup: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds until every container was up. Taken from the slowest
    /// container's create to healthy span, or measured on the wall clock
    /// when the event feed did not cover it.
    pub startup_time: Option<f64>,
    /// Wall clock duration of the stop call.
    pub shutdown_time: Option<f64>,
    /// Seconds from the start call until each persistent container was
    /// ready. Containers that never got there record the full timeout.
    pub container_healthy_times: BTreeMap<String, f64>,
    pub startup_success: bool,
    pub all_healthy: bool,
    pub shutdown_success: bool,
    pub cleanup_success: bool,
    pub success: bool,
    pub error: Option<String>,
    pub metrics: Option<EnvironmentRecord>,
}

/// Distribution of a set of durations, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

impl TimingStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let average = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|x| (x - average).powi(2)).sum::<f64>() / n;

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            count: samples.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            average,
            median,
            std_dev: variance.sqrt(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total_iterations: usize,
    pub successful_iterations: usize,
    pub failed_iterations: usize,
    /// 0.0 - 1.0
    pub success_rate: f64,
    pub startup_times: Option<TimingStats>,
    pub shutdown_times: Option<TimingStats>,
    pub container_healthy_times: BTreeMap<String, TimingStats>,
    /// Mean over iterations of the per container average startup, the
    /// quantity baselines are recorded in.
    pub average_container_startup: Option<f64>,
}

impl TestSummary {
    /// Summarises measured iterations; the warm-up must not be passed in.
    pub fn from_iterations(iterations: &[IterationResult]) -> Self {
        let successful = iterations.iter().filter(|it| it.success).count();
        let startups: Vec<f64> = iterations.iter().filter_map(|it| it.startup_time).collect();
        let shutdowns: Vec<f64> = iterations.iter().filter_map(|it| it.shutdown_time).collect();
        let container_averages: Vec<f64> = iterations
            .iter()
            .filter_map(|it| it.metrics.as_ref()?.environment_metrics.average_startup_time)
            .collect();

        let mut healthy: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (name, time) in iterations.iter().flat_map(|it| &it.container_healthy_times) {
            healthy.entry(name.clone()).or_default().push(*time);
        }

        Self {
            total_iterations: iterations.len(),
            successful_iterations: successful,
            failed_iterations: iterations.len() - successful,
            success_rate: if iterations.is_empty() {
                0.0
            } else {
                successful as f64 / iterations.len() as f64
            },
            startup_times: TimingStats::from_samples(&startups),
            shutdown_times: TimingStats::from_samples(&shutdowns),
            container_healthy_times: healthy
                .into_iter()
                .filter_map(|(name, times)| TimingStats::from_samples(&times).map(|s| (name, s)))
                .collect(),
            average_container_startup: TimingStats::from_samples(&container_averages)
                .map(|stats| stats.average),
        }
    }
}

/// Everything measured for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub run_id: Uuid,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub warmup: Option<IterationResult>,
    pub iterations: Vec<IterationResult>,
    pub summary: TestSummary,
    pub baseline: BaselineComparison,
}

impl TestResult {
    /// True when every measured iteration succeeded.
    pub fn is_success(&self) -> bool {
        self.summary.total_iterations > 0
            && self.summary.successful_iterations == self.summary.total_iterations
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSummary {
    pub total_environments: usize,
    pub successful_environments: usize,
    pub failed_environments: usize,
    pub slowest_environment: Option<String>,
    pub fastest_environment: Option<String>,
    /// Average startup per environment, for environments that have one.
    pub average_startup_times: BTreeMap<String, f64>,
}

/// Result of running several environments one after the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub environments: BTreeMap<String, TestResult>,
    /// Environments that could not be run at all.
    pub errors: BTreeMap<String, String>,
    pub summary: CombinedSummary,
}

impl CombinedResult {
    pub fn new(
        started_at: DateTime<Utc>,
        environments: BTreeMap<String, TestResult>,
        errors: BTreeMap<String, String>,
    ) -> Self {
        let successful = environments.values().filter(|r| r.is_success()).count();
        let average_startup_times: BTreeMap<String, f64> = environments
            .iter()
            .filter_map(|(env, result)| {
                let stats = result.summary.startup_times.as_ref()?;
                Some((env.clone(), stats.average))
            })
            .collect();
        let slowest = average_startup_times
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(env, _)| env.clone());
        let fastest = average_startup_times
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(env, _)| env.clone());

        let total = environments.len() + errors.len();
        Self {
            run_id: Uuid::now_v7(),
            started_at,
            finished_at: Utc::now(),
            summary: CombinedSummary {
                total_environments: total,
                successful_environments: successful,
                failed_environments: total - successful,
                slowest_environment: slowest,
                fastest_environment: fastest,
                average_startup_times,
            },
            environments,
            errors,
        }
    }

    pub fn is_success(&self) -> bool {
        self.summary.total_environments > 0
            && self.summary.failed_environments == 0
    }
}
