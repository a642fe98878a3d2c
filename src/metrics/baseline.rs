use serde::{Deserialize, Serialize};

use super::environment::EnvironmentMetrics;

/// Reference startup statistics of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub average_startup_time: f64,
    pub min_startup_time: f64,
    pub max_startup_time: f64,
}

impl Baseline {
    pub fn from_metrics(metrics: &EnvironmentMetrics) -> Option<Self> {
        let average = metrics.average_startup_time?;
        Some(Self {
            average_startup_time: average,
            min_startup_time: metrics.fastest_startup_time.unwrap_or(average),
            max_startup_time: metrics.total_startup_time.unwrap_or(average),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Improvement,
    Regression,
    Neutral,
    /// No baseline, or nothing to compare against it.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub has_baseline: bool,
    pub baseline_average: Option<f64>,
    pub current_average: Option<f64>,
    /// Positive means slower than the baseline.
    pub change_percent: Option<f64>,
    pub verdict: Verdict,
}

impl BaselineComparison {
    /// Changes strictly beyond `threshold_percent` in either direction are
    /// flagged, everything inside the band is neutral.
    pub fn compare(baseline: Option<&Baseline>, current: Option<f64>, threshold_percent: f64) -> Self {
        let baseline_average = baseline.map(|b| b.average_startup_time);
        let change_percent = match (baseline_average, current) {
            (Some(base), Some(current)) if base > 0.0 => Some((current - base) / base * 100.0),
            _ => None,
        };
        let verdict = match change_percent {
            None => Verdict::Unavailable,
            Some(change) if change > threshold_percent => Verdict::Regression,
            Some(change) if change < -threshold_percent => Verdict::Improvement,
            Some(_) => Verdict::Neutral,
        };
        Self {
            has_baseline: baseline.is_some(),
            baseline_average,
            current_average: current,
            change_percent,
            verdict,
        }
    }
}
