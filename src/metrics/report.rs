use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    baseline::{BaselineComparison, Verdict},
    environment::{EnvironmentMetrics, EnvironmentRecord},
};
use crate::config::Thresholds;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub metrics: EnvironmentMetrics,
    pub baseline: BaselineComparison,
    pub recommendations: Vec<String>,
}

impl EnvironmentReport {
    /// `metrics` are the finalized aggregate of `record`.
    pub fn new(
        record: &EnvironmentRecord,
        metrics: EnvironmentMetrics,
        baseline: BaselineComparison,
        thresholds: &Thresholds,
    ) -> Self {
        let recommendations = recommendations(record, &metrics, &baseline, thresholds);
        Self {
            metrics,
            baseline,
            recommendations,
        }
    }
}

fn recommendations(
    record: &EnvironmentRecord,
    metrics: &EnvironmentMetrics,
    baseline: &BaselineComparison,
    thresholds: &Thresholds,
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(average) = metrics
        .average_startup_time
        .filter(|average| *average > thresholds.slow_startup_secs)
    {
        out.push(format!(
            "Slow startup: average {average:.1}s exceeds {:.0}s, review image sizes and health check intervals",
            thresholds.slow_startup_secs
        ));
    }
    if metrics.health_check_failure_rate > thresholds.health_failure_rate {
        out.push(format!(
            "High health check failure rate: {:.1}% (limit {:.1}%), review health check commands and start periods",
            metrics.health_check_failure_rate * 100.0,
            thresholds.health_failure_rate * 100.0
        ));
    }
    for container in record.containers.values().filter(|c| c.restart_count > 0) {
        out.push(format!(
            "Container {} restarted {} time(s), check its logs for crash loops",
            container.container_name, container.restart_count
        ));
    }
    if let (Verdict::Regression, Some(change)) = (baseline.verdict, baseline.change_percent) {
        out.push(format!(
            "Startup regressed {change:.1}% against the saved baseline"
        ));
    }
    if metrics.data_quality_errors > 0 {
        out.push(format!(
            "{} duration(s) dropped because events arrived out of order",
            metrics.data_quality_errors
        ));
    }
    out
}

/// Per environment metrics plus recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub environments: BTreeMap<String, EnvironmentReport>,
}

fn secs(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.2}s"),
        None => "n/a".to_string(),
    }
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Performance report ({})", self.generated_at.to_rfc3339())?;
        if self.environments.is_empty() {
            return writeln!(f, "  no environments tracked");
        }

        for (name, env) in &self.environments {
            let m = &env.metrics;
            writeln!(f)?;
            writeln!(f, "[{name}]")?;
            writeln!(f, "  containers:            {}", m.container_count)?;
            writeln!(f, "  average startup:       {}", secs(m.average_startup_time))?;
            writeln!(
                f,
                "  slowest:               {} ({})",
                m.slowest_container.as_deref().unwrap_or("-"),
                secs(m.total_startup_time)
            )?;
            writeln!(
                f,
                "  fastest:               {} ({})",
                m.fastest_container.as_deref().unwrap_or("-"),
                secs(m.fastest_startup_time)
            )?;
            writeln!(f, "  average shutdown:      {}", secs(m.average_shutdown_time))?;
            writeln!(
                f,
                "  health failure rate:   {:.1}%",
                m.health_check_failure_rate * 100.0
            )?;
            match (env.baseline.verdict, env.baseline.change_percent) {
                (Verdict::Unavailable, _) | (_, None) => writeln!(f, "  baseline:              n/a")?,
                (verdict, Some(change)) => {
                    writeln!(f, "  baseline:              {change:+.1}% ({verdict:?})")?
                }
            }
            for line in &env.recommendations {
                writeln!(f, "  - {line}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Baseline, ContainerMetrics};

    fn record(startup: f64, restarts: u32, failures: u32, observations: u32) -> EnvironmentRecord {
        let mut record = EnvironmentRecord::default();
        let mut db = ContainerMetrics::new("db");
        db.total_startup_time = Some(startup);
        db.restart_count = restarts;
        db.health_check_failures = failures;
        db.health_observations = observations;
        record.containers.insert("db".to_string(), db);
        record.finalize();
        record
    }

    fn unavailable() -> BaselineComparison {
        BaselineComparison::compare(None, None, 5.0)
    }

    fn env_report(
        record: &EnvironmentRecord,
        baseline: BaselineComparison,
        thresholds: &Thresholds,
    ) -> EnvironmentReport {
        EnvironmentReport::new(record, record.environment_metrics.clone(), baseline, thresholds)
    }

    #[test]
    fn test_healthy_environment_has_no_recommendations() {
        let report = env_report(&record(4.0, 0, 0, 2), unavailable(), &Thresholds::default());
        assert!(report.recommendations.is_empty(), "{:?}", report.recommendations);
    }

    #[test]
    fn test_recommendation_heuristics() {
        let report = env_report(&record(75.0, 2, 1, 4), unavailable(), &Thresholds::default());
        let text = report.recommendations.join("\n");

        assert_eq!(report.recommendations.len(), 3, "{text}");
        assert!(text.contains("Slow startup"));
        assert!(text.contains("25.0%"));
        assert!(text.contains("db restarted 2"));
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let thresholds = Thresholds {
            slow_startup_secs: 3.0,
            ..Default::default()
        };
        let report = env_report(&record(4.0, 0, 0, 2), unavailable(), &thresholds);
        assert_eq!(report.recommendations.len(), 1);
    }

    #[test]
    fn test_regression_adds_recommendation_and_renders() {
        let baseline = Baseline {
            average_startup_time: 10.0,
            min_startup_time: 10.0,
            max_startup_time: 10.0,
        };
        let comparison = BaselineComparison::compare(Some(&baseline), Some(11.0), 5.0);
        let env = env_report(&record(11.0, 0, 0, 1), comparison, &Thresholds::default());
        assert!(env.recommendations[0].contains("regressed 10.0%"));

        let report = PerformanceReport {
            generated_at: Utc::now(),
            environments: BTreeMap::from([("env-a".to_string(), env)]),
        };
        let text = report.to_string();
        assert!(text.contains("[env-a]"));
        assert!(text.contains("+10.0% (Regression)"));
        assert!(text.contains("11.00s"));
    }
}
