//! Turns raw listener and poller history into named timing metrics.

pub mod aggregator;
pub mod baseline;
pub mod container;
pub mod environment;
pub mod report;

pub use aggregator::{MetricsAggregator, MetricsSnapshot};
pub use baseline::{Baseline, BaselineComparison, Verdict};
pub use container::ContainerMetrics;
pub use environment::{EnvironmentMetrics, EnvironmentRecord};
pub use report::{EnvironmentReport, PerformanceReport};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Environment {0} is not tracked")]
    UnknownEnvironment(String),
    #[error("Metrics of environment {0} were read before finalize")]
    NotFinalized(String),
}
