//! Runs environments through repeated start/stop cycles and summarises
//! what the monitors saw.

pub mod results;
pub mod runner;

pub use results::{CombinedResult, IterationResult, TestResult, TestSummary};
pub use runner::TestOrchestrator;

use crate::metrics::MetricsError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(String),
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}
