//! Measures how long compose environments take to come up and go down.

pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
#[cfg(test)]
mod testing;
