use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("perf-results")
}

fn default_iterations() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_reserved_prefix() -> String {
    "perfmon-logcollector".to_string()
}

fn default_one_shot_markers() -> Vec<String> {
    vec!["init".to_string(), "setup".to_string(), "migrate".to_string()]
}

/// Top level configuration of a performance run.
///
/// Loaded once from a TOML file and handed to every component at
/// construction time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerfConfig {
    /// Directory where snapshots, results and the baseline file are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Number of measured iterations per environment.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Run one discarded warm-up iteration before measuring.
    #[serde(default = "default_true")]
    pub include_warmup: bool,
    /// Record every container event in an audit log, ignoring name filters.
    #[serde(default)]
    pub capture_all_events: bool,
    /// Pass `--volumes` to the stop call.
    #[serde(default)]
    pub remove_volumes: bool,
    /// Containers starting with this prefix belong to our own log
    /// collection and are never recorded.
    #[serde(default = "default_reserved_prefix")]
    pub reserved_container_prefix: String,
    /// Service names containing any of these are treated as one-shot.
    #[serde(default = "default_one_shot_markers")]
    pub one_shot_markers: Vec<String>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default, rename = "environment")]
    pub environments: Vec<EnvironmentConfig>,
}

fn default_startup_timeout() -> u64 {
    20
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_health_poll_interval() -> u64 {
    2000
}

fn default_health_wait_interval() -> u64 {
    1000
}

fn default_settle_delay() -> u64 {
    3000
}

fn default_drain_delay() -> u64 {
    2000
}

fn default_cooldown() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// Bound for the start call and for the health wait (seconds).
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub cleanup_timeout_secs: u64,
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_health_wait_interval")]
    pub health_wait_interval_ms: u64,
    /// Pause after a successful start before re-registering health polling.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Pause after cleanup so trailing events reach the listener.
    #[serde(default = "default_drain_delay")]
    pub drain_delay_ms: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Grace period for background tasks and the event subprocess on stop.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            cleanup_timeout_secs: default_shutdown_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            health_wait_interval_ms: default_health_wait_interval(),
            settle_delay_ms: default_settle_delay(),
            drain_delay_ms: default_drain_delay(),
            cooldown_secs: default_cooldown(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}

impl TimingConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
    pub fn health_wait_interval(&self) -> Duration {
        Duration::from_millis(self.health_wait_interval_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_slow_startup() -> f64 {
    60.0
}

fn default_failure_rate() -> f64 {
    0.10
}

fn default_regression_percent() -> f64 {
    5.0
}

/// Policy thresholds used by the report and the baseline comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Average startup time above which an environment is flagged as slow.
    #[serde(default = "default_slow_startup")]
    pub slow_startup_secs: f64,
    /// Health check failure rate (0.0 - 1.0) above which it is flagged.
    #[serde(default = "default_failure_rate")]
    pub health_failure_rate: f64,
    /// Width of the neutral band around the baseline average, in percent.
    #[serde(default = "default_regression_percent")]
    pub regression_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            slow_startup_secs: default_slow_startup(),
            health_failure_rate: default_failure_rate(),
            regression_percent: default_regression_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Directory holding the compose file of this environment.
    #[serde(default)]
    pub compose_dir: Option<PathBuf>,
    /// Compose project name, defaults to the environment name.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDecl>,
}

impl EnvironmentConfig {
    pub fn project(&self) -> &str {
        self.project.as_deref().unwrap_or(&self.name)
    }

    pub fn compose_dir(&self) -> PathBuf {
        self.compose_dir
            .clone()
            .unwrap_or_else(|| Path::new("environments").join(&self.name))
    }

    /// Every container this environment is expected to create.
    pub fn expected_containers(&self) -> Vec<String> {
        self.services
            .iter()
            .map(|service| service.container_name(self.project()))
            .collect()
    }

    /// Containers that must become healthy before an iteration counts as
    /// started. One-shot services are excluded.
    pub fn persistent_containers(&self, one_shot_markers: &[String]) -> Vec<String> {
        self.services
            .iter()
            .filter(|service| service.is_persistent(one_shot_markers))
            .map(|service| service.container_name(self.project()))
            .collect()
    }
}

/// Declared role of a service in its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceRole {
    /// Expected to stay up for the lifetime of the environment.
    #[serde(alias = "persistent", alias = "Persistent")]
    #[default]
    Persistent,
    /// Runs once (init, migrations, setup) and exits.
    #[serde(
        alias = "one-shot",
        alias = "one_shot",
        alias = "oneshot",
        alias = "OneShot",
        alias = "init"
    )]
    OneShot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDecl {
    pub name: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub role: ServiceRole,
}

impl ServiceDecl {
    pub fn container_name(&self, project: &str) -> String {
        match &self.container_name {
            Some(name) => name.clone(),
            None => format!("{project}-{}-1", self.name),
        }
    }

    pub fn is_persistent(&self, one_shot_markers: &[String]) -> bool {
        if self.role == ServiceRole::OneShot {
            return false;
        }
        let name = self.name.to_lowercase();
        !one_shot_markers
            .iter()
            .any(|marker| name.contains(&marker.to_lowercase()))
    }
}

impl PerfConfig {
    pub fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(val)?;
        config.validate()?;
        Ok(config)
    }

    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        Self::try_init_from_string(&config)
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|env| env.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for env in &self.environments {
            if !seen.insert(env.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "environment '{}' is declared twice",
                    env.name
                )));
            }
            if env.services.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "environment '{}' declares no services",
                    env.name
                )));
            }
        }

        let timing = &self.timing;
        let zero_field = [
            ("startup_timeout_secs", timing.startup_timeout_secs),
            ("shutdown_timeout_secs", timing.shutdown_timeout_secs),
            ("cleanup_timeout_secs", timing.cleanup_timeout_secs),
            ("health_poll_interval_ms", timing.health_poll_interval_ms),
            ("health_wait_interval_ms", timing.health_wait_interval_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((field, _)) = zero_field {
            return Err(ConfigError::Invalid(format!("timing.{field} must be > 0")));
        }
        Ok(())
    }
}
