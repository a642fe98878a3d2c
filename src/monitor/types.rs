use bollard::models::HealthStatusEnum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle verbs we keep from the runtime event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerAction {
    Create,
    Start,
    Restart,
    Stop,
    Kill,
    Die,
    Destroy,
    HealthStatus,
}

impl ContainerAction {
    /// Parses the verb part of a docker event action. Anything outside the
    /// lifecycle set yields `None`.
    pub fn parse(verb: &str) -> Option<Self> {
        match verb {
            "create" => Some(Self::Create),
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            "stop" => Some(Self::Stop),
            "kill" => Some(Self::Kill),
            "die" => Some(Self::Die),
            "destroy" => Some(Self::Destroy),
            "health_status" => Some(Self::HealthStatus),
            _ => None,
        }
    }
}

impl AsRef<str> for ContainerAction {
    fn as_ref(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::Die => "die",
            Self::Destroy => "destroy",
            Self::HealthStatus => "health_status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// No health check configured.
    None,
}

impl HealthStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status.trim() {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "starting" => Some(Self::Starting),
            "none" | "" => Some(Self::None),
            _ => None,
        }
    }
}

impl AsRef<str> for HealthStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<HealthStatusEnum> for HealthStatus {
    fn from(status: HealthStatusEnum) -> Self {
        match status {
            HealthStatusEnum::HEALTHY => Self::Healthy,
            HealthStatusEnum::UNHEALTHY => Self::Unhealthy,
            HealthStatusEnum::STARTING => Self::Starting,
            HealthStatusEnum::EMPTY | HealthStatusEnum::NONE => Self::None,
        }
    }
}

/// One lifecycle transition observed on the runtime event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub action: ContainerAction,
    pub container_name: String,
    pub container_id: String,
    /// May be empty, the aggregator back-fills it from later events.
    pub image: String,
    pub timestamp: DateTime<Utc>,
    /// Only set when `action` is `HealthStatus`.
    pub health_status: Option<HealthStatus>,
    /// Only set on `die` events.
    pub exit_code: Option<i64>,
}

/// One edge-triggered health state change seen by the poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub container_name: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}
