use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::PerfConfig;

/// Result of one call to the lifecycle collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    pub success: bool,
    pub message: String,
}

impl LifecycleOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Brings whole environments up and down. Failures are reported through
/// the outcome, never as errors.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self, env: &str, timeout: Duration) -> LifecycleOutcome;
    async fn stop(&self, env: &str, remove_volumes: bool, timeout: Duration) -> LifecycleOutcome;
    async fn cleanup(&self, env: &str, timeout: Duration) -> LifecycleOutcome;
    async fn list_environments(&self) -> Vec<String>;
}

struct ComposeProject {
    dir: PathBuf,
    project: String,
}

/// Drives environments through `docker compose`.
pub struct ComposeLifecycle {
    binary: String,
    projects: BTreeMap<String, ComposeProject>,
}

impl ComposeLifecycle {
    pub fn from_config(config: &PerfConfig) -> Self {
        let projects = config
            .environments
            .iter()
            .map(|env| {
                let project = ComposeProject {
                    dir: env.compose_dir(),
                    project: env.project().to_string(),
                };
                (env.name.clone(), project)
            })
            .collect();
        Self {
            binary: "docker".to_string(),
            projects,
        }
    }

    async fn compose(&self, env: &str, args: &[&str], timeout: Duration) -> LifecycleOutcome {
        let Some(project) = self.projects.get(env) else {
            return LifecycleOutcome::failed(format!("Unknown environment {env}"));
        };

        log::debug!("docker compose -p {} {}", project.project, args.join(" "));
        let child = Command::new(&self.binary)
            .arg("compose")
            .args(["-p", &project.project])
            .args(args)
            .current_dir(&project.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to invoke docker compose at {:?}: {e}", project.dir);
                return LifecycleOutcome::failed(format!("Failed to invoke docker compose: {e}"));
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                LifecycleOutcome::ok(format!("docker compose {} succeeded", args.join(" ")))
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log::warn!(
                    "docker compose {} for {env} exited with code {:?}",
                    args.join(" "),
                    output.status.code()
                );
                LifecycleOutcome::failed(format!(
                    "docker compose {} exited with code {:?}: {}",
                    args.join(" "),
                    output.status.code(),
                    stderr.trim()
                ))
            }
            Ok(Err(e)) => LifecycleOutcome::failed(format!("docker compose failed: {e}")),
            // dropping the future kills the child
            Err(_) => LifecycleOutcome::failed(format!(
                "docker compose {} timed out after {timeout:?}",
                args.join(" ")
            )),
        }
    }
}

#[async_trait]
impl Lifecycle for ComposeLifecycle {
    async fn start(&self, env: &str, timeout: Duration) -> LifecycleOutcome {
        log::info!("Starting environment {env}");
        self.compose(env, &["up", "-d"], timeout).await
    }

    async fn stop(&self, env: &str, remove_volumes: bool, timeout: Duration) -> LifecycleOutcome {
        log::info!("Stopping environment {env}");
        let args: &[&str] = if remove_volumes {
            &["down", "--volumes"]
        } else {
            &["down"]
        };
        self.compose(env, args, timeout).await
    }

    async fn cleanup(&self, env: &str, timeout: Duration) -> LifecycleOutcome {
        log::info!("Cleaning up environment {env}");
        self.compose(env, &["down", "--volumes", "--remove-orphans"], timeout)
            .await
    }

    async fn list_environments(&self) -> Vec<String> {
        self.projects
            .iter()
            .filter(|(_, project)| project.dir.is_dir())
            .map(|(name, _)| name.clone())
            .collect()
    }
}
