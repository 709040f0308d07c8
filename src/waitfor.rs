//! Readiness strategies applied after a container is created.

use crate::backend::{Backend, ContainerStatus};
use crate::error::{Result, TestctrError};

use std::time::Duration;
use tracing::{event, Level};

/// How often polling strategies re-check the runtime.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Predicate that determines when a container is considered ready.
#[derive(Debug, Clone, Default)]
pub enum WaitStrategy {
    /// The container is ready as soon as creation returns.
    #[default]
    None,
    /// Ready once a literal substring appears in the log stream.
    LogLine { needle: String, timeout: Duration },
    /// Ready once the runtime reports the container healthy.
    Healthy { timeout: Duration },
    /// Ready once the command exits 0 inside the container. Used for
    /// database readiness probes.
    ExecProbe {
        argv: Vec<String>,
        timeout: Duration,
    },
}

impl WaitStrategy {
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            WaitStrategy::LogLine { needle, .. } if needle.is_empty() => Err(
                TestctrError::InvalidConfig("wait-for-log needle is empty".to_string()),
            ),
            WaitStrategy::ExecProbe { argv, .. } if argv.is_empty() => Err(
                TestctrError::InvalidConfig("exec wait probe has no command".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Block until the strategy is satisfied or its timeout elapses.
    pub(crate) async fn await_ready(&self, backend: &dyn Backend, id: &str) -> Result<()> {
        match self {
            WaitStrategy::None => Ok(()),
            WaitStrategy::LogLine { needle, timeout } => {
                backend.wait_for_log(id, needle, *timeout).await
            }
            WaitStrategy::Healthy { timeout } => {
                let polling = wait_until_healthy(backend, id);
                tokio::time::timeout(*timeout, polling)
                    .await
                    .map_err(|_| {
                        TestctrError::Deadline(format!(
                            "container {} did not become healthy within {:?}",
                            id, timeout
                        ))
                    })?
            }
            WaitStrategy::ExecProbe { argv, timeout } => {
                let polling = wait_until_probe_succeeds(backend, id, argv);
                tokio::time::timeout(*timeout, polling)
                    .await
                    .map_err(|_| {
                        TestctrError::Deadline(format!(
                            "readiness probe `{}` did not exit 0 within {:?}",
                            argv.join(" "),
                            timeout
                        ))
                    })?
            }
        }
    }
}

async fn wait_until_healthy(backend: &dyn Backend, id: &str) -> Result<()> {
    loop {
        let info = backend.inspect_container(id).await?;
        if info.state.status == ContainerStatus::Exited {
            return Err(TestctrError::Runtime(format!(
                "container {} exited (code {}) while waiting for it to become healthy",
                id, info.state.exit_code
            )));
        }
        match info.state.health.as_deref() {
            Some("healthy") => return Ok(()),
            Some("unhealthy") => {
                return Err(TestctrError::Runtime(format!(
                    "container {} reported unhealthy",
                    id
                )))
            }
            other => {
                event!(Level::TRACE, id, health = ?other, "health not reached yet");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_until_probe_succeeds(
    backend: &dyn Backend,
    id: &str,
    argv: &[String],
) -> Result<()> {
    loop {
        let out = backend.exec_in_container(id, argv).await?;
        if out.exit_code == 0 {
            return Ok(());
        }
        event!(
            Level::TRACE,
            id,
            exit_code = out.exit_code,
            "readiness probe not passing yet"
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
