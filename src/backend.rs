//! The contract every container runtime backend satisfies.
//!
//! A backend is the narrow seam between the user facing [Container] handle
//! and a concrete runtime: the subprocess driven [CliBackend], the native
//! [DockerBackend], or any third-party adapter registered through
//! [crate::register].
//!
//! [Container]: crate::container::Container
//! [CliBackend]: crate::cli::CliBackend
//! [DockerBackend]: crate::docker::DockerBackend

use crate::composition::Composition;
use crate::error::Result;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A single host-side binding of a published container port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBinding {
    /// Host interface the port is bound on, e.g. `0.0.0.0` or `::`.
    pub host_ip: String,
    /// Host port number, as reported by the runtime.
    pub host_port: String,
}

/// Coarse container status as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
    #[default]
    Unknown,
}

impl ContainerStatus {
    pub(crate) fn parse(s: &str) -> ContainerStatus {
        match s {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            "removing" => ContainerStatus::Removing,
            _ => ContainerStatus::Unknown,
        }
    }
}

/// Runtime state of a container, taken from its inspect output.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub running: bool,
    pub exit_code: i64,
    /// Health status when the image defines a healthcheck:
    /// `starting`, `healthy` or `unhealthy`.
    pub health: Option<String>,
}

/// The backend return shape for inspect operations.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    /// Runtime assigned container identifier.
    pub id: String,
    /// Generated container name, without the daemon's leading slash.
    pub name: String,
    /// Creation time as reported by the runtime (RFC 3339).
    pub created: String,
    pub state: ContainerState,
    /// Address on the container's primary network; empty when none is
    /// assigned yet.
    pub ip_address: String,
    pub labels: HashMap<String, String>,
    /// `"port/proto"` to the ordered host bindings for that port. Ports
    /// that are exposed but not bound map to an empty vector.
    pub ports: HashMap<String, Vec<HostBinding>>,
}

/// Combined result of executing a command inside a container.
///
/// A non-zero exit code is an ordinary outcome, not an error; only
/// transport and runtime failures surface as [TestctrError].
///
/// [TestctrError]: crate::error::TestctrError
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Stdout and stderr, merged in write order.
    pub output: String,
}

/// Operations a container runtime exposes to the library.
///
/// Implementations must be safe to call concurrently; every operation is
/// independently atomic and returns a structured error instead of
/// panicking. Backends that start containers as part of
/// [create_container](Backend::create_container) must keep
/// [start_container](Backend::start_container) idempotent.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Create (and, at the backend's discretion, start) a container from
    /// `image`, applying every field of `config`. The returned identifier
    /// is stable for the container's lifetime.
    async fn create_container(&self, image: &str, config: &Composition) -> Result<String>;

    /// Start the container. Must be a no-op if it is already running.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Gracefully stop the container within a short fixed deadline.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove the container and any ephemeral resources created for it.
    /// Removing an unknown identifier is not fatal.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Inspect the container: state, port bindings, primary address and
    /// labels are populated.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Run `argv` inside the container and capture its combined output.
    async fn exec_in_container(&self, id: &str, argv: &[String]) -> Result<ExecOutput>;

    /// The full accumulated log output to date.
    async fn container_logs(&self, id: &str) -> Result<String>;

    /// Block until `needle` first appears in the concatenated log stream,
    /// or fail with a deadline error once `timeout` elapses. Must tolerate
    /// logs that are still being produced concurrently.
    async fn wait_for_log(&self, id: &str, needle: &str, timeout: Duration) -> Result<()>;

    /// The container's address on its primary network.
    async fn internal_ip(&self, id: &str) -> Result<String>;

    /// Commit the container's filesystem to a new image, or report
    /// `unsupported`.
    async fn commit_container(&self, id: &str, image: &str) -> Result<()>;
}
