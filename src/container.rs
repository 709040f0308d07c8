//! The user-visible handle of a running container.

use crate::backend::{Backend, ContainerInfo, ExecOutput, HostBinding};
use crate::dsn::DsnProvider;
use crate::error::{ErrorKind, Result, TestctrError};
use crate::ports;
use crate::utils;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{event, Level};

/// Deadline applied to each step of the end-of-scope cleanup. Cleanup runs
/// on its own runtime, so a cancelled or panicking test still tears down.
const CLEANUP_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// A running container, owned by the test that started it.
///
/// The handle routes every operation through the backend that created the
/// container and removes the container when it goes out of scope:
///
/// ```no_run
/// # use testctr::Composition;
/// # async fn a_test() {
/// {
///     let redis = Composition::with_image("redis:7-alpine").start().await;
///     // ... test body ...
/// } // container is stopped and removed here, panics included
/// # }
/// ```
///
/// Handles are safe for concurrent use; the underlying backend operations
/// are independently atomic. Cleanup can be skipped for debugging by
/// setting `TESTCTR_KEEP` (always) or `TESTCTR_KEEP_FAILED` (only when the
/// owning test panics).
pub struct Container {
    /// The runtime assigned identifier.
    id: String,
    /// The backend this container was created through.
    backend: Arc<dyn Backend>,
    /// Host bindings per `"port/proto"`, resolved on first use.
    port_map: OnceCell<HashMap<String, Vec<HostBinding>>>,
    created_at: Instant,
    dsn_provider: Option<Arc<dyn DsnProvider>>,
    /// Databases provisioned through [dsn](Container::dsn), dropped during
    /// cleanup in reverse order of creation.
    databases: Mutex<Vec<String>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("id", &self.id).finish()
    }
}

impl Container {
    pub(crate) fn new(
        id: String,
        backend: Arc<dyn Backend>,
        dsn_provider: Option<Arc<dyn DsnProvider>>,
    ) -> Container {
        Container {
            id,
            backend,
            port_map: OnceCell::new(),
            created_at: Instant::now(),
            dsn_provider,
            databases: Mutex::new(Vec::new()),
        }
    }

    /// The runtime assigned identifier for this container.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// How long ago the handle was constructed.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The host-reachable `"host:port"` address of a container port.
    ///
    /// The port map is resolved through inspect on first use and cached.
    /// The host is loopback for a local daemon, or the hostname component
    /// of `DOCKER_HOST` otherwise. Fails with a not-ready error when the
    /// container port is not bound.
    pub async fn endpoint<T: ToString>(&self, port: T) -> Result<String> {
        let port = port.to_string();
        let map = self
            .port_map
            .get_or_try_init(|| async {
                self.backend
                    .inspect_container(&self.id)
                    .await
                    .map(|info| info.ports)
            })
            .await?;

        let host_port = ports::host_port_in_map(map, &port, &self.id)?;
        Ok(format!("{}:{}", utils::endpoint_host(), host_port))
    }

    /// The container's address on its primary network.
    pub async fn internal_ip(&self) -> Result<String> {
        self.backend.internal_ip(&self.id).await
    }

    /// Run `argv` inside the container.
    ///
    /// A non-zero exit code is an ordinary result, not an error, so
    /// callers can branch on it.
    pub async fn exec<I, S>(&self, argv: I) -> Result<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let argv: Vec<String> = argv.into_iter().map(|a| a.to_string()).collect();
        self.backend.exec_in_container(&self.id, &argv).await
    }

    /// Run `argv` inside the container and return its output.
    ///
    /// # Panics
    /// Panics - failing the owning test - when the command cannot be
    /// executed or exits non-zero.
    pub async fn exec_simple<I, S>(&self, argv: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let argv: Vec<String> = argv.into_iter().map(|a| a.to_string()).collect();
        match self.backend.exec_in_container(&self.id, &argv).await {
            Ok(out) if out.exit_code == 0 => out.output,
            Ok(out) => panic!(
                "command `{}` in container {} exited {}: {}",
                argv.join(" "),
                self.id,
                out.exit_code,
                out.output.trim_end()
            ),
            Err(e) => panic!(
                "command `{}` in container {} failed: {}",
                argv.join(" "),
                self.id,
                e
            ),
        }
    }

    /// Inspect the container through its backend.
    pub async fn inspect(&self) -> Result<ContainerInfo> {
        self.backend.inspect_container(&self.id).await
    }

    /// The full log output produced so far.
    pub async fn logs(&self) -> Result<String> {
        self.backend.container_logs(&self.id).await
    }

    /// Block until `needle` appears in the log stream or `timeout`
    /// elapses.
    pub async fn wait_for_log<T: ToString>(&self, needle: T, timeout: Duration) -> Result<()> {
        self.backend
            .wait_for_log(&self.id, &needle.to_string(), timeout)
            .await
    }

    /// Commit the container's filesystem to a new image.
    pub async fn commit<T: ToString>(&self, image: T) -> Result<()> {
        self.backend
            .commit_container(&self.id, &image.to_string())
            .await
    }

    /// Provision a fresh database named `name` through the attached DSN
    /// provider and return its connection string. The database is dropped
    /// when the container is cleaned up.
    ///
    /// Fails with an unsupported error when the composition did not attach
    /// a provider.
    pub async fn dsn<T: ToString>(&self, name: T) -> Result<String> {
        let provider = self.dsn_provider.clone().ok_or_else(|| {
            TestctrError::Unsupported(
                "no DSN provider attached to this container's composition".to_string(),
            )
        })?;
        let name = name.to_string();
        let dsn = provider.create_database(self, &name).await?;
        self.databases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name);
        Ok(dsn)
    }
}

/// The destructor releases the container through its backend: databases
/// provisioned via DSN are dropped, then the container is stopped
/// (best-effort) and removed. Failures are logged with the container id
/// and error kind - cleanup never re-fails the test, and it runs during
/// panic unwinding as well. Handles dropped in one scope release in LIFO
/// order.
impl Drop for Container {
    fn drop(&mut self) {
        if utils::keep_containers() {
            event!(
                Level::INFO,
                id = %self.id,
                "keep flag set, leaving container in place"
            );
            return;
        }

        let databases: Vec<String> =
            std::mem::take(&mut *self.databases.lock().unwrap_or_else(|e| e.into_inner()));

        // Cleanup must work regardless of whether the test held a tokio
        // runtime (and whether that runtime is still alive), so it blocks
        // on a fresh current-thread runtime on a scoped helper thread.
        let joined = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            event!(
                                Level::ERROR,
                                id = %self.id,
                                error = %e,
                                "failed to build cleanup runtime, container leaks"
                            );
                            return;
                        }
                    };
                    runtime.block_on(release(self, databases));
                })
                .join()
        });

        if joined.is_err() {
            event!(Level::ERROR, id = %self.id, "container cleanup panicked");
        }
    }
}

async fn release(container: &Container, mut databases: Vec<String>) {
    event!(
        Level::DEBUG,
        id = %container.id,
        age = ?container.created_at.elapsed(),
        "cleaning up container"
    );

    if let Some(provider) = &container.dsn_provider {
        while let Some(name) = databases.pop() {
            let dropped = tokio::time::timeout(
                CLEANUP_STEP_TIMEOUT,
                provider.drop_database(container, &name),
            )
            .await;
            match dropped {
                Ok(Ok(())) => {}
                Ok(Err(e)) => event!(
                    Level::WARN,
                    id = %container.id,
                    database = %name,
                    kind = ?e.kind(),
                    error = %e,
                    "failed to drop provisioned database"
                ),
                Err(_) => event!(
                    Level::WARN,
                    id = %container.id,
                    database = %name,
                    "dropping provisioned database timed out"
                ),
            }
        }
    }

    // Best-effort stop; a container that is already gone or never ran is
    // not worth reporting.
    match tokio::time::timeout(
        CLEANUP_STEP_TIMEOUT,
        container.backend.stop_container(&container.id),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => event!(
            Level::DEBUG,
            id = %container.id,
            kind = ?e.kind(),
            error = %e,
            "stop during cleanup failed"
        ),
        Err(_) => event!(Level::DEBUG, id = %container.id, "stop during cleanup timed out"),
    }

    match tokio::time::timeout(
        CLEANUP_STEP_TIMEOUT,
        container.backend.remove_container(&container.id),
    )
    .await
    {
        Ok(Ok(())) => event!(Level::DEBUG, id = %container.id, "container removed"),
        Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {}
        Ok(Err(e)) => event!(
            Level::ERROR,
            id = %container.id,
            kind = ?e.kind(),
            error = %e,
            "failed to remove container"
        ),
        Err(_) => event!(
            Level::ERROR,
            id = %container.id,
            "removing container timed out"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_is_send_and_sync() {
        fn assert_send_and_sync<T: Send + Sync>() {}
        assert_send_and_sync::<Container>();
    }
}
