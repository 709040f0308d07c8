//! Represent the desired configuration of a container, before it is
//! started through a backend.

use crate::backend::Backend;
use crate::cli;
use crate::container::Container;
use crate::dsn::DsnProvider;
use crate::error::{Result, TestctrError};
use crate::ports::normalize_port_key;
use crate::registry::default_registry;
use crate::waitfor::WaitStrategy;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// Upper bound on create-to-ready when none is configured.
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// A file staged for copy-in before the container starts serving.
#[derive(Clone, Debug)]
pub struct CopiedFile {
    /// Raw file contents.
    pub contents: Vec<u8>,
    /// Absolute destination path inside the container.
    pub destination: String,
    /// Optional unix permission bits applied after the copy.
    pub mode: Option<u32>,
}

/// How the backend for a composition is chosen at start.
#[derive(Clone, Default)]
enum BackendSelector {
    /// The process-wide default: the CLI backend.
    #[default]
    Default,
    /// A backend registered by name.
    Named(String),
    /// A concrete backend instance supplied by the caller.
    Instance(Arc<dyn Backend>),
}

/// Describes the container a test wants: image, environment, ports,
/// mounts, readiness condition and the backend that should run it.
///
/// A `Composition` is assembled with chainable `with_*` setters and
/// consumed by [start](Composition::start), which yields the running
/// [Container] handle.
///
/// # Examples
/// ```no_run
/// # use testctr::Composition;
/// # use std::time::Duration;
/// # async fn example() {
/// let redis = Composition::with_image("redis:7-alpine")
///     .with_port(6379)
///     .with_wait_for_log("Ready to accept connections", Duration::from_secs(30))
///     .start()
///     .await;
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Composition {
    /// The image reference the container is created from.
    image: String,

    /// Environment variables passed to the container.
    env: HashMap<String, String>,

    /// The command to pass to the container; empty means the image default.
    cmd: Vec<String>,

    /// Exposed container ports as `"port/proto"`; the host side is always
    /// assigned by the runtime.
    ports: Vec<String>,

    /// Bind mounts in the form of (host path, container path).
    mounts: Vec<(String, String)>,

    /// Files copied into the container after creation.
    files: Vec<CopiedFile>,

    /// Labels attached to the container.
    labels: HashMap<String, String>,

    /// The primary network to attach the container to.
    network: Option<String>,

    /// Runtime binary override; only meaningful for the CLI backend.
    runtime: Option<String>,

    /// How to decide the container is ready for the test body.
    wait: WaitStrategy,

    startup_timeout: Duration,

    backend: BackendSelector,

    dsn: Option<Arc<dyn DsnProvider>>,
}

impl Composition {
    /// Creates a `Composition` running the provided image reference.
    pub fn with_image<T: ToString>(image: T) -> Composition {
        Composition {
            image: image.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            ..Default::default()
        }
    }

    /// Expose a container port. A bare number defaults to tcp; the host
    /// port is assigned by the runtime and discovered through
    /// [Container::endpoint](crate::Container::endpoint).
    ///
    /// Repeated calls accumulate; duplicates are dropped when the
    /// composition starts.
    pub fn with_port<T: ToString>(mut self, port: T) -> Composition {
        self.ports.push(port.to_string());
        self
    }

    /// Sets the environment variable to the given value.
    ///
    /// A later call for the same key overwrites the earlier value.
    pub fn with_env<T: ToString, S: ToString>(mut self, name: T, value: S) -> Composition {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    /// Sets the command of the container, replacing any previous one.
    ///
    /// An empty command means the image default is used.
    pub fn with_cmd<T: ToString>(self, cmd: impl IntoIterator<Item = T>) -> Composition {
        Composition {
            cmd: cmd.into_iter().map(|c| c.to_string()).collect(),
            ..self
        }
    }

    /// Appends one entry to the command vector.
    pub fn cmd<T: ToString>(&mut self, arg: T) -> &mut Composition {
        self.cmd.push(arg.to_string());
        self
    }

    /// Mutating form of [with_env](Composition::with_env).
    pub fn add_env<T: ToString, S: ToString>(&mut self, name: T, value: S) -> &mut Composition {
        self.env.insert(name.to_string(), value.to_string());
        self
    }

    /// Bind-mount `host_path` into the container at `container_path`.
    /// Mounts are applied in the order they were added.
    pub fn with_bind_mount<T: ToString, S: ToString>(
        mut self,
        host_path: T,
        container_path: S,
    ) -> Composition {
        self.mounts
            .push((host_path.to_string(), container_path.to_string()));
        self
    }

    /// Copy `contents` to `destination` inside the container before the
    /// wait strategy runs.
    pub fn with_file<T: ToString>(
        mut self,
        contents: impl Into<Vec<u8>>,
        destination: T,
    ) -> Composition {
        self.files.push(CopiedFile {
            contents: contents.into(),
            destination: destination.to_string(),
            mode: None,
        });
        self
    }

    /// Like [with_file](Composition::with_file), additionally applying the
    /// unix permission bits `mode`.
    pub fn with_file_mode<T: ToString>(
        mut self,
        contents: impl Into<Vec<u8>>,
        destination: T,
        mode: u32,
    ) -> Composition {
        self.files.push(CopiedFile {
            contents: contents.into(),
            destination: destination.to_string(),
            mode: Some(mode),
        });
        self
    }

    /// Attach a label to the container.
    pub fn with_label<T: ToString, S: ToString>(mut self, name: T, value: S) -> Composition {
        self.labels.insert(name.to_string(), value.to_string());
        self
    }

    /// Attach the container to the named network as its primary network.
    pub fn with_network<T: ToString>(self, network: T) -> Composition {
        Composition {
            network: Some(network.to_string()),
            ..self
        }
    }

    /// Select a backend previously registered under `name`.
    pub fn with_backend<T: ToString>(self, name: T) -> Composition {
        Composition {
            backend: BackendSelector::Named(name.to_string()),
            ..self
        }
    }

    /// Run the container through the provided backend instance, bypassing
    /// the registry.
    pub fn with_backend_instance(self, backend: Arc<dyn Backend>) -> Composition {
        Composition {
            backend: BackendSelector::Instance(backend),
            ..self
        }
    }

    /// Select the runtime binary (`docker`, `podman` or `nerdctl`) used by
    /// the default CLI backend, instead of probing `PATH`.
    pub fn with_runtime<T: ToString>(self, runtime: T) -> Composition {
        Composition {
            runtime: Some(runtime.to_string()),
            ..self
        }
    }

    /// Consider the container ready once `needle` appears in its logs.
    pub fn with_wait_for_log<T: ToString>(self, needle: T, timeout: Duration) -> Composition {
        Composition {
            wait: WaitStrategy::LogLine {
                needle: needle.to_string(),
                timeout,
            },
            ..self
        }
    }

    /// Consider the container ready once the runtime reports it healthy.
    pub fn with_healthy_wait(self, timeout: Duration) -> Composition {
        Composition {
            wait: WaitStrategy::Healthy { timeout },
            ..self
        }
    }

    /// Consider the container ready once `argv` exits 0 inside it.
    pub fn with_exec_wait<T: ToString>(
        self,
        argv: impl IntoIterator<Item = T>,
        timeout: Duration,
    ) -> Composition {
        Composition {
            wait: WaitStrategy::ExecProbe {
                argv: argv.into_iter().map(|a| a.to_string()).collect(),
                timeout,
            },
            ..self
        }
    }

    /// Upper bound on the whole create-to-ready sequence. Defaults to 60s.
    pub fn with_startup_timeout(self, timeout: Duration) -> Composition {
        Composition {
            startup_timeout: timeout,
            ..self
        }
    }

    /// Attach a DSN provider consumed by
    /// [Container::dsn](crate::Container::dsn).
    pub fn with_dsn_provider(self, provider: Arc<dyn DsnProvider>) -> Composition {
        Composition {
            dsn: Some(provider),
            ..self
        }
    }

    /// Start the container and block until its wait strategy is satisfied.
    ///
    /// # Panics
    /// Panics on any failure, failing the owning test. This is the only
    /// panicking entry point of the library; use
    /// [try_start](Composition::try_start) to branch on errors instead.
    pub async fn start(self) -> Container {
        let image = self.image.clone();
        match self.try_start().await {
            Ok(container) => container,
            Err(e) => panic!("failed to start container from image `{}`: {}", image, e),
        }
    }

    /// Fallible variant of [start](Composition::start).
    pub async fn try_start(mut self) -> Result<Container> {
        self.validate_and_normalize()?;

        let backend = self.resolve_backend().await?;
        let image = self.image.clone();
        let startup_timeout = self.startup_timeout;

        // The created id is written here before the readiness wait, so the
        // container can still be torn down when the overall deadline drops
        // the in-flight future below.
        let mut created_id: Option<String> = None;
        let starting = async {
            let id = backend.create_container(&image, &self).await?;
            created_id = Some(id.clone());
            event!(Level::DEBUG, %id, image = %image, "container created");

            if let Err(e) = self.wait.await_ready(backend.as_ref(), &id).await {
                // The container exists but never became ready; tear it
                // down before surfacing the readiness failure.
                let _ = backend.remove_container(&id).await;
                return Err(e);
            }
            Ok(id)
        };

        let outcome = tokio::time::timeout(startup_timeout, starting).await;
        let id = match outcome {
            Ok(result) => result?,
            Err(_) => {
                if let Some(id) = created_id {
                    let _ = backend.remove_container(&id).await;
                }
                return Err(TestctrError::Deadline(format!(
                    "container from image `{}` did not become ready within {:?}",
                    image, startup_timeout
                )));
            }
        };

        event!(Level::DEBUG, %id, image = %image, "container ready");
        Ok(Container::new(id, backend, self.dsn.clone()))
    }

    /// Check the caller supplied configuration and normalize the exposed
    /// ports to their `"port/proto"` form, dropping duplicates.
    pub(crate) fn validate_and_normalize(&mut self) -> Result<()> {
        if self.image.is_empty() {
            return Err(TestctrError::InvalidConfig(
                "image reference is empty".to_string(),
            ));
        }

        let mut normalized: Vec<String> = Vec::with_capacity(self.ports.len());
        for port in &self.ports {
            let key = normalize_port_key(port)?;
            if !normalized.contains(&key) {
                normalized.push(key);
            }
        }
        self.ports = normalized;

        for (host_path, container_path) in &self.mounts {
            if !Path::new(host_path).exists() {
                return Err(TestctrError::InvalidConfig(format!(
                    "bind mount source `{}` (for `{}`) does not exist",
                    host_path, container_path
                )));
            }
        }

        self.wait.validate()
    }

    async fn resolve_backend(&self) -> Result<Arc<dyn Backend>> {
        match &self.backend {
            BackendSelector::Instance(backend) => Ok(backend.clone()),
            BackendSelector::Named(name) => default_registry().get(name),
            BackendSelector::Default => match &self.runtime {
                Some(runtime) => {
                    let backend = cli::CliBackend::with_runtime(runtime).await?;
                    Ok(Arc::new(backend) as Arc<dyn Backend>)
                }
                None => cli::default_cli_backend().await,
            },
        }
    }

    // Read accessors used by backends to apply the configuration.

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn command(&self) -> &[String] {
        &self.cmd
    }

    /// Exposed ports; normalized to `"port/proto"` once the composition
    /// has been validated.
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    pub fn bind_mounts(&self) -> &[(String, String)] {
        &self.mounts
    }

    pub fn files(&self) -> &[CopiedFile] {
        &self.files
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    pub fn wait_strategy(&self) -> &WaitStrategy {
        &self.wait
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }
}
