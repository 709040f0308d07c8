//! Native Docker-API backend, talking to the daemon over its unix socket
//! or the address in `DOCKER_HOST`.
//!
//! Functionally equivalent to the CLI backend, minus subprocesses. Not
//! selected by default; register it to opt in:
//!
//! ```no_run
//! # use std::sync::Arc;
//! testctr::register("docker-api", Arc::new(testctr::DockerBackend::new().unwrap()));
//! ```

use crate::backend::{
    Backend, ContainerInfo, ContainerState, ContainerStatus, ExecOutput, HostBinding,
};
use crate::composition::Composition;
use crate::error::{ErrorKind, Result, TestctrError};
use crate::utils;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CommitContainerOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding, PortMap};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{event, Level};

const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(15);
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

const LOG_TAIL_LINES: usize = 10;

#[derive(Debug)]
struct ContainerMeta {
    name: String,
    network: Option<String>,
}

/// Backend driving the runtime daemon through its HTTP API.
#[derive(Debug)]
pub struct DockerBackend {
    client: Docker,
    meta: Mutex<HashMap<String, ContainerMeta>>,
}

impl DockerBackend {
    /// Connect to the daemon: the address in `DOCKER_HOST` when it points
    /// at a TCP endpoint, the local socket otherwise.
    pub fn new() -> Result<DockerBackend> {
        let client = match std::env::var("DOCKER_HOST") {
            Ok(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)
            }
            _ => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| {
            TestctrError::Runtime(format!("failed to connect to container daemon: {}", e))
        })?;

        Ok(DockerBackend {
            client,
            meta: Mutex::new(HashMap::new()),
        })
    }

    async fn create_with_name(
        &self,
        name: &str,
        image: &str,
        config: &Composition,
    ) -> Result<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: PortMap = HashMap::new();
        for port in config.ports() {
            exposed_ports.insert(port.clone(), HashMap::new());
            // An empty host port asks the daemon to assign one.
            port_bindings.insert(
                port.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let binds: Vec<String> = config
            .bind_mounts()
            .iter()
            .map(|(host_path, container_path)| format!("{}:{}", host_path, container_path))
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: config.network().map(str::to_string),
            ..Default::default()
        };

        let env: Vec<String> = config
            .env()
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let body = Config::<String> {
            image: Some(image.to_string()),
            cmd: if config.command().is_empty() {
                None
            } else {
                Some(config.command().to_vec())
            },
            env: Some(env),
            labels: Some(config.labels().clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let created = tokio::time::timeout(
            CREATE_TIMEOUT,
            self.client.create_container(Some(options), body),
        )
        .await
        .map_err(|_| deadline("creating container", CREATE_TIMEOUT))?
        .map_err(|e| map_daemon_error(&format!("creating container from `{}`", image), e))?;

        Ok(created.id)
    }

    /// Ship configured files into the created container as one tar upload.
    async fn copy_files(&self, id: &str, config: &Composition) -> Result<()> {
        if config.files().is_empty() {
            return Ok(());
        }

        let mut builder = tar::Builder::new(Vec::new());
        for file in config.files() {
            let mut header = tar::Header::new_gnu();
            header.set_size(file.contents.len() as u64);
            header.set_mode(file.mode.unwrap_or(0o644));
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    file.destination.trim_start_matches('/'),
                    file.contents.as_slice(),
                )
                .map_err(|e| {
                    TestctrError::Runtime(format!(
                        "failed to archive `{}` for copy-in: {}",
                        file.destination, e
                    ))
                })?;
        }
        let archive = builder
            .into_inner()
            .map_err(|e| TestctrError::Runtime(format!("failed to finish copy-in archive: {}", e)))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(id, Some(options), archive.into())
            .await
            .map_err(|e| map_daemon_error(&format!("copying files into {}", id), e))
    }

    fn network_of(&self, id: &str) -> Option<String> {
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .and_then(|meta| meta.network.clone())
    }

    fn into_container_info(&self, id: &str, details: ContainerInspectResponse) -> ContainerInfo {
        let state = details
            .state
            .map(|state| ContainerState {
                status: state
                    .status
                    .map(|status| ContainerStatus::parse(&status.to_string()))
                    .unwrap_or_default(),
                running: state.running.unwrap_or(false),
                exit_code: state.exit_code.unwrap_or(0),
                health: state
                    .health
                    .and_then(|health| health.status)
                    .map(|status| status.to_string())
                    .filter(|status| status != "none" && !status.is_empty()),
            })
            .unwrap_or_default();

        let mut ip_address = String::new();
        let mut ports: HashMap<String, Vec<HostBinding>> = HashMap::new();
        if let Some(settings) = details.network_settings {
            if let Some(networks) = &settings.networks {
                let primary = self.network_of(id);
                let chosen = primary
                    .as_deref()
                    .and_then(|name| networks.get(name))
                    .or_else(|| {
                        networks
                            .values()
                            .find(|n| n.ip_address.as_deref().is_some_and(|ip| !ip.is_empty()))
                    });
                if let Some(endpoint) = chosen {
                    ip_address = endpoint.ip_address.clone().unwrap_or_default();
                }
            }
            if ip_address.is_empty() {
                ip_address = settings.ip_address.unwrap_or_default();
            }
            for (key, bindings) in settings.ports.unwrap_or_default() {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| HostBinding {
                        host_ip: b.host_ip.unwrap_or_default(),
                        host_port: b.host_port.unwrap_or_default(),
                    })
                    .collect();
                ports.insert(key, bindings);
            }
        }

        ContainerInfo {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name: details
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            created: details.created.unwrap_or_default(),
            state,
            ip_address,
            labels: details
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
            ports,
        }
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn create_container(&self, image: &str, config: &Composition) -> Result<String> {
        let mut name = utils::unique_container_name(image);
        let id = match self.create_with_name(&name, image, config).await {
            Ok(id) => id,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                event!(Level::DEBUG, %name, "container name in use, retrying");
                name = utils::unique_container_name(image);
                self.create_with_name(&name, image, config).await?
            }
            Err(e) => return Err(e),
        };

        self.meta.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            ContainerMeta {
                name,
                network: config.network().map(str::to_string),
            },
        );

        // Files land between create and start, so the entrypoint observes
        // them from its first instruction.
        if let Err(e) = self.copy_files(&id, config).await {
            let _ = self.remove_container(&id).await;
            return Err(e);
        }
        if let Err(e) = self.start_container(&id).await {
            let _ = self.remove_container(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let started = tokio::time::timeout(
            START_TIMEOUT,
            self.client
                .start_container(id, None::<StartContainerOptions<String>>),
        )
        .await
        .map_err(|_| deadline("starting container", START_TIMEOUT))?;

        match started {
            Ok(()) => Ok(()),
            // 304: already started.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_daemon_error(&format!("starting container {}", id), e)),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let stopped = tokio::time::timeout(
            STOP_TIMEOUT,
            self.client
                .stop_container(id, Some(StopContainerOptions { t: 10 })),
        )
        .await
        .map_err(|_| deadline("stopping container", STOP_TIMEOUT))?;

        match stopped {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_daemon_error(&format!("stopping container {}", id), e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        let removed = tokio::time::timeout(
            STOP_TIMEOUT,
            self.client.remove_container(id, Some(options)),
        )
        .await
        .map_err(|_| deadline("removing container", STOP_TIMEOUT))?;

        if let Some(meta) = self.meta.lock().unwrap_or_else(|e| e.into_inner()).remove(id) {
            event!(Level::TRACE, id, name = %meta.name, "forgetting container");
        }
        removed.map_err(|e| map_daemon_error(&format!("removing container {}", id), e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let details = tokio::time::timeout(
            INSPECT_TIMEOUT,
            self.client
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| deadline("inspecting container", INSPECT_TIMEOUT))?
        .map_err(|e| map_daemon_error(&format!("inspecting container {}", id), e))?;

        Ok(self.into_container_info(id, details))
    }

    async fn exec_in_container(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let running = async {
            let exec = self
                .client
                .create_exec(
                    id,
                    CreateExecOptions::<String> {
                        cmd: Some(argv.to_vec()),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| map_daemon_error(&format!("exec in container {}", id), e))?;

            let mut combined = String::new();
            match self
                .client
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| map_daemon_error(&format!("exec in container {}", id), e))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        let chunk = chunk.map_err(|e| {
                            map_daemon_error(&format!("reading exec output in {}", id), e)
                        })?;
                        combined.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
                    }
                }
                StartExecResults::Detached => {}
            }

            let inspected = self
                .client
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| map_daemon_error(&format!("inspecting exec in {}", id), e))?;

            Ok(ExecOutput {
                exit_code: inspected.exit_code.unwrap_or(-1),
                output: combined,
            })
        };

        tokio::time::timeout(EXEC_TIMEOUT, running)
            .await
            .map_err(|_| deadline("exec in container", EXEC_TIMEOUT))?
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut combined = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| map_daemon_error(&format!("reading logs of {}", id), e))?;
            combined.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(combined)
    }

    async fn wait_for_log(&self, id: &str, needle: &str, timeout: Duration) -> Result<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL_LINES);
        let mut pending = String::new();

        let scan = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk
                    .map_err(|e| map_daemon_error(&format!("following logs of {}", id), e))?;
                pending.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));

                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    let line = line.trim_end_matches('\n').to_string();
                    if tail.len() == LOG_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    if line.contains(needle) {
                        return Ok(true);
                    }
                }
            }
            // The stream closed; a trailing line without a newline still
            // counts.
            Ok(pending.contains(needle))
        };

        let matched = tokio::time::timeout(timeout, scan).await;
        match matched {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TestctrError::Runtime(format!(
                "log stream of {} ended before `{}` appeared; last lines:\n{}",
                id,
                needle,
                tail.iter().cloned().collect::<Vec<_>>().join("\n")
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TestctrError::Deadline(format!(
                "`{}` did not appear in logs of {} within {:?}; last lines:\n{}",
                needle,
                id,
                timeout,
                tail.iter().cloned().collect::<Vec<_>>().join("\n")
            ))),
        }
    }

    async fn internal_ip(&self, id: &str) -> Result<String> {
        let info = self.inspect_container(id).await?;
        if info.ip_address.is_empty() {
            return Err(TestctrError::NotReady(format!(
                "container {} has no address on its primary network",
                id
            )));
        }
        Ok(info.ip_address)
    }

    async fn commit_container(&self, id: &str, image: &str) -> Result<()> {
        // `repo:tag`, tolerating registries with a port in the repo part.
        let (repo, tag) = match image.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (image, "latest"),
        };

        let options = CommitContainerOptions::<String> {
            container: id.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        tokio::time::timeout(
            CREATE_TIMEOUT,
            self.client.commit_container(options, Config::<String>::default()),
        )
        .await
        .map_err(|_| deadline("committing container", CREATE_TIMEOUT))?
        .map_err(|e| map_daemon_error(&format!("committing container {} to `{}`", id, image), e))
        .map(|_| ())
    }
}

fn deadline(context: &str, limit: Duration) -> TestctrError {
    TestctrError::Deadline(format!("{} exceeded {:?}", context, limit))
}

/// Translate a daemon response into the library's error taxonomy.
fn map_daemon_error(context: &str, e: bollard::errors::Error) -> TestctrError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => TestctrError::NotFound(format!("{}: {}", context, message)),
            409 => TestctrError::AlreadyExists(format!("{}: {}", context, message)),
            _ => TestctrError::Runtime(format!(
                "{} (daemon status {}): {}",
                context, status_code, message
            )),
        },
        other => TestctrError::Runtime(format!("{}: {}", context, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_404_maps_to_not_found() {
        let e = map_daemon_error(
            "inspecting container x",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container: x".to_string(),
            },
        );
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn daemon_409_maps_to_already_exists() {
        let e = map_daemon_error(
            "creating container",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message: "Conflict. The container name \"/x\" is already in use".to_string(),
            },
        );
        assert_eq!(e.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn daemon_500_maps_to_runtime_with_message() {
        let e = map_daemon_error(
            "creating container",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "disk full".to_string(),
            },
        );
        assert_eq!(e.kind(), ErrorKind::Runtime);
        assert!(e.to_string().contains("disk full"));
    }
}
