//! The default backend: drives a container runtime binary (`docker`,
//! `podman` or `nerdctl`) through argv invocations and parses its
//! structured output.
//!
//! Every operation is a fresh subprocess built as an argv array - nothing
//! is ever interpolated through a shell. The backend keeps no
//! per-container state beyond a small metadata map used for diagnostics
//! and primary-network resolution.

use crate::backend::{Backend, ContainerInfo, ExecOutput};
use crate::composition::Composition;
use crate::error::{ErrorKind, Result, TestctrError};
use crate::inspect;
use crate::utils;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use tracing::{event, Level};

// Per-operation deadlines; the effective deadline of a call is the minimum
// of these and whatever timeout the caller's future is raced against.
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_TIMEOUT: Duration = Duration::from_secs(15);
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGS_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime binaries probed, in order, when none is configured.
const RUNTIME_CANDIDATES: [&str; 3] = ["docker", "podman", "nerdctl"];

/// Trailing log lines kept for wait-for-log failure messages.
const LOG_TAIL_LINES: usize = 10;

static DEFAULT_CLI: OnceCell<Arc<CliBackend>> = OnceCell::const_new();

/// The lazily constructed process-wide CLI backend, used by every
/// composition that does not select a backend explicitly.
pub(crate) async fn default_cli_backend() -> Result<Arc<dyn Backend>> {
    let backend = DEFAULT_CLI
        .get_or_try_init(|| async { CliBackend::new().await.map(Arc::new) })
        .await?;
    Ok(backend.clone() as Arc<dyn Backend>)
}

/// Logical metadata per created container, for diagnostics and
/// primary-network lookup only.
#[derive(Debug)]
struct ContainerMeta {
    name: String,
    network: Option<String>,
}

/// Captured result of one runtime invocation.
struct CmdOutput {
    code: i64,
    stdout: String,
    stderr: String,
}

/// Subprocess-driven backend wrapping the `docker` CLI family.
#[derive(Debug)]
pub struct CliBackend {
    binary: String,
    version: String,
    meta: Mutex<HashMap<String, ContainerMeta>>,
}

impl CliBackend {
    /// Probe `PATH` for a usable runtime and record its client version.
    ///
    /// `TESTCTR_RUNTIME` overrides the probe; otherwise `docker`, `podman`
    /// and `nerdctl` are tried in that order.
    pub async fn new() -> Result<CliBackend> {
        if let Ok(runtime) = std::env::var("TESTCTR_RUNTIME") {
            if !runtime.is_empty() {
                return Self::with_runtime(&runtime).await;
            }
        }

        for candidate in RUNTIME_CANDIDATES {
            match Self::with_runtime(candidate).await {
                Ok(backend) => return Ok(backend),
                Err(e) => {
                    event!(Level::TRACE, candidate, error = %e, "runtime probe failed");
                }
            }
        }

        Err(TestctrError::Runtime(format!(
            "no container runtime found on PATH (tried {})",
            RUNTIME_CANDIDATES.join(", ")
        )))
    }

    /// Use the given runtime binary, verifying it answers a version query.
    pub async fn with_runtime(binary: &str) -> Result<CliBackend> {
        let version = query_client_version(binary).await?;
        event!(Level::DEBUG, binary, %version, "selected container runtime");
        Ok(CliBackend {
            binary: binary.to_string(),
            version,
            meta: Mutex::new(HashMap::new()),
        })
    }

    /// The runtime binary this backend invokes.
    pub fn runtime(&self) -> &str {
        &self.binary
    }

    /// The runtime's reported client version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Run the binary with `args`, capturing output. The subprocess is
    /// killed when `deadline` elapses or the calling future is dropped.
    async fn run<I, S>(&self, args: I, deadline: Duration) -> Result<CmdOutput>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.to_string()).collect();
        event!(Level::TRACE, binary = %self.binary, ?args, "invoking runtime");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(deadline, output)
            .await
            .map_err(|_| {
                TestctrError::Deadline(format!(
                    "`{} {}` exceeded {:?}",
                    self.binary,
                    args.join(" "),
                    deadline
                ))
            })?
            .map_err(|e| {
                TestctrError::Runtime(format!("failed to spawn `{}`: {}", self.binary, e))
            })?;

        Ok(CmdOutput {
            code: i64::from(output.status.code().unwrap_or(-1)),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn create_with_name(
        &self,
        name: &str,
        image: &str,
        config: &Composition,
    ) -> Result<String> {
        let args = build_run_args(name, image, config);
        let out = self.run(args, CREATE_TIMEOUT).await?;
        if out.code != 0 {
            return Err(map_cli_failure(
                &self.binary,
                &format!("creating container from `{}`", image),
                out.code,
                &out.stderr,
            ));
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Stage each configured file through a tempfile and `cp` it into the
    /// container, applying permission bits with an in-container `chmod`.
    async fn copy_files(&self, id: &str, config: &Composition) -> Result<()> {
        for file in config.files() {
            let staged = tempfile::NamedTempFile::new().map_err(|e| {
                TestctrError::Runtime(format!("failed to stage file for copy-in: {}", e))
            })?;
            tokio::fs::write(staged.path(), &file.contents)
                .await
                .map_err(|e| {
                    TestctrError::Runtime(format!("failed to stage file for copy-in: {}", e))
                })?;

            let target = format!("{}:{}", id, file.destination);
            let out = self
                .run(
                    [
                        "cp".to_string(),
                        staged.path().display().to_string(),
                        target.clone(),
                    ],
                    EXEC_TIMEOUT,
                )
                .await?;
            if out.code != 0 {
                return Err(map_cli_failure(
                    &self.binary,
                    &format!("copying file to `{}`", target),
                    out.code,
                    &out.stderr,
                ));
            }

            if let Some(mode) = file.mode {
                let out = self
                    .run(
                        [
                            "exec".to_string(),
                            id.to_string(),
                            "chmod".to_string(),
                            format!("{:o}", mode),
                            file.destination.clone(),
                        ],
                        EXEC_TIMEOUT,
                    )
                    .await?;
                if out.code != 0 {
                    return Err(TestctrError::Runtime(format!(
                        "chmod {:o} {} in container {} failed: {}",
                        mode,
                        file.destination,
                        id,
                        out.stderr.trim()
                    )));
                }
            }
        }
        Ok(())
    }

    fn network_of(&self, id: &str) -> Option<String> {
        self.meta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .and_then(|meta| meta.network.clone())
    }
}

#[async_trait]
impl Backend for CliBackend {
    async fn create_container(&self, image: &str, config: &Composition) -> Result<String> {
        let mut name = utils::unique_container_name(image);
        let id = match self.create_with_name(&name, image, config).await {
            Ok(id) => id,
            // A name collision with a leftover container is vanishingly
            // rare; one retry with a fresh suffix before surfacing.
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

        if let Err(e) = self.copy_files(&id, config).await {
            let _ = self.remove_container(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        // `run -d` already started the container; `start` on a running
        // container is a no-op for the whole docker family.
        let out = self.run(["start", id], START_TIMEOUT).await?;
        if out.code != 0 {
            return Err(map_cli_failure(
                &self.binary,
                &format!("starting container {}", id),
                out.code,
                &out.stderr,
            ));
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let out = self.run(["stop", "-t", "10", id], STOP_TIMEOUT).await?;
        if out.code != 0 {
            return Err(map_cli_failure(
                &self.binary,
                &format!("stopping container {}", id),
                out.code,
                &out.stderr,
            ));
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let out = self.run(["rm", "-f", id], STOP_TIMEOUT).await?;
        if let Some(meta) = self.meta.lock().unwrap_or_else(|e| e.into_inner()).remove(id) {
            event!(Level::TRACE, id, name = %meta.name, "forgetting container");
        }
        // An id the runtime no longer knows is already removed.
        if out.code != 0 && !is_not_found(&out.stderr) {
            return Err(map_cli_failure(
                &self.binary,
                &format!("removing container {}", id),
                out.code,
                &out.stderr,
            ));
        }
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let out = self.run(["inspect", id], INSPECT_TIMEOUT).await?;
        if out.code != 0 {
            return Err(map_cli_failure(
                &self.binary,
                &format!("inspecting container {}", id),
                out.code,
                &out.stderr,
            ));
        }
        let entry = inspect::parse_inspect(&out.stdout, id)?;
        Ok(entry.into_container_info(self.network_of(id).as_deref()))
    }

    async fn exec_in_container(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());

        let out = self.run(args, EXEC_TIMEOUT).await?;
        // A non-zero exit is the command's business unless stderr shows
        // the runtime itself refused the exec.
        if out.code != 0 && is_runtime_refusal(&out.stderr) {
            return Err(map_cli_failure(
                &self.binary,
                &format!("exec in container {}", id),
                out.code,
                &out.stderr,
            ));
        }

        Ok(ExecOutput {
            exit_code: out.code,
            output: format!("{}{}", out.stdout, out.stderr),
        })
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        let out = self.run(["logs", id], LOGS_TIMEOUT).await?;
        if out.code != 0 {
            return Err(map_cli_failure(
                &self.binary,
                &format!("reading logs of container {}", id),
                out.code,
                &out.stderr,
            ));
        }
        Ok(format!("{}{}", out.stdout, out.stderr))
    }

    async fn wait_for_log(&self, id: &str, needle: &str, timeout: Duration) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .args(["logs", "-f", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TestctrError::Runtime(format!(
                    "failed to spawn `{} logs -f {}`: {}",
                    self.binary, id, e
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TestctrError::Runtime("log follower has no stdout pipe".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TestctrError::Runtime("log follower has no stderr pipe".to_string())
        })?;

        // The runtime writes container stdout and stderr to the matching
        // streams of the follower; merge both into one line channel.
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL_LINES)));
        spawn_line_reader(stdout, tx.clone(), tail.clone());
        spawn_line_reader(stderr, tx, tail.clone());

        let scan = async {
            while let Some(line) = rx.recv().await {
                if line.contains(needle) {
                    return true;
                }
            }
            false
        };

        let matched = tokio::time::timeout(timeout, scan).await;
        // Reap the follower so its pipes close regardless of outcome.
        let _ = child.kill().await;

        match matched {
            Ok(true) => Ok(()),
            Ok(false) => Err(TestctrError::Runtime(format!(
                "log stream of {} ended before `{}` appeared; last lines:\n{}",
                id,
                needle,
                format_tail(&tail)
            ))),
            Err(_) => Err(TestctrError::Deadline(format!(
                "`{}` did not appear in logs of {} within {:?}; last lines:\n{}",
                needle,
                id,
                timeout,
                format_tail(&tail)
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
        let out = self.run(["commit", id, image], CREATE_TIMEOUT).await?;
        if out.code != 0 {
            return Err(map_cli_failure(
                &self.binary,
                &format!("committing container {} to `{}`", id, image),
                out.code,
                &out.stderr,
            ));
        }
        Ok(())
    }
}

async fn query_client_version(binary: &str) -> Result<String> {
    let output = Command::new(binary)
        .args(["version", "--format", "{{.Client.Version}}"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(INSPECT_TIMEOUT, output)
        .await
        .map_err(|_| {
            TestctrError::Deadline(format!(
                "`{} version` did not answer within {:?}",
                binary, INSPECT_TIMEOUT
            ))
        })?
        .map_err(|e| TestctrError::Runtime(format!("failed to invoke `{}`: {}", binary, e)))?;

    if !output.status.success() {
        return Err(TestctrError::Runtime(format!(
            "`{} version` failed: {}",
            binary,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Assemble the full `run` argv for a composition. The container port is
/// always published with host port 0, letting the runtime assign one.
fn build_run_args(name: &str, image: &str, config: &Composition) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    for (key, value) in config.env() {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for port in config.ports() {
        args.push("-p".to_string());
        args.push(format!("0:{}", port));
    }
    for (host_path, container_path) in config.bind_mounts() {
        args.push("-v".to_string());
        args.push(format!("{}:{}", host_path, container_path));
    }
    for (key, value) in config.labels() {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(network) = config.network() {
        args.push("--network".to_string());
        args.push(network.to_string());
    }

    args.push(image.to_string());
    args.extend(config.command().iter().cloned());
    args
}

/// Classify a failed runtime invocation by its stderr.
fn map_cli_failure(binary: &str, context: &str, code: i64, stderr: &str) -> TestctrError {
    let stderr = stderr.trim();
    if is_not_found(stderr) {
        TestctrError::NotFound(format!("{}: {}", context, stderr))
    } else if stderr.contains("is already in use") {
        TestctrError::AlreadyExists(format!("{}: {}", context, stderr))
    } else {
        TestctrError::Runtime(format!(
            "{} (`{}` exited {}): {}",
            context, binary, code, stderr
        ))
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no such container") || lowered.contains("no such object")
}

/// Whether a failed `exec` points at the runtime rather than the command.
fn is_runtime_refusal(stderr: &str) -> bool {
    is_not_found(stderr)
        || stderr.contains("is not running")
        || stderr.contains("Error response from daemon")
        || stderr.contains("container state improper")
}

fn spawn_line_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == LOG_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
            }
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

fn format_tail(tail: &Arc<Mutex<VecDeque<String>>>) -> String {
    tail.lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
}
