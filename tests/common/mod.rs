//! In-memory backend and DSN provider shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use testctr::{
    Backend, Composition, Container, ContainerInfo, ContainerState, ContainerStatus, DsnProvider,
    ExecOutput, HostBinding, Result, TestctrError,
};

#[derive(Debug)]
pub struct FakeContainer {
    pub name: String,
    pub image: String,
    pub running: bool,
    pub ports: HashMap<String, Vec<HostBinding>>,
}

/// A backend that keeps containers in memory, for exercising the handle
/// and lifecycle paths without a runtime.
#[derive(Default, Debug)]
pub struct FakeBackend {
    counter: AtomicUsize,
    next_host_port: AtomicU16,
    fail_exec: AtomicBool,
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub removed: Mutex<Vec<String>>,
    pub committed: Mutex<Vec<(String, String)>>,
    logs: Mutex<HashMap<String, String>>,
    pending_logs: Mutex<Option<String>>,
    exec_script: Mutex<HashMap<Vec<String>, ExecOutput>>,
}

impl FakeBackend {
    /// Script the result of one exact exec argv.
    pub fn script_exec(&self, argv: &[&str], exit_code: i64, output: &str) {
        self.exec_script.lock().unwrap().insert(
            argv.iter().map(|a| a.to_string()).collect(),
            ExecOutput {
                exit_code,
                output: output.to_string(),
            },
        );
    }

    /// Make every exec fail as if the backend were unreachable.
    pub fn set_fail_exec(&self, fail: bool) {
        self.fail_exec.store(fail, Ordering::SeqCst);
    }

    /// Log contents given to the next created container.
    pub fn seed_next_logs(&self, text: &str) {
        *self.pending_logs.lock().unwrap() = Some(text.to_string());
    }

    /// Append to a live container's log stream.
    pub fn append_log(&self, id: &str, text: &str) {
        self.logs
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_str(text);
    }

    pub fn was_removed(&self, id: &str) -> bool {
        self.removed.lock().unwrap().iter().any(|r| r == id)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn create_container(&self, image: &str, config: &Composition) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("fakectr{:04}", n);
        let name = format!("fake-{}-{}", image.replace(['/', ':'], "-"), n);

        let mut ports = HashMap::new();
        for port in config.ports() {
            let host_port = 49153 + self.next_host_port.fetch_add(1, Ordering::SeqCst);
            ports.insert(
                port.clone(),
                vec![HostBinding {
                    host_ip: "0.0.0.0".to_string(),
                    host_port: host_port.to_string(),
                }],
            );
        }

        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name,
                image: image.to_string(),
                running: true,
                ports,
            },
        );
        let initial_logs = self.pending_logs.lock().unwrap().take().unwrap_or_default();
        self.logs.lock().unwrap().insert(id.clone(), initial_logs);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(TestctrError::NotFound(format!("container {}", id))),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(TestctrError::NotFound(format!("container {}", id))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(id.to_string());
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(TestctrError::NotFound(format!("container {}", id))),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(id)
            .ok_or_else(|| TestctrError::NotFound(format!("container {}", id)))?;
        Ok(ContainerInfo {
            id: id.to_string(),
            name: container.name.clone(),
            created: "2024-01-01T00:00:00Z".to_string(),
            state: ContainerState {
                status: if container.running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited
                },
                running: container.running,
                exit_code: 0,
                health: None,
            },
            ip_address: "172.17.0.2".to_string(),
            labels: HashMap::new(),
            ports: container.ports.clone(),
        })
    }

    async fn exec_in_container(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(TestctrError::Runtime(format!(
                "backend unreachable while exec-ing in {}",
                id
            )));
        }
        let script = self.exec_script.lock().unwrap();
        Ok(script.get(argv).cloned().unwrap_or_default())
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        Ok(self.logs.lock().unwrap().get(id).cloned().unwrap_or_default())
    }

    async fn wait_for_log(&self, id: &str, needle: &str, timeout: Duration) -> Result<()> {
        let scan = async {
            loop {
                if let Some(text) = self.logs.lock().unwrap().get(id) {
                    if text.contains(needle) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, scan).await.map_err(|_| {
            TestctrError::Deadline(format!(
                "`{}` did not appear in logs of {} within {:?}",
                needle, id, timeout
            ))
        })
    }

    async fn internal_ip(&self, _id: &str) -> Result<String> {
        Ok("172.17.0.2".to_string())
    }

    async fn commit_container(&self, id: &str, image: &str) -> Result<()> {
        self.committed
            .lock()
            .unwrap()
            .push((id.to_string(), image.to_string()));
        Ok(())
    }
}

/// Records database provisioning calls.
#[derive(Default)]
pub struct FakeDsnProvider {
    pub created: Mutex<Vec<String>>,
    pub dropped: Mutex<Vec<String>>,
}

#[async_trait]
impl DsnProvider for FakeDsnProvider {
    async fn create_database(&self, container: &Container, name: &str) -> Result<String> {
        self.created.lock().unwrap().push(name.to_string());
        Ok(format!("postgres://test@{}/{}", container.id(), name))
    }

    async fn drop_database(&self, _container: &Container, name: &str) -> Result<()> {
        self.dropped.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn format_dsn(&self, container: &Container, name: &str) -> Result<String> {
        Ok(format!("postgres://test@{}/{}", container.id(), name))
    }
}
