//! The subset of the `docker inspect` JSON document the CLI backend
//! consumes. Podman and nerdctl emit compatible shapes for these fields;
//! known divergences (`null` port maps, missing health blocks) are
//! tolerated.

use crate::backend::{ContainerInfo, ContainerState, ContainerStatus, HostBinding};
use crate::error::{Result, TestctrError};

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub(crate) struct InspectEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Created", default)]
    pub created: String,
    #[serde(rename = "State", default)]
    pub state: InspectState,
    #[serde(rename = "Config", default)]
    pub config: InspectConfig,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InspectState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
    #[serde(rename = "Health")]
    pub health: Option<InspectHealth>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InspectHealth {
    #[serde(rename = "Status", default)]
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InspectConfig {
    #[serde(rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InspectNetworkSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    /// `null` means "no port bound yet" and is treated as empty.
    #[serde(rename = "Ports")]
    pub ports: Option<HashMap<String, Option<Vec<RawBinding>>>>,
    #[serde(rename = "Networks")]
    pub networks: Option<HashMap<String, InspectNetwork>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// Parse the output of `inspect <id>`: a JSON array holding one object.
pub(crate) fn parse_inspect(raw: &str, id: &str) -> Result<InspectEntry> {
    let mut entries: Vec<InspectEntry> = serde_json::from_str(raw).map_err(|e| {
        TestctrError::Runtime(format!("malformed inspect output for {}: {}", id, e))
    })?;
    match entries.pop() {
        Some(entry) if entries.is_empty() => Ok(entry),
        Some(_) => Err(TestctrError::Runtime(format!(
            "inspect for {} returned more than one container",
            id
        ))),
        None => Err(TestctrError::NotFound(format!("container {}", id))),
    }
}

impl InspectEntry {
    /// Flatten the inspect document into the backend return shape.
    ///
    /// The primary address prefers `Networks[primary].IPAddress`, falling
    /// back to any attached network and then the top-level `IPAddress`.
    pub(crate) fn into_container_info(self, primary_network: Option<&str>) -> ContainerInfo {
        let ip_address = self.primary_ip(primary_network);

        let mut ports: HashMap<String, Vec<HostBinding>> = HashMap::new();
        for (key, bindings) in self.network_settings.ports.unwrap_or_default() {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| HostBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            ports.insert(key, bindings);
        }

        ContainerInfo {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            created: self.created,
            state: ContainerState {
                status: ContainerStatus::parse(&self.state.status),
                running: self.state.running,
                exit_code: self.state.exit_code,
                health: self.state.health.map(|h| h.status),
            },
            ip_address,
            labels: self.config.labels.unwrap_or_default(),
            ports,
        }
    }

    fn primary_ip(&self, primary_network: Option<&str>) -> String {
        if let Some(networks) = &self.network_settings.networks {
            if let Some(name) = primary_network {
                if let Some(network) = networks.get(name) {
                    if !network.ip_address.is_empty() {
                        return network.ip_address.clone();
                    }
                }
            }
            if let Some(network) = networks.values().find(|n| !n.ip_address.is_empty()) {
                return network.ip_address.clone();
            }
        }
        self.network_settings.ip_address.clone()
    }
}
