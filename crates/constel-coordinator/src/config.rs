use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use constel_cloud::{MetadataEndpoints, ProviderKind};
use constel_core::constants::{
    ACTIVATION_PORT, COORDINATOR_PORT, MEASUREMENT_PATH, NODE_STATE_PATH, WIREGUARD_PORT,
};
use serde::Deserialize;

use crate::activationapi::ServiceSettings;

/// Coordinator daemon configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tpm: TpmConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub cloud_provider: ProviderKind,
    #[serde(default = "default_node_state_path")]
    pub node_state_path: PathBuf,
    #[serde(default = "default_vpn_interface")]
    pub vpn_interface: String,
    #[serde(default = "default_vpn_port")]
    pub vpn_port: u16,
    /// Port of the VPN-API on coordinators.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Port of the activation API a fresh node serves.
    #[serde(default = "default_activation_port")]
    pub activation_port: u16,
    #[serde(default = "default_activation_listen_ip")]
    pub activation_listen_ip: String,
    #[serde(default = "default_peer_refresh_interval")]
    pub peer_refresh_interval_secs: u64,
    #[serde(default = "default_retrieve_peers_backoff")]
    pub retrieve_peers_backoff_secs: u64,
    #[serde(default = "default_cloud_timeout")]
    pub cloud_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Empty keeps the coordinator on its in-memory store.
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,
    #[serde(default = "default_etcd_dial_timeout")]
    pub etcd_dial_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TpmConfig {
    #[serde(default = "default_measurement_path")]
    pub measurement_path: PathBuf,
}

/// Base-URL overrides for the metadata clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataConfig {
    pub azure_imds_url: Option<String>,
    pub azure_arm_url: Option<String>,
    pub gcp_metadata_url: Option<String>,
    pub gcp_compute_url: Option<String>,
    pub qemu_metadata_url: Option<String>,
}

fn default_node_state_path() -> PathBuf {
    PathBuf::from(NODE_STATE_PATH)
}
fn default_vpn_interface() -> String {
    "wg0".to_string()
}
fn default_vpn_port() -> u16 {
    WIREGUARD_PORT
}
fn default_api_port() -> u16 {
    COORDINATOR_PORT
}
fn default_activation_port() -> u16 {
    ACTIVATION_PORT
}
fn default_activation_listen_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_peer_refresh_interval() -> u64 {
    10
}
fn default_retrieve_peers_backoff() -> u64 {
    60
}
fn default_cloud_timeout() -> u64 {
    60
}
fn default_etcd_dial_timeout() -> u64 {
    10
}
fn default_measurement_path() -> PathBuf {
    PathBuf::from(MEASUREMENT_PATH)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cloud_provider: ProviderKind::None,
            node_state_path: default_node_state_path(),
            vpn_interface: default_vpn_interface(),
            vpn_port: default_vpn_port(),
            api_port: default_api_port(),
            activation_port: default_activation_port(),
            activation_listen_ip: default_activation_listen_ip(),
            peer_refresh_interval_secs: default_peer_refresh_interval(),
            retrieve_peers_backoff_secs: default_retrieve_peers_backoff(),
            cloud_timeout_secs: default_cloud_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: Vec::new(),
            etcd_dial_timeout_secs: default_etcd_dial_timeout(),
        }
    }
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            measurement_path: default_measurement_path(),
        }
    }
}

impl MetadataConfig {
    pub fn endpoints(&self) -> MetadataEndpoints {
        MetadataEndpoints {
            azure_imds: self.azure_imds_url.clone(),
            azure_arm: self.azure_arm_url.clone(),
            gcp_metadata: self.gcp_metadata_url.clone(),
            gcp_compute: self.gcp_compute_url.clone(),
            qemu: self.qemu_metadata_url.clone(),
        }
    }
}

impl CoordinatorConfig {
    /// Load coordinator config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read coordinator config: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse coordinator config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).with_context(|| "Failed to parse coordinator config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let node = &self.node;
        let ports = [
            ("api_port", node.api_port),
            ("vpn_port", node.vpn_port),
            ("activation_port", node.activation_port),
        ];
        for (i, (name, port)) in ports.iter().enumerate() {
            if let Some((other, _)) = ports[i + 1..].iter().find(|(_, p)| p == port) {
                anyhow::bail!("{} and {} must differ (both are {})", name, other, port);
            }
        }
        if node.activation_listen_ip.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!(
                "activation_listen_ip is not an IP address: {}",
                node.activation_listen_ip
            );
        }
        if node.cloud_timeout_secs == 0 {
            anyhow::bail!("cloud_timeout_secs must be greater than zero");
        }
        if node.peer_refresh_interval_secs == 0 {
            anyhow::bail!("peer_refresh_interval_secs must be greater than zero");
        }
        if node.vpn_interface.is_empty() {
            anyhow::bail!("vpn_interface must not be empty");
        }

        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.store.etcd_endpoints {
            if !seen.insert(endpoint) {
                anyhow::bail!("Duplicate etcd endpoint {} in store config", endpoint);
            }
        }
        if node.cloud_provider == ProviderKind::Qemu && !self.store.etcd_endpoints.is_empty() {
            anyhow::bail!("A persistent etcd store is not supported on qemu");
        }
        Ok(())
    }

    pub fn peer_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.node.peer_refresh_interval_secs)
    }

    pub fn retrieve_peers_backoff(&self) -> Duration {
        Duration::from_secs(self.node.retrieve_peers_backoff_secs)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.node.cloud_timeout_secs)
    }

    pub fn etcd_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.store.etcd_dial_timeout_secs)
    }

    pub fn activation_settings(&self) -> ServiceSettings {
        ServiceSettings {
            activation_port: self.node.activation_port,
            api_port: self.node.api_port,
            peer_refresh_interval: self.peer_refresh_interval(),
        }
    }
}
