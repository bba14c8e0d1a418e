use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::NODE_STATE_PATH;
use crate::fs::FileSystem;
use crate::instance::bytes_b64;
use crate::role::Role;

/// Post-activation identity of a node, persisted for recovery after reboot.
///
/// The field set is closed: unknown keys are rejected on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeState {
    #[serde(rename = "Role")]
    pub role: Role,
    #[serde(rename = "VPNIP")]
    pub vpn_ip: String,
    #[serde(rename = "VPNPrivKey", with = "bytes_b64")]
    pub vpn_priv_key: Vec<u8>,
    #[serde(rename = "OwnerID", with = "bytes_b64")]
    pub owner_id: Vec<u8>,
    #[serde(rename = "ClusterID", with = "bytes_b64")]
    pub cluster_id: Vec<u8>,
}

impl NodeState {
    /// Read the node state from its well-known path. A missing file is an error.
    pub fn from_file(fs: &dyn FileSystem) -> Result<Self> {
        Self::from_path(fs, Path::new(NODE_STATE_PATH))
    }

    pub fn from_path(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let raw = fs
            .read(path)
            .with_context(|| format!("Failed to read node state: {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse node state: {}", path.display()))
    }

    /// Write the node state to its well-known path. Fails if it already exists.
    pub fn to_file(&self, fs: &dyn FileSystem) -> Result<()> {
        self.to_path(fs, Path::new(NODE_STATE_PATH))
    }

    pub fn to_path(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec(self).with_context(|| "Failed to serialize node state")?;
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent, 0o755)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs.create_new(path, &raw, 0o600)
            .with_context(|| format!("Failed to write node state: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemFs, OsFs};

    fn sample() -> NodeState {
        NodeState {
            role: Role::Coordinator,
            vpn_ip: "10.118.0.1".to_string(),
            vpn_priv_key: vec![1; 32],
            owner_id: vec![2; 32],
            cluster_id: vec![3; 32],
        }
    }

    #[test]
    fn test_write_then_read() {
        let fs = MemFs::new();
        sample().to_file(&fs).unwrap();
        let read = NodeState::from_file(&fs).unwrap();
        assert_eq!(read, sample());
        let meta = fs.metadata(Path::new(NODE_STATE_PATH)).unwrap();
        assert_eq!(meta.mode, 0o600);
    }

    #[test]
    fn test_write_once() {
        let fs = MemFs::new();
        sample().to_file(&fs).unwrap();
        let before = fs.contents(NODE_STATE_PATH).unwrap();

        let mut other = sample();
        other.role = Role::Node;
        assert!(other.to_file(&fs).is_err());
        assert_eq!(fs.contents(NODE_STATE_PATH).unwrap(), before);
    }

    #[test]
    fn test_read_missing_is_error() {
        let fs = MemFs::new();
        let err = NodeState::from_file(&fs).unwrap_err();
        assert!(format!("{}", err).contains("Failed to read node state"));
    }

    #[test]
    fn test_json_format() {
        let json = r#"{"Role":"node","VPNIP":"10.118.0.5","VPNPrivKey":"AQI=","OwnerID":"Aw==","ClusterID":"BA=="}"#;
        let fs = MemFs::new().with_file(NODE_STATE_PATH, json, 0o600, 0, 0);
        let state = NodeState::from_file(&fs).unwrap();
        assert_eq!(state.role, Role::Node);
        assert_eq!(state.vpn_ip, "10.118.0.5");
        assert_eq!(state.vpn_priv_key, vec![1, 2]);

        let written = serde_json::to_value(&state).unwrap();
        assert_eq!(written["Role"], "Node");
        assert_eq!(written["OwnerID"], "Aw==");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let json = r#"{"Role":"Node","VPNIP":"","VPNPrivKey":"","OwnerID":"","ClusterID":"","Extra":1}"#;
        let fs = MemFs::new().with_file(NODE_STATE_PATH, json, 0o600, 0, 0);
        assert!(NodeState::from_file(&fs).is_err());
    }

    #[test]
    fn test_os_fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::with_root(dir.path());
        sample().to_file(&fs).unwrap();
        assert!(sample().to_file(&fs).is_err());
        assert_eq!(NodeState::from_file(&fs).unwrap(), sample());
    }
}
