//! The node-initialized measurement. Once written it is never changed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use constel_core::Error;
use constel_core::fs::FileSystem;
use constel_core::instance::bytes_b64;
use serde::{Deserialize, Serialize};
use tracing::info;

pub trait Tpm: Send + Sync {
    fn is_node_initialized(&self) -> Result<bool>;
    /// Record the activation identity. Repeating the call with the same IDs is a no-op;
    /// different IDs violate the write-once measurement.
    fn mark_node_initialized(&self, owner_id: &[u8], cluster_id: &[u8]) -> Result<()>;
}

/// Opens the TPM for a single operation.
pub type OpenTpm = Arc<dyn Fn() -> Result<Box<dyn Tpm>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Measurement {
    #[serde(rename = "OwnerID", with = "bytes_b64")]
    owner_id: Vec<u8>,
    #[serde(rename = "ClusterID", with = "bytes_b64")]
    cluster_id: Vec<u8>,
}

fn check_same(existing: &Measurement, owner_id: &[u8], cluster_id: &[u8]) -> Result<()> {
    if existing.owner_id == owner_id && existing.cluster_id == cluster_id {
        return Ok(());
    }
    Err(Error::StateInvariant(
        "node is already marked initialized with different IDs".to_string(),
    )
    .into())
}

/// Measurement kept in a file on a filesystem that does not survive re-provisioning.
pub struct FileTpm {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl FileTpm {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    /// An [`OpenTpm`] handing out file TPMs at `path`.
    pub fn opener(fs: Arc<dyn FileSystem>, path: &Path) -> OpenTpm {
        let path = path.to_path_buf();
        Arc::new(move || -> Result<Box<dyn Tpm>> {
            Ok(Box::new(FileTpm::new(Arc::clone(&fs), path.clone())))
        })
    }

    fn read(&self) -> Result<Measurement> {
        let raw = self
            .fs
            .read(&self.path)
            .with_context(|| format!("Failed to read measurement {}", self.path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse measurement {}", self.path.display()))
    }
}

impl Tpm for FileTpm {
    fn is_node_initialized(&self) -> Result<bool> {
        Ok(self.fs.exists(&self.path))
    }

    fn mark_node_initialized(&self, owner_id: &[u8], cluster_id: &[u8]) -> Result<()> {
        if self.fs.exists(&self.path) {
            return check_same(&self.read()?, owner_id, cluster_id);
        }
        let measurement = Measurement {
            owner_id: owner_id.to_vec(),
            cluster_id: cluster_id.to_vec(),
        };
        let raw = serde_json::to_vec(&measurement).context("Failed to encode measurement")?;
        if let Some(parent) = self.path.parent() {
            self.fs
                .create_dir_all(parent, 0o755)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        self.fs
            .create_new(&self.path, &raw, 0o600)
            .with_context(|| format!("Failed to write measurement {}", self.path.display()))?;
        info!(path = %self.path.display(), "Marked node as initialized");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakeTpmState {
    measurement: Option<Measurement>,
    mark_calls: usize,
}

/// In-memory TPM. Clones share the measurement.
#[derive(Debug, Clone, Default)]
pub struct FakeTpm {
    state: Arc<Mutex<FakeTpmState>>,
    fail_mark: bool,
}

impl FakeTpm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialized(owner_id: &[u8], cluster_id: &[u8]) -> Self {
        let tpm = Self::default();
        if let Ok(mut state) = tpm.state.lock() {
            state.measurement = Some(Measurement {
                owner_id: owner_id.to_vec(),
                cluster_id: cluster_id.to_vec(),
            });
        }
        tpm
    }

    /// Make `mark_node_initialized` fail.
    pub fn failing(mut self) -> Self {
        self.fail_mark = true;
        self
    }

    pub fn mark_calls(&self) -> usize {
        self.state.lock().map(|s| s.mark_calls).unwrap_or_default()
    }

    pub fn opener(&self) -> OpenTpm {
        let tpm = self.clone();
        Arc::new(move || -> Result<Box<dyn Tpm>> { Ok(Box::new(tpm.clone())) })
    }
}

impl Tpm for FakeTpm {
    fn is_node_initialized(&self) -> Result<bool> {
        let state = self.state.lock().map_err(|_| anyhow!("TPM lock poisoned"))?;
        Ok(state.measurement.is_some())
    }

    fn mark_node_initialized(&self, owner_id: &[u8], cluster_id: &[u8]) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("TPM lock poisoned"))?;
        state.mark_calls += 1;
        if self.fail_mark {
            return Err(Error::TransientRemote("TPM unavailable".to_string()).into());
        }
        if let Some(existing) = &state.measurement {
            return check_same(existing, owner_id, cluster_id);
        }
        state.measurement = Some(Measurement {
            owner_id: owner_id.to_vec(),
            cluster_id: cluster_id.to_vec(),
        });
        Ok(())
    }
}
