//! Cloud-controller-manager support per provider, and the GCP cloud config it reads.

use std::path::Path;

use anyhow::{Context, Result};
use constel_core::fs::FileSystem;
use tracing::info;

use crate::provider::ProviderKind;

pub const GCE_CONF_PATH: &str = "/etc/gce.conf";

/// Whether a cloud-controller-manager runs on a provider, and under which name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcmSupport {
    pub name: &'static str,
    pub supported: bool,
}

impl CcmSupport {
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Azure => Self {
                name: "azure",
                supported: true,
            },
            ProviderKind::Gcp => Self {
                name: "gce",
                supported: true,
            },
            ProviderKind::Qemu | ProviderKind::None => Self {
                name: "",
                supported: false,
            },
        }
    }
}

/// Render the `gce.conf` INI the GCP cloud-controller-manager expects.
pub fn gce_conf(project_id: &str) -> String {
    format!(
        "[global]\nproject-id = {}\nuse-metadata-server = false\n",
        project_id
    )
}

/// Write `/etc/gce.conf` with mode 0644.
pub fn write_gce_conf(fs: &dyn FileSystem, project_id: &str) -> Result<()> {
    let path = Path::new(GCE_CONF_PATH);
    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent, 0o755)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs.write(path, gce_conf(project_id).as_bytes(), 0o644)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(project_id, "Wrote GCE cloud config");
    Ok(())
}
