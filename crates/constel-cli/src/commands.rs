use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Instrument, info, warn};

use constel_access::manager::AccessManager;
use constel_access::ssh::{UserKey, parse_key_map};
use constel_access::user::ShellUserCreator;
use constel_cloud::{MetadataEndpoints, Provider, ProviderKind};
use constel_core::constants::{CLOUD_TIMEOUT, HOST_ROOT};
use constel_core::fs::OsFs;
use constel_core::instance::Instance;
use constel_core::serviceaccount::{self, ServiceAccount};
use constel_coordinator::config::CoordinatorConfig;
use constel_coordinator::server;

use crate::logging::{self, LogFormat};

const REDACTED: &str = "<redacted>";

#[derive(Parser)]
#[command(
    name = "constel",
    version,
    about = "In-guest control plane for confidential Kubernetes nodes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node core: initialize, rejoin, serve the VPN API, and refresh peers
    Coordinator {
        /// Coordinator config file (TOML)
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
    /// Reconcile host users and SSH keys once
    AccessManager {
        /// Root of the host filesystem. Changes root into it unless it is `/`
        #[arg(long, default_value = HOST_ROOT)]
        host_root: PathBuf,
        /// JSON object mapping user names to SSH public keys
        #[arg(long, conflicts_with = "from_metadata", required_unless_present = "from_metadata")]
        keys: Option<PathBuf>,
        /// Take the keys from this cloud's self instance (azure, gcp, qemu)
        #[arg(long)]
        from_metadata: Option<ProviderKind>,
    },
    /// Move the etcd process into the real-time I/O class
    EtcdIoprio,
    /// Validate a serviceaccount:// URI and print its fields
    ParseServiceAccount {
        /// The service account URI
        uri: String,
    },
}

/// Run an async command on a fresh tokio runtime.
fn block_on<F, T>(f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to create tokio runtime")?;
    runtime.block_on(f)
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let daemon = matches!(
        cli.command,
        Commands::Coordinator { .. } | Commands::AccessManager { .. }
    );
    logging::init(LogFormat::for_daemon(daemon));

    match cli.command {
        Commands::Coordinator { config } => cmd_coordinator(&config),
        Commands::AccessManager {
            host_root,
            keys,
            from_metadata,
        } => cmd_access_manager(&host_root, keys.as_deref(), from_metadata),
        Commands::EtcdIoprio => cmd_etcd_ioprio(),
        Commands::ParseServiceAccount { uri } => cmd_parse_service_account(&uri),
    }
}

fn cmd_coordinator(config_path: &Path) -> Result<()> {
    let config = CoordinatorConfig::from_file(config_path)?;
    block_on(server::serve(config).instrument(logging::daemon_span("coordinator")))
}

/// First key of every user listed on the instance.
fn keys_from_instance(instance: &Instance) -> Vec<UserKey> {
    instance
        .ssh_keys
        .iter()
        .filter_map(|(user, keys)| keys.first().map(|key| UserKey::new(user.clone(), key.clone())))
        .collect()
}

fn declared_keys(keys: Option<&Path>, from_metadata: Option<ProviderKind>) -> Result<Vec<UserKey>> {
    match (keys, from_metadata) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read SSH key map {}", path.display()))?;
            parse_key_map(&raw)
        }
        (None, Some(kind)) => {
            let provider = Provider::for_kind(kind, &MetadataEndpoints::default(), CLOUD_TIMEOUT)?;
            let instance = block_on(provider.self_instance())
                .context("Failed to retrieve SSH keys from cloud metadata")?;
            Ok(keys_from_instance(&instance))
        }
        (None, None) => bail!("Either --keys or --from-metadata is required"),
    }
}

fn change_root(host_root: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(host_root.as_os_str().as_bytes())
        .with_context(|| format!("Invalid host root {}", host_root.display()))?;
    // SAFETY: `path` is a valid NUL-terminated string that outlives the call.
    if unsafe { libc::chroot(path.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to change root to {}", host_root.display()));
    }
    std::env::set_current_dir("/").context("Failed to enter new root")?;
    Ok(())
}

fn cmd_access_manager(
    host_root: &Path,
    keys: Option<&Path>,
    from_metadata: Option<ProviderKind>,
) -> Result<()> {
    let _span = logging::daemon_span("access-manager").entered();
    // Keys are read before changing root; the key file lives outside the host tree.
    let declared = declared_keys(keys, from_metadata)?;

    if host_root != Path::new("/") {
        change_root(host_root)?;
        info!(host_root = %host_root.display(), "Changed root to host filesystem");
    }

    let manager = AccessManager::new(Arc::new(OsFs::new()), Arc::new(ShellUserCreator));
    let summary = manager.reconcile(&declared)?;
    info!(
        deployed = summary.deployed.len(),
        evicted = summary.evicted.len(),
        failed = summary.failed.len(),
        "Access reconciliation finished"
    );
    if !summary.failed.is_empty() {
        warn!(users = ?summary.failed, "Some users could not be reconciled");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn cmd_etcd_ioprio() -> Result<()> {
    use constel_access::ioprio::EtcdIoPrioritizer;

    let pid = EtcdIoPrioritizer::default()
        .prioritize()
        .context("Failed to prioritize etcd")?;
    info!(pid, "Set etcd I/O priority to real-time");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn cmd_etcd_ioprio() -> Result<()> {
    Err(constel_core::Error::PlatformUnsupported("etcd I/O priority requires Linux".to_string()).into())
}

/// Printable fields of a service account. Secrets are replaced by a marker.
fn describe(account: &ServiceAccount) -> Vec<(&'static str, String)> {
    match account {
        ServiceAccount::Azure(a) => vec![
            ("provider", "azure".to_string()),
            ("tenant_id", a.tenant_id.clone()),
            ("client_id", a.client_id.clone()),
            ("client_secret", REDACTED.to_string()),
            ("location", a.location.clone()),
        ],
        ServiceAccount::Gcp(k) => vec![
            ("provider", "gcp".to_string()),
            ("type", k.key_type.clone()),
            ("project_id", k.project_id.clone()),
            ("private_key_id", k.private_key_id.clone()),
            ("private_key", REDACTED.to_string()),
            ("client_email", k.client_email.clone()),
            ("client_id", k.client_id.clone()),
            ("auth_uri", k.auth_uri.clone()),
            ("token_uri", k.token_uri.clone()),
        ],
    }
}

fn cmd_parse_service_account(uri: &str) -> Result<()> {
    let account = serviceaccount::parse(uri).context("Invalid service account URI")?;
    for (field, value) in describe(&account) {
        println!("{:<16} {}", field, value);
    }
    Ok(())
}
