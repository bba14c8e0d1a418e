use std::sync::Arc;

use anyhow::{Context, Result};
use constel_cloud::Provider;
use constel_core::fs::{FileSystem, OsFs};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::activation::NodeActivator;
use crate::activationapi::{self, ActivationClient, ActivationService};
use crate::cluster::KubeadmCluster;
use crate::config::CoordinatorConfig;
use crate::core::Core;
use crate::etcdstore::EtcdStoreFactory;
use crate::reinit::{self, InitialPeers, PeerSource, ReinitOptions};
use crate::store::StoreFactory;
use crate::tpm::FileTpm;
use crate::vpn::WgVpn;
use crate::vpnapi::{self, VpnApiClient};

/// Wire the core to the host: wireguard, kubeadm, the file TPM and the configured cloud.
pub async fn build_core(config: &CoordinatorConfig) -> Result<Core> {
    let fs: Arc<dyn FileSystem> = Arc::new(OsFs::new());
    let metadata = Provider::for_kind(
        config.node.cloud_provider,
        &config.metadata.endpoints(),
        config.cloud_timeout(),
    )
    .context("Failed to create cloud metadata client")?;
    let store_factory: Option<Arc<dyn StoreFactory>> = if config.store.etcd_endpoints.is_empty() {
        None
    } else {
        Some(Arc::new(EtcdStoreFactory {
            endpoints: config.store.etcd_endpoints.clone(),
            dial_timeout: config.etcd_dial_timeout(),
        }))
    };

    let core = Core::new(
        Arc::new(WgVpn::new(&config.node.vpn_interface, config.node.vpn_port)),
        Arc::new(KubeadmCluster::new(Arc::clone(&fs))),
        Arc::new(metadata),
        FileTpm::opener(Arc::clone(&fs), &config.tpm.measurement_path),
        fs,
        store_factory,
    )
    .await
    .context("Failed to create core")?;
    Ok(core.with_node_state_path(&config.node.node_state_path))
}

/// Initialize the core and spawn the background tasks. A fresh node serves
/// the activation API; an activated node rejoins first. The tasks stop when
/// `shutdown` fires.
pub async fn start(
    core: Arc<Core>,
    source: Arc<dyn PeerSource>,
    activator: Arc<dyn NodeActivator>,
    config: &CoordinatorConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<()>>> {
    if !core.initialize().await? {
        info!(state = %core.state().await, "Node is not activated, waiting for activation");
        let listener =
            activationapi::bind(&config.node.activation_listen_ip, config.node.activation_port)
                .await?;
        let service = Arc::new(ActivationService::new(
            core,
            activator,
            source,
            config.activation_settings(),
            shutdown.clone(),
        ));
        return Ok(vec![tokio::spawn(activationapi::serve(
            listener, service, shutdown,
        ))]);
    }

    let options = ReinitOptions {
        api_port: config.node.api_port,
        backoff: config.retrieve_peers_backoff(),
        ..Default::default()
    };
    let mut api_listener = None;
    let mut refresh_from: Option<InitialPeers> = None;
    reinit::reinitialize(
        &core,
        source.as_ref(),
        &options,
        |vpn_ip| {
            api_listener = Some(vpnapi::bind_std(vpn_ip, config.node.api_port)?);
            Ok(())
        },
        |initial| refresh_from = Some(initial.clone()),
    )
    .await?;

    let mut handles = Vec::new();
    if let Some(listener) = api_listener {
        let listener = TcpListener::from_std(listener).context("Failed to register VPN API listener")?;
        handles.push(tokio::spawn(vpnapi::serve(
            listener,
            core.clone(),
            shutdown.clone(),
        )));
    }
    if let Some(initial) = refresh_from {
        handles.push(tokio::spawn(reinit::run_peer_refresh(
            core,
            source,
            initial.endpoint,
            initial.resource_version,
            config.peer_refresh_interval(),
            shutdown,
        )));
    }
    Ok(handles)
}

/// Run the coordinator daemon until ctrl-c.
pub async fn serve(config: CoordinatorConfig) -> Result<()> {
    let core = Arc::new(build_core(&config).await?);
    info!(provider = %config.node.cloud_provider, state = %core.state().await, "Core starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source: Arc<dyn PeerSource> = Arc::new(VpnApiClient::default());
    let activator: Arc<dyn NodeActivator> = Arc::new(ActivationClient::default());
    let handles = start(core, source, activator, &config, shutdown_rx).await?;

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;

    info!("Shutdown signal received, stopping tasks...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("Coordinator stopped");
    Ok(())
}
