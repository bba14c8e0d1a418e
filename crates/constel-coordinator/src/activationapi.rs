//! Activation API served by fresh nodes on their public address.
//!
//! Uses the same framing as the VPN-API: one request frame and one response
//! frame per connection.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use constel_core::constants::{ACTIVATION_PORT, COORDINATOR_PORT};
use constel_core::instance::bytes_b64;
use constel_core::naming::join_host_port;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activation::{
    self, ActivationOptions, AdminConfig, CoordinatorActivation, NodeActivation, NodeActivator,
};
use crate::core::Core;
use crate::reinit::{self, PeerSource};
use crate::vpnapi::{self, exchange, read_frame, write_frame};

/// Bootstrapping the control plane runs `kubeadm init`, which takes minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationRequest {
    ActivateAsCoordinator(CoordinatorActivation),
    ActivateAdditionalNodes { node_public_ips: Vec<String> },
    ActivateAsNode(NodeActivation),
    JoinCluster { coordinator_vpn_ip: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationResponse {
    AdminConfig(AdminConfig),
    NodeActivated {
        #[serde(with = "bytes_b64")]
        vpn_pub_key: Vec<u8>,
    },
    Ack,
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub activation_port: u16,
    /// VPN-API port, served by coordinators once activated.
    pub api_port: u16,
    pub peer_refresh_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            activation_port: ACTIVATION_PORT,
            api_port: COORDINATOR_PORT,
            peer_refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Serves activation requests and owns the tasks started by an activation.
pub struct ActivationService {
    core: Arc<Core>,
    activator: Arc<dyn NodeActivator>,
    source: Arc<dyn PeerSource>,
    settings: ServiceSettings,
    shutdown: watch::Receiver<bool>,
    /// Activation requests run one at a time.
    busy: AsyncMutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ActivationService {
    pub fn new(
        core: Arc<Core>,
        activator: Arc<dyn NodeActivator>,
        source: Arc<dyn PeerSource>,
        settings: ServiceSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            core,
            activator,
            source,
            settings,
            shutdown,
            busy: AsyncMutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn options(&self) -> ActivationOptions {
        ActivationOptions {
            activation_port: self.settings.activation_port,
        }
    }

    fn start_vpn_api(&self, vpn_ip: &str) -> Result<()> {
        let listener = vpnapi::bind_std(vpn_ip, self.settings.api_port)?;
        let listener =
            TcpListener::from_std(listener).context("Failed to register VPN API listener")?;
        let handle = tokio::spawn(vpnapi::serve(
            listener,
            self.core.clone(),
            self.shutdown.clone(),
        ));
        self.tasks().push(handle);
        Ok(())
    }

    async fn join_cluster(&self, coordinator_vpn_ip: &str) -> Result<()> {
        let endpoint = join_host_port(coordinator_vpn_ip, &self.settings.api_port.to_string());
        activation::join_cluster_as_node(&self.core, self.source.as_ref(), &endpoint).await?;
        let handle = tokio::spawn(reinit::run_peer_refresh(
            self.core.clone(),
            self.source.clone(),
            endpoint,
            0,
            self.settings.peer_refresh_interval,
            self.shutdown.clone(),
        ));
        self.tasks().push(handle);
        Ok(())
    }

    /// Handle one request. `local` is the address the caller reached this node at.
    pub async fn handle(&self, request: ActivationRequest, local: SocketAddr) -> ActivationResponse {
        let _busy = self.busy.lock().await;
        let result = match request {
            ActivationRequest::ActivateAsCoordinator(request) => activation::activate_as_coordinator(
                &self.core,
                self.activator.as_ref(),
                &request,
                &local.ip().to_string(),
                &self.options(),
                |vpn_ip| self.start_vpn_api(vpn_ip),
            )
            .await
            .map(ActivationResponse::AdminConfig),
            ActivationRequest::ActivateAdditionalNodes { node_public_ips } => {
                activation::activate_additional_nodes(
                    &self.core,
                    self.activator.as_ref(),
                    &node_public_ips,
                    &self.options(),
                )
                .await
                .map(|_| ActivationResponse::Ack)
            }
            ActivationRequest::ActivateAsNode(activation) => {
                activation::activate_as_node(&self.core, &activation)
                    .await
                    .map(|vpn_pub_key| ActivationResponse::NodeActivated { vpn_pub_key })
            }
            ActivationRequest::JoinCluster { coordinator_vpn_ip } => self
                .join_cluster(&coordinator_vpn_ip)
                .await
                .map(|_| ActivationResponse::Ack),
        };
        result.unwrap_or_else(|e| {
            warn!(error = %format!("{:#}", e), "Activation request failed");
            ActivationResponse::Error {
                message: format!("{:#}", e),
            }
        })
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    service: &ActivationService,
) -> Result<()> {
    let local = stream.local_addr()?;
    let request: ActivationRequest = read_frame(&mut stream).await?;
    debug!(peer = %peer, "Activation request");
    let response = service.handle(request, local).await;
    write_frame(&mut stream, &response).await
}

/// Bind the activation listener on `ip:port`.
pub async fn bind(ip: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", ip, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind activation API on {}", addr))?;
    info!(listen = %addr, "Activation API listening");
    Ok(listener)
}

/// Accept connections until `shutdown` fires, then wait for the tasks the
/// activation started.
pub async fn serve(
    listener: TcpListener,
    service: Arc<ActivationService>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, &service).await {
                                warn!(peer = %peer, error = %e, "Activation connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Activation API shutting down");
                break;
            }
        }
    }
    for handle in service.take_tasks() {
        let _ = handle.await;
    }
}

/// Client for the activation API of a node.
#[derive(Debug, Clone)]
pub struct ActivationClient {
    timeout: Duration,
}

impl Default for ActivationClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ActivationClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn send(&self, endpoint: &str, request: &ActivationRequest) -> Result<ActivationResponse> {
        let response: ActivationResponse = exchange(endpoint, request, self.timeout).await?;
        if let ActivationResponse::Error { message } = response {
            bail!("{}: {}", endpoint, message);
        }
        Ok(response)
    }

    pub async fn activate_as_coordinator(
        &self,
        endpoint: &str,
        request: &CoordinatorActivation,
    ) -> Result<AdminConfig> {
        let request = ActivationRequest::ActivateAsCoordinator(request.clone());
        match self.send(endpoint, &request).await? {
            ActivationResponse::AdminConfig(config) => Ok(config),
            other => bail!("Unexpected response to ActivateAsCoordinator: {:?}", other),
        }
    }

    pub async fn activate_additional_nodes(
        &self,
        endpoint: &str,
        node_public_ips: &[String],
    ) -> Result<()> {
        let request = ActivationRequest::ActivateAdditionalNodes {
            node_public_ips: node_public_ips.to_vec(),
        };
        match self.send(endpoint, &request).await? {
            ActivationResponse::Ack => Ok(()),
            other => bail!("Unexpected response to ActivateAdditionalNodes: {:?}", other),
        }
    }
}

#[async_trait]
impl NodeActivator for ActivationClient {
    async fn activate_node(&self, endpoint: &str, activation: &NodeActivation) -> Result<Vec<u8>> {
        let request = ActivationRequest::ActivateAsNode(activation.clone());
        match self.send(endpoint, &request).await? {
            ActivationResponse::NodeActivated { vpn_pub_key } => Ok(vpn_pub_key),
            other => bail!("Unexpected response to ActivateAsNode: {:?}", other),
        }
    }

    async fn join_cluster(&self, endpoint: &str, coordinator_vpn_ip: &str) -> Result<()> {
        let request = ActivationRequest::JoinCluster {
            coordinator_vpn_ip: coordinator_vpn_ip.to_string(),
        };
        match self.send(endpoint, &request).await? {
            ActivationResponse::Ack => Ok(()),
            other => bail!("Unexpected response to JoinCluster: {:?}", other),
        }
    }
}
