//! Internal control-plane API served by coordinators on their VPN IP.
//!
//! Each connection carries one request frame and one response frame. A frame is
//! a 4-byte big-endian length followed by that many bytes of JSON.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use constel_core::Error;
use constel_core::instance::{Peer, bytes_b64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::JoinArgs;
use crate::core::Core;
use crate::reinit::PeerSource;

pub const MAX_FRAME_LEN: usize = 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VpnApiRequest {
    GetVpnPeers { resource_version: u64 },
    Heartbeat,
    GetDataKey { key_id: String, length: usize },
    GetK8sJoinArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VpnApiResponse {
    /// `peers` is absent when the caller's version is current.
    Peers {
        resource_version: u64,
        peers: Option<Vec<Peer>>,
    },
    Ack,
    DataKey {
        #[serde(with = "bytes_b64")]
        key: Vec<u8>,
    },
    JoinArgs { args: JoinArgs },
    Error { message: String },
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).context("Failed to serialize frame")?;
    if body.len() > MAX_FRAME_LEN {
        bail!("Frame too large: {} bytes", body.len());
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("Frame too large: {} bytes", len);
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("Failed to read frame body")?;
    serde_json::from_slice(&buf).context("Failed to parse frame")
}

/// What the VPN-API needs from the node core.
#[async_trait]
pub trait VpnApiHandler: Send + Sync {
    async fn get_vpn_peers(&self, resource_version: u64) -> Result<(u64, Option<Vec<Peer>>)>;
    /// `peer_addr` is the caller's IP.
    async fn heartbeat(&self, peer_addr: &str);
    async fn get_data_key(&self, key_id: &str, length: usize) -> Result<Vec<u8>>;
    async fn get_k8s_join_args(&self) -> Result<JoinArgs>;
}

#[async_trait]
impl VpnApiHandler for Core {
    async fn get_vpn_peers(&self, resource_version: u64) -> Result<(u64, Option<Vec<Peer>>)> {
        self.get_peers(resource_version).await
    }

    async fn heartbeat(&self, peer_addr: &str) {
        self.notify_heartbeat(peer_addr);
    }

    async fn get_data_key(&self, key_id: &str, length: usize) -> Result<Vec<u8>> {
        Core::get_data_key(self, key_id, length).await
    }

    async fn get_k8s_join_args(&self) -> Result<JoinArgs> {
        Core::get_k8s_join_args(self)
    }
}

async fn dispatch(
    handler: &dyn VpnApiHandler,
    peer: SocketAddr,
    request: VpnApiRequest,
) -> VpnApiResponse {
    let result = match request {
        VpnApiRequest::GetVpnPeers { resource_version } => handler
            .get_vpn_peers(resource_version)
            .await
            .map(|(resource_version, peers)| VpnApiResponse::Peers {
                resource_version,
                peers,
            }),
        VpnApiRequest::Heartbeat => {
            handler.heartbeat(&peer.ip().to_string()).await;
            Ok(VpnApiResponse::Ack)
        }
        VpnApiRequest::GetDataKey { key_id, length } => handler
            .get_data_key(&key_id, length)
            .await
            .map(|key| VpnApiResponse::DataKey { key }),
        VpnApiRequest::GetK8sJoinArgs => handler
            .get_k8s_join_args()
            .await
            .map(|args| VpnApiResponse::JoinArgs { args }),
    };
    result.unwrap_or_else(|e| {
        warn!(peer = %peer, error = %format!("{:#}", e), "VPN API request failed");
        VpnApiResponse::Error {
            message: format!("{:#}", e),
        }
    })
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: &dyn VpnApiHandler,
) -> Result<()> {
    let request: VpnApiRequest = read_frame(&mut stream).await?;
    debug!(peer = %peer, ?request, "VPN API request");
    let response = dispatch(handler, peer, request).await;
    write_frame(&mut stream, &response).await
}

/// Bind the VPN-API listener on `ip:port`.
pub async fn bind(ip: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", ip, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind VPN API on {}", addr))?;
    info!(listen = %addr, "VPN API listening");
    Ok(listener)
}

/// Accept connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn VpnApiHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, handler.as_ref()).await {
                                warn!(peer = %peer, error = %e, "VPN API connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("VPN API shutting down");
                break;
            }
        }
    }
}

/// Send one request frame to `endpoint` and read one response frame, all
/// within `timeout`.
pub async fn exchange<Q, R>(endpoint: &str, request: &Q, timeout: Duration) -> Result<R>
where
    Q: Serialize + Sync,
    R: DeserializeOwned,
{
    let round_trip = async {
        let mut stream = TcpStream::connect(endpoint)
            .await
            .with_context(|| format!("Failed to connect to {}", endpoint))?;
        write_frame(&mut stream, request).await?;
        read_frame::<_, R>(&mut stream).await
    };
    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| Error::TransientRemote(format!("request to {} timed out", endpoint)))?
}

/// Bind a listener for the VPN-API from synchronous code, ready to be handed
/// to [`serve`] once inside the runtime.
pub fn bind_std(ip: &str, port: u16) -> Result<StdTcpListener> {
    let addr = format!("{}:{}", ip, port);
    let listener = StdTcpListener::bind(&addr)
        .with_context(|| format!("Failed to bind VPN API on {}", addr))?;
    listener.set_nonblocking(true)?;
    info!(listen = %addr, "VPN API listening");
    Ok(listener)
}

/// Client for a coordinator's VPN-API.
#[derive(Debug, Clone)]
pub struct VpnApiClient {
    timeout: Duration,
}

impl Default for VpnApiClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl VpnApiClient {
    /// `timeout` bounds each request, connect included.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn send(&self, endpoint: &str, request: &VpnApiRequest) -> Result<VpnApiResponse> {
        let response: VpnApiResponse = exchange(endpoint, request, self.timeout).await?;
        if let VpnApiResponse::Error { message } = response {
            bail!(Error::TransientRemote(format!("{}: {}", endpoint, message)));
        }
        Ok(response)
    }

    pub async fn get_data_key(&self, endpoint: &str, key_id: &str, length: usize) -> Result<Vec<u8>> {
        let request = VpnApiRequest::GetDataKey {
            key_id: key_id.to_string(),
            length,
        };
        match self.send(endpoint, &request).await? {
            VpnApiResponse::DataKey { key } => Ok(key),
            other => bail!("Unexpected response to GetDataKey: {:?}", other),
        }
    }
}

#[async_trait]
impl PeerSource for VpnApiClient {
    async fn get_vpn_peers(
        &self,
        endpoint: &str,
        resource_version: u64,
    ) -> Result<(u64, Option<Vec<Peer>>)> {
        match self
            .send(endpoint, &VpnApiRequest::GetVpnPeers { resource_version })
            .await?
        {
            VpnApiResponse::Peers {
                resource_version,
                peers,
            } => Ok((resource_version, peers)),
            other => bail!("Unexpected response to GetVpnPeers: {:?}", other),
        }
    }

    async fn heartbeat(&self, endpoint: &str) -> Result<()> {
        match self.send(endpoint, &VpnApiRequest::Heartbeat).await? {
            VpnApiResponse::Ack => Ok(()),
            other => bail!("Unexpected response to Heartbeat: {:?}", other),
        }
    }

    async fn get_k8s_join_args(&self, endpoint: &str) -> Result<JoinArgs> {
        match self.send(endpoint, &VpnApiRequest::GetK8sJoinArgs).await? {
            VpnApiResponse::JoinArgs { args } => Ok(args),
            other => bail!("Unexpected response to GetK8sJoinArgs: {:?}", other),
        }
    }
}
