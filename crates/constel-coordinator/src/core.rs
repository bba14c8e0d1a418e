//! The node core: lifecycle state, identity, peers, and KMS access.
//!
//! One mutex guards the lifecycle state and the KMS handle. State transitions,
//! KMS installation and node state writes all serialize on it. Heartbeats use a
//! separate lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use constel_cloud::Provider;
use constel_cloud::ccm::{CcmSupport, write_gce_conf};
use constel_core::Error;
use constel_core::constants::{
    COORDINATOR_VPN_IP, NODE_STATE_PATH, OWNER_ID_INFO, OWNER_ID_SALT, RNG_LENGTH_DEFAULT,
};
use constel_core::fs::FileSystem;
use constel_core::instance::Peer;
use constel_core::naming::k8s_compliant_hostname;
use constel_core::nodestate::NodeState;
use constel_core::role::Role;
use constel_core::state::{CoreState, validate_transition};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::cluster::{Cluster, InitClusterInput, JOIN_TOKEN_TTL, JoinArgs, JoinClusterInput};
use crate::kms::{Kms, derive_key, set_up_kms};
use crate::store::{MemoryStore, Store, StoreFactory, Transaction};
use crate::storewrapper::{KmsInfo, StoreWrapper};
use crate::tpm::OpenTpm;
use crate::vpn::Vpn;

struct Lifecycle {
    state: CoreState,
    kms: Option<Arc<dyn Kms>>,
}

pub struct Core {
    lifecycle: AsyncMutex<Lifecycle>,
    store: RwLock<Arc<dyn Store>>,
    store_factory: Option<Arc<dyn StoreFactory>>,
    vpn: Arc<dyn Vpn>,
    cluster: Arc<dyn Cluster>,
    metadata: Arc<Provider>,
    ccm: CcmSupport,
    open_tpm: OpenTpm,
    fs: Arc<dyn FileSystem>,
    node_state_path: PathBuf,
    last_heartbeats: Mutex<HashMap<String, SystemTime>>,
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Commit `tx` if staging succeeded, otherwise roll it back.
async fn commit_or_rollback<T>(tx: Box<dyn Transaction>, staged: Result<T>) -> Result<T> {
    match staged {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            tx.rollback().await;
            Err(e)
        }
    }
}

/// Owner ID derived from the master secret.
pub fn derive_owner_id(master_secret: &[u8]) -> Result<Vec<u8>> {
    derive_key(master_secret, OWNER_ID_SALT, OWNER_ID_INFO, RNG_LENGTH_DEFAULT)
}

impl Core {
    /// Create a core on an in-memory store, generate the VPN key pair and move to `AcceptingInit`.
    pub async fn new(
        vpn: Arc<dyn Vpn>,
        cluster: Arc<dyn Cluster>,
        metadata: Arc<Provider>,
        open_tpm: OpenTpm,
        fs: Arc<dyn FileSystem>,
        store_factory: Option<Arc<dyn StoreFactory>>,
    ) -> Result<Self> {
        open_tpm().context("Failed to open TPM")?;

        let ccm = CcmSupport::for_provider(metadata.kind());
        let core = Self {
            lifecycle: AsyncMutex::new(Lifecycle {
                state: CoreState::Uninitialized,
                kms: None,
            }),
            store: RwLock::new(Arc::new(MemoryStore::new())),
            store_factory,
            vpn,
            cluster,
            metadata,
            ccm,
            open_tpm,
            fs,
            node_state_path: PathBuf::from(NODE_STATE_PATH),
            last_heartbeats: Mutex::new(HashMap::new()),
        };

        let store = core.store();
        let data = StoreWrapper::new(&*store);
        data.increment_peers_resource_version().await?;
        core.vpn
            .setup(None)
            .context("Failed to set up VPN interface")?;
        data.put_vpn_key(&core.vpn.get_public_key()?).await?;
        data.initialize_store_ips().await?;

        core.set_state(CoreState::AcceptingInit).await?;
        Ok(core)
    }

    pub fn with_node_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.node_state_path = path.into();
        self
    }

    /// The active store. Replaced once by [`Core::switch_to_persistent_store`].
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metadata(&self) -> &Provider {
        &self.metadata
    }

    pub fn vpn(&self) -> &dyn Vpn {
        self.vpn.as_ref()
    }

    pub async fn state(&self) -> CoreState {
        self.lifecycle.lock().await.state
    }

    async fn set_state(&self, target: CoreState) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        validate_transition(lifecycle.state, target)?;
        info!(from = %lifecycle.state, to = %target, "Core state changed");
        lifecycle.state = target;
        Ok(())
    }

    /// Record the failure. `Failed` is absorbing.
    pub async fn mark_failed(&self, reason: &anyhow::Error) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != CoreState::Failed {
            error!(from = %lifecycle.state, error = %format!("{:#}", reason), "Core failed");
            lifecycle.state = CoreState::Failed;
        }
    }

    /// Move the lifecycle forward. Leaving `AcceptingInit` for an activated state
    /// first records `(owner_id, cluster_id)` in the TPM; if that fails the state
    /// stays where it was.
    pub async fn advance_state(
        &self,
        target: CoreState,
        owner_id: &[u8],
        cluster_id: &[u8],
    ) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        validate_transition(lifecycle.state, target)?;

        if lifecycle.state == CoreState::AcceptingInit && target.requires_activation() {
            let tpm = (self.open_tpm)().context("Failed to open TPM")?;
            tpm.mark_node_initialized(owner_id, cluster_id)
                .context("Failed to mark node as initialized")?;
            let store = self.store();
            let tx = store.begin_transaction().await?;
            let staged = StoreWrapper::new(&*tx).put_cluster_id(cluster_id).await;
            commit_or_rollback(tx, staged).await?;
        }

        info!(from = %lifecycle.state, to = %target, "Core state advanced");
        lifecycle.state = target;
        Ok(())
    }

    /// Detect a previous activation. Returns `false` on a fresh node.
    ///
    /// On an activated node the VPN key is restored from the node state and the
    /// core moves to the persisted role's state. The caller then rejoins the VPN.
    pub async fn initialize(&self) -> Result<bool> {
        let tpm = (self.open_tpm)().context("Failed to open TPM")?;
        let measured = tpm
            .is_node_initialized()
            .context("Failed to check for previous activation")?;
        let has_state = self.fs.exists(&self.node_state_path);

        match (measured, has_state) {
            (false, false) => {
                info!("Node was never activated, accepting activation");
                Ok(false)
            }
            (false, true) => Err(Error::StateInvariant(format!(
                "node state {} exists but the node is not marked initialized",
                self.node_state_path.display()
            ))
            .into()),
            (true, false) => Err(Error::StateInvariant(format!(
                "node is marked initialized but node state {} is missing",
                self.node_state_path.display()
            ))
            .into()),
            (true, true) => {
                let node_state = self.node_state()?;
                let target = match node_state.role {
                    Role::Coordinator => CoreState::ActivatingNodes,
                    Role::Node => CoreState::IsNode,
                    other => {
                        bail!(Error::StateInvariant(format!(
                            "invalid role for an initialized node: {}",
                            other
                        )))
                    }
                };
                info!(role = %node_state.role, "Node was previously activated, rejoining");
                self.vpn
                    .setup(Some(&node_state.vpn_priv_key))
                    .context("Failed to restore VPN key")?;
                let pub_key = self.vpn.get_public_key()?;
                let store = self.store();
                let tx = store.begin_transaction().await?;
                let staged = StoreWrapper::new(&*tx).put_vpn_key(&pub_key).await;
                commit_or_rollback(tx, staged).await?;
                self.set_state(target).await?;
                Ok(true)
            }
        }
    }

    pub fn node_state(&self) -> Result<NodeState> {
        NodeState::from_path(self.fs.as_ref(), &self.node_state_path)
    }

    /// Write the node state. Fails if it was already written this boot.
    pub async fn persist_node_state(
        &self,
        role: Role,
        owner_id: &[u8],
        cluster_id: &[u8],
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let node_state = NodeState {
            role,
            vpn_ip: self
                .vpn
                .get_interface_ip()
                .context("Failed to retrieve VPN IP")?,
            vpn_priv_key: self
                .vpn
                .get_private_key()
                .context("Failed to retrieve VPN private key")?,
            owner_id: owner_id.to_vec(),
            cluster_id: cluster_id.to_vec(),
        };
        node_state.to_path(self.fs.as_ref(), &self.node_state_path)?;
        info!(role = %role, path = %self.node_state_path.display(), "Persisted node state");
        Ok(())
    }

    /// Owner and cluster ID. With a master secret, a new cluster ID is generated and
    /// the secret is stored; without, both are read from the store.
    pub async fn get_ids(&self, master_secret: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>)> {
        let store = self.store();
        let (master_secret, cluster_id) = match master_secret {
            Some(secret) => {
                let cluster_id = random_bytes(RNG_LENGTH_DEFAULT);
                let tx = store.begin_transaction().await?;
                let staged = StoreWrapper::new(&*tx).put_master_secret(secret).await;
                commit_or_rollback(tx, staged).await?;
                (secret.to_vec(), cluster_id)
            }
            None => {
                let data = StoreWrapper::new(&*store);
                let cluster_id = data.get_cluster_id().await?;
                (data.get_master_secret().await?, cluster_id)
            }
        };
        Ok((derive_owner_id(&master_secret)?, cluster_id))
    }

    /// Install the KMS. Unless `use_existing` is set, the master secret is imported
    /// as the key encryption key `kek_id`.
    pub async fn set_up_kms(
        &self,
        storage_uri: &str,
        kms_uri: &str,
        kek_id: &str,
        use_existing: bool,
    ) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let kms = set_up_kms(storage_uri, kms_uri)?;
        let store = self.store();

        if use_existing {
            if kms.is_volatile() {
                let kek = StoreWrapper::new(&*store).get_master_secret().await?;
                kms.create_kek(kek_id, &kek).await?;
            }
        } else {
            let tx = store.begin_transaction().await?;
            let data = StoreWrapper::new(&*tx);
            let staged = async {
                let kek = data.get_master_secret().await?;
                kms.create_kek(kek_id, &kek).await?;
                data.put_kek_id(kek_id).await?;
                data.put_kms_data(&KmsInfo {
                    kms_uri: kms_uri.to_string(),
                    storage_uri: storage_uri.to_string(),
                    kek_id: kek_id.to_string(),
                })
                .await
            }
            .await;
            commit_or_rollback(tx, staged).await?;
        }
        lifecycle.kms = Some(kms);
        info!(kms_uri, use_existing, "KMS set up");
        Ok(())
    }

    pub async fn get_kms_info(&self) -> Result<KmsInfo> {
        StoreWrapper::new(&*self.store()).get_kms_data().await
    }

    /// Derive data key `key_id`. Fails until the KMS is set up.
    pub async fn get_data_key(&self, key_id: &str, length: usize) -> Result<Vec<u8>> {
        let kms = self.lifecycle.lock().await.kms.clone();
        let Some(kms) = kms else {
            error!("Trying to request data key before KMS is set up");
            return Err(Error::KmsUninitialized.into());
        };
        let kek_id = StoreWrapper::new(&*self.store()).get_kek_id().await?;
        kms.get_dek(&kek_id, key_id, length).await
    }

    fn heartbeats(&self) -> MutexGuard<'_, HashMap<String, SystemTime>> {
        self.last_heartbeats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notify_heartbeat(&self, peer_addr: &str) {
        self.heartbeats()
            .insert(peer_addr.to_string(), SystemTime::now());
    }

    pub fn last_heartbeats(&self) -> HashMap<String, SystemTime> {
        self.heartbeats().clone()
    }

    pub fn get_vpn_pub_key(&self) -> Result<Vec<u8>> {
        self.vpn.get_public_key()
    }

    pub fn get_vpn_ip(&self) -> Result<String> {
        self.vpn.get_interface_ip()
    }

    pub fn set_vpn_ip(&self, ip: &str) -> Result<()> {
        self.vpn.set_interface_ip(ip)
    }

    /// Peers if `resource_version` is stale, else `None`. Always returns the current version.
    pub async fn get_peers(&self, resource_version: u64) -> Result<(u64, Option<Vec<Peer>>)> {
        let store = self.store();
        let current = StoreWrapper::new(&*store)
            .get_peers_resource_version()
            .await?;
        if current == resource_version {
            return Ok((current, None));
        }

        let tx = store.begin_transaction().await?;
        let data = StoreWrapper::new(&*tx);
        let snapshot = async {
            let version = data.get_peers_resource_version().await?;
            let peers = data.get_peers().await?;
            anyhow::Ok((version, peers))
        }
        .await;
        tx.rollback().await;
        let (version, peers) = snapshot?;
        Ok((version, Some(peers)))
    }

    /// Add a peer to the datapath (unless it is this node) and to the store.
    pub async fn add_peer(&self, peer: &Peer) -> Result<()> {
        let own_ip = self.vpn.get_interface_ip().unwrap_or_default();
        if peer.vpn_ip != own_ip {
            // Admin peers dial in and have no endpoint.
            let host = if peer.public_endpoint.is_empty() {
                String::new()
            } else {
                peer.endpoint_host()?
            };
            self.vpn
                .add_peer(&peer.vpn_pub_key, &host, &peer.vpn_ip)
                .with_context(|| format!("Failed to add VPN peer {}", peer.vpn_ip))?;
        }

        let store = self.store();
        let tx = store.begin_transaction().await?;
        let data = StoreWrapper::new(&*tx);
        let staged = async {
            data.increment_peers_resource_version().await?;
            data.put_peer(peer).await
        }
        .await;
        if let Err(e) = staged {
            tx.rollback().await;
            return Err(e);
        }
        tx.commit().await?;
        info!(vpn_ip = %peer.vpn_ip, role = %peer.role, "Added peer");
        Ok(())
    }

    /// Remove the peer with `pub_key` and return its VPN IP to the pool.
    pub async fn remove_peer(&self, pub_key: &[u8]) -> Result<()> {
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let data = StoreWrapper::new(&*tx);
        let removed = async {
            let peer = data
                .get_peers()
                .await?
                .into_iter()
                .find(|p| p.vpn_pub_key == pub_key)
                .ok_or_else(|| Error::NotFound("peer with the given public key".to_string()))?;
            if peer.vpn_ip != self.vpn.get_interface_ip().unwrap_or_default() {
                self.vpn.remove_peer(pub_key)?;
            }
            data.increment_peers_resource_version().await?;
            data.remove_peer(&peer).await?;
            data.put_freed_node_vpn_ip(&peer.vpn_ip).await?;
            anyhow::Ok(peer)
        }
        .await;
        match removed {
            Ok(peer) => {
                tx.commit().await?;
                info!(vpn_ip = %peer.vpn_ip, "Removed peer");
                Ok(())
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Converge the datapath on `peers`. The store is left alone.
    pub fn update_peers(&self, peers: &[Peer]) -> Result<()> {
        let own_ip = self.vpn.get_interface_ip().unwrap_or_default();
        let others: Vec<Peer> = peers
            .iter()
            .filter(|p| p.vpn_ip != own_ip)
            .cloned()
            .collect();
        self.vpn.update_peers(&others)
    }

    /// Pop the next free node IP in its own transaction.
    pub async fn get_next_node_ip(&self) -> Result<String> {
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let popped = StoreWrapper::new(&*tx).pop_next_free_node_ip().await;
        match popped {
            Ok(ip) => {
                tx.commit().await?;
                Ok(ip)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Return an IP handed out by [`Core::get_next_node_ip`] that was never used.
    pub async fn release_node_ip(&self, vpn_ip: &str) -> Result<()> {
        let store = self.store();
        let tx = store.begin_transaction().await?;
        let staged = StoreWrapper::new(&*tx).put_freed_node_vpn_ip(vpn_ip).await;
        commit_or_rollback(tx, staged).await
    }

    pub async fn initialize_store_ips(&self) -> Result<()> {
        StoreWrapper::new(&*self.store())
            .initialize_store_ips()
            .await
    }

    /// Move to the persistent store and use it from now on.
    ///
    /// A persistent store some coordinator already set up is adopted as is, so
    /// its peers version and IP pool never go backwards. A fresh one receives
    /// the in-memory entries. Without a persistent store factory the in-memory
    /// store stays active.
    pub async fn switch_to_persistent_store(&self) -> Result<()> {
        let Some(factory) = &self.store_factory else {
            warn!("No persistent store configured, keeping the in-memory store");
            return Ok(());
        };
        let persistent = factory
            .create()
            .await
            .context("Failed to create persistent store")?;
        let initialized = StoreWrapper::new(&*persistent)
            .is_initialized()
            .await
            .context("Failed to inspect persistent store")?;
        if initialized {
            info!("Adopting initialized persistent store");
        } else {
            self.store()
                .transfer(persistent.as_ref())
                .await
                .context("Transfer to persistent store failed")?;
        }
        *self.store.write().unwrap_or_else(|e| e.into_inner()) = persistent;
        info!(adopted = initialized, "Switched to persistent store");
        Ok(())
    }

    pub fn get_k8s_join_args(&self) -> Result<JoinArgs> {
        self.cluster.get_join_token(JOIN_TOKEN_TTL)
    }

    pub fn get_k8s_certificate_key(&self) -> Result<String> {
        self.cluster.get_kubeadm_certificate_key()
    }

    async fn prepare_for_ccm(&self, vpn_ip: &str) -> Result<()> {
        if let Provider::Gcp(gcp) = self.metadata.as_ref() {
            let project = gcp.project_id().await?;
            write_gce_conf(self.fs.as_ref(), &project)?;
        }
        self.metadata.set_vpn_ip(vpn_ip).await
    }

    /// Bootstrap Kubernetes with this node as the first control plane and store the kubeconfig.
    pub async fn init_cluster(&self, autoscaling_node_groups: Vec<String>) -> Result<Vec<u8>> {
        let coordinator_ip = COORDINATOR_VPN_IP.to_string();
        let mut node_name = coordinator_ip.clone();
        let mut node_ip = coordinator_ip.clone();
        let mut provider_id = String::new();

        if self.metadata.supported() {
            let instance = self
                .metadata
                .self_instance()
                .await
                .context("Retrieving own instance metadata failed")?;
            node_name = instance.name;
            provider_id = instance.provider_id;
            if !instance.vpc_ip.is_empty() {
                node_ip = instance.vpc_ip;
            }
        }
        let ccm_supported = self.ccm.supported && self.metadata.supported();
        if ccm_supported {
            info!("Preparing node for cloud-controller-manager");
            self.prepare_for_ccm(&coordinator_ip)
                .await
                .context("Preparing node for cloud-controller-manager failed")?;
        }

        info!(node_name = %node_name, node_ip = %node_ip, "Initializing cluster");
        self.cluster
            .init_cluster(&InitClusterInput {
                api_server_advertise_ip: coordinator_ip,
                node_ip,
                node_name: k8s_compliant_hostname(&node_name),
                provider_id,
                supports_cloud_controller_manager: ccm_supported,
                cloud_controller_manager_name: self.ccm.name.to_string(),
                autoscaling_node_groups,
            })
            .context("Initializing cluster failed")?;

        let kubeconfig = self.cluster.get_kubeconfig()?;
        StoreWrapper::new(&*self.store())
            .put_kubernetes_config(&kubeconfig)
            .await?;

        if self.metadata.supported() {
            if let Err(e) = self.metadata.signal_role(Role::Coordinator).await {
                info!(error = %e, "Unable to update role in cloud provider metadata");
            }
        }
        Ok(kubeconfig)
    }

    /// Join an existing Kubernetes cluster as `role`.
    pub async fn join_cluster(&self, args: &JoinArgs, cert_key: &str, role: Role) -> Result<()> {
        info!("Joining Kubernetes cluster");
        let vpn_ip = self
            .vpn
            .get_interface_ip()
            .context("Retrieving VPN IP failed")?;
        let mut node_name = vpn_ip.clone();
        let mut node_ip = vpn_ip.clone();
        let mut provider_id = String::new();

        if self.metadata.supported() {
            let instance = self
                .metadata
                .self_instance()
                .await
                .context("Retrieving own instance metadata failed")?;
            node_name = instance.name;
            provider_id = instance.provider_id;
            if !instance.vpc_ip.is_empty() {
                node_ip = instance.vpc_ip;
            }
        }
        let ccm_supported = self.ccm.supported && self.metadata.supported();
        if ccm_supported {
            self.prepare_for_ccm(&vpn_ip)
                .await
                .context("Preparing node for cloud-controller-manager failed")?;
        }

        self.cluster
            .join_cluster(&JoinClusterInput {
                args: args.clone(),
                node_name: k8s_compliant_hostname(&node_name),
                node_ip,
                node_vpn_ip: vpn_ip,
                provider_id,
                cert_key: cert_key.to_string(),
                ccm_supported,
                role,
            })
            .context("Joining Kubernetes cluster failed")?;
        info!(role = %role, "Joined Kubernetes cluster");

        if self.metadata.supported() {
            if let Err(e) = self.metadata.signal_role(role).await {
                info!(error = %e, "Unable to update role in cloud provider metadata");
            }
        }
        Ok(())
    }

    pub fn node_state_path(&self) -> &Path {
        &self.node_state_path
    }
}
