//! Rejoining the VPN after a reboot, and keeping a worker's peers current.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use constel_core::Error;
use constel_core::constants::{COORDINATOR_PORT, RETRIEVE_INITIAL_PEERS_BACKOFF};
use constel_core::instance::Peer;
use constel_core::naming::join_host_port;
use constel_core::role::Role;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::JoinArgs;
use crate::core::Core;
use crate::storewrapper::StoreWrapper;

/// What a node asks of a coordinator's VPN-API.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Peers of the coordinator at `endpoint`, or `None` if `resource_version` is current.
    async fn get_vpn_peers(
        &self,
        endpoint: &str,
        resource_version: u64,
    ) -> Result<(u64, Option<Vec<Peer>>)>;

    async fn heartbeat(&self, endpoint: &str) -> Result<()>;

    /// Fresh `kubeadm join` arguments from the coordinator at `endpoint`.
    async fn get_k8s_join_args(&self, endpoint: &str) -> Result<JoinArgs>;
}

#[derive(Debug, Clone)]
pub struct ReinitOptions {
    pub api_port: u16,
    /// Pause between rounds over all coordinator endpoints.
    pub backoff: Duration,
    /// Seed for shuffling candidate endpoints.
    pub seed: u64,
}

impl Default for ReinitOptions {
    fn default() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            api_port: COORDINATOR_PORT,
            backoff: RETRIEVE_INITIAL_PEERS_BACKOFF,
            seed,
        }
    }
}

/// The coordinator that answered and the peer version it returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPeers {
    pub endpoint: String,
    pub resource_version: u64,
    pub peers: Vec<Peer>,
}

/// Ask coordinators for the peer list until one answers. Rounds are separated by
/// `options.backoff`; the loop ends only on success or when the future is dropped.
pub async fn retrieve_initial_peers(
    core: &Core,
    source: &dyn PeerSource,
    own_endpoint: Option<&str>,
    options: &ReinitOptions,
) -> InitialPeers {
    let mut rng = StdRng::seed_from_u64(options.seed);
    loop {
        match core.metadata().coordinator_endpoints(options.api_port).await {
            Ok(mut endpoints) => {
                endpoints.retain(|e| Some(e.as_str()) != own_endpoint);
                endpoints.shuffle(&mut rng);
                for endpoint in endpoints {
                    match source.get_vpn_peers(&endpoint, 0).await {
                        Ok((resource_version, peers)) => {
                            info!(endpoint = %endpoint, resource_version, "Retrieved initial VPN peers");
                            return InitialPeers {
                                endpoint,
                                resource_version,
                                peers: peers.unwrap_or_default(),
                            };
                        }
                        Err(e) => {
                            warn!(endpoint = %endpoint, error = %e, "Failed to retrieve VPN peers")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list coordinator endpoints"),
        }
        info!(
            backoff_secs = options.backoff.as_secs(),
            "No coordinator answered, retrying"
        );
        tokio::time::sleep(options.backoff).await;
    }
}

async fn own_endpoint(core: &Core, port: u16) -> Option<String> {
    let instance = core.metadata().self_instance().await.ok()?;
    (!instance.vpc_ip.is_empty()).then(|| join_host_port(&instance.vpc_ip, &port.to_string()))
}

/// Mark the core failed if `result` is an error.
pub(crate) async fn fail_on_error<T>(core: &Core, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        core.mark_failed(e).await;
    }
    result
}

/// Rejoin as coordinator: restore the VPN, start the VPN-API through `start_api`
/// (given the VPN IP), move to the persistent store and re-attach the KMS.
/// Any failure moves the core to `Failed`.
pub async fn reinitialize_as_coordinator<F>(
    core: &Core,
    source: &dyn PeerSource,
    options: &ReinitOptions,
    start_api: F,
) -> Result<InitialPeers>
where
    F: FnOnce(&str) -> Result<()>,
{
    let vpn_ip = fail_on_error(core, restore_vpn_ip(core)).await?;
    let own = own_endpoint(core, options.api_port).await;
    let initial = retrieve_initial_peers(core, source, own.as_deref(), options).await;
    fail_on_error(core, core.update_peers(&initial.peers)).await?;

    let attached = async {
        start_api(&vpn_ip).context("Failed to start VPN API")?;
        core.switch_to_persistent_store().await?;
        let info = core
            .get_kms_info()
            .await
            .context("Failed to read persisted KMS settings")?;
        core.set_up_kms(&info.storage_uri, &info.kms_uri, &info.kek_id, true)
            .await
    }
    .await;
    fail_on_error(core, attached).await?;
    info!(vpn_ip = %vpn_ip, "Rejoined as coordinator");
    Ok(initial)
}

/// Rejoin as worker: restore the VPN and hand the answering coordinator to
/// `start_refresh`, which runs the periodic peer refresh.
pub async fn reinitialize_as_node<F>(
    core: &Core,
    source: &dyn PeerSource,
    options: &ReinitOptions,
    start_refresh: F,
) -> Result<InitialPeers>
where
    F: FnOnce(&InitialPeers),
{
    let vpn_ip = fail_on_error(core, restore_vpn_ip(core)).await?;
    let initial = retrieve_initial_peers(core, source, None, options).await;
    fail_on_error(core, core.update_peers(&initial.peers)).await?;
    start_refresh(&initial);
    info!(vpn_ip = %vpn_ip, "Rejoined as worker");
    Ok(initial)
}

fn restore_vpn_ip(core: &Core) -> Result<String> {
    let node_state = core.node_state()?;
    core.set_vpn_ip(&node_state.vpn_ip)?;
    Ok(node_state.vpn_ip)
}

/// Rejoin according to the persisted role.
pub async fn reinitialize<A, R>(
    core: &Core,
    source: &dyn PeerSource,
    options: &ReinitOptions,
    start_api: A,
    start_refresh: R,
) -> Result<InitialPeers>
where
    A: FnOnce(&str) -> Result<()>,
    R: FnOnce(&InitialPeers),
{
    let role = fail_on_error(core, core.node_state()).await?.role;
    match role {
        Role::Coordinator => reinitialize_as_coordinator(core, source, options, start_api).await,
        Role::Node => reinitialize_as_node(core, source, options, start_refresh).await,
        other => {
            let err = Error::StateInvariant(format!("cannot rejoin with role {}", other)).into();
            core.mark_failed(&err).await;
            Err(err)
        }
    }
}

/// One refresh round: fetch peers newer than `resource_version`, converge the
/// datapath and mirror them into the local store, then send a heartbeat.
/// Returns the coordinator's current version.
pub async fn refresh_peers(
    core: &Core,
    source: &dyn PeerSource,
    endpoint: &str,
    resource_version: u64,
) -> Result<u64> {
    let (version, peers) = source
        .get_vpn_peers(endpoint, resource_version)
        .await
        .with_context(|| format!("Failed to get VPN peers from {}", endpoint))?;

    if let Some(peers) = peers {
        core.update_peers(&peers)?;
        let store = core.store();
        let tx = store.begin_transaction().await?;
        let updated = StoreWrapper::new(&*tx).update_peers(&peers).await;
        match updated {
            Ok((added, removed)) => {
                tx.commit().await?;
                info!(
                    resource_version = version,
                    added = added.len(),
                    removed = removed.len(),
                    "Updated peers"
                );
            }
            Err(e) => {
                tx.rollback().await;
                return Err(e);
            }
        }
    }

    if let Err(e) = source.heartbeat(endpoint).await {
        warn!(endpoint, error = %e, "Heartbeat failed");
    }
    Ok(version)
}

/// Refresh peers every `interval` until `shutdown` fires.
pub async fn run_peer_refresh(
    core: Arc<Core>,
    source: Arc<dyn PeerSource>,
    endpoint: String,
    mut resource_version: u64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match refresh_peers(&core, source.as_ref(), &endpoint, resource_version).await {
                    Ok(version) => resource_version = version,
                    Err(e) => warn!(endpoint = %endpoint, error = %format!("{:#}", e), "Peer refresh failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("Peer refresh stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::core::tests::{fixture_with, peer};
    use crate::store::{MemoryStore, Store, StoreFactory};
    use crate::storewrapper::KmsInfo;
    use crate::tpm::FakeTpm;
    use constel_cloud::Provider;
    use constel_cloud::fake::FakeMetadata;
    use constel_core::fs::MemFs;
    use constel_core::instance::Instance;
    use constel_core::nodestate::NodeState;
    use constel_core::state::CoreState;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    /// Answers from a fixed script and records the endpoints asked.
    #[derive(Default)]
    pub(crate) struct ScriptedPeerSource {
        answers: Mutex<VecDeque<Result<(u64, Option<Vec<Peer>>), String>>>,
        pub(crate) asked: Mutex<Vec<(String, u64)>>,
        pub(crate) heartbeats: Mutex<Vec<String>>,
        pub(crate) join_args_asked: Mutex<Vec<String>>,
    }

    impl ScriptedPeerSource {
        pub(crate) fn new(answers: Vec<Result<(u64, Option<Vec<Peer>>), String>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PeerSource for ScriptedPeerSource {
        async fn get_vpn_peers(
            &self,
            endpoint: &str,
            resource_version: u64,
        ) -> Result<(u64, Option<Vec<Peer>>)> {
            self.asked
                .lock()
                .unwrap()
                .push((endpoint.to_string(), resource_version));
            match self.answers.lock().unwrap().pop_front() {
                Some(Ok(answer)) => Ok(answer),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Err(anyhow::anyhow!("script exhausted")),
            }
        }

        async fn heartbeat(&self, endpoint: &str) -> Result<()> {
            self.heartbeats.lock().unwrap().push(endpoint.to_string());
            Ok(())
        }

        async fn get_k8s_join_args(&self, endpoint: &str) -> Result<JoinArgs> {
            self.join_args_asked
                .lock()
                .unwrap()
                .push(endpoint.to_string());
            crate::cluster::ClusterFake::new().get_join_token(Duration::from_secs(60))
        }
    }

    fn instance(name: &str, role: Role, ip: &str) -> Instance {
        Instance {
            name: name.to_string(),
            provider_id: format!("fake://{}", name),
            role,
            vpc_ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn options() -> ReinitOptions {
        ReinitOptions {
            api_port: 9000,
            backoff: Duration::ZERO,
            seed: 7,
        }
    }

    fn activated_fs(role: Role, vpn_ip: &str) -> MemFs {
        let fs = MemFs::new();
        NodeState {
            role,
            vpn_ip: vpn_ip.to_string(),
            vpn_priv_key: vec![3; 32],
            owner_id: b"owner".to_vec(),
            cluster_id: b"cluster".to_vec(),
        }
        .to_path(&fs, Path::new(constel_core::constants::NODE_STATE_PATH))
        .unwrap();
        fs
    }

    #[tokio::test]
    async fn test_initial_peer_retry() {
        let me = instance("worker-0", Role::Node, "192.0.2.10");
        let metadata = FakeMetadata::new(me.clone()).with_instances(vec![
            me,
            instance("cp-0", Role::Coordinator, "192.0.2.1"),
        ]);
        let f = fixture_with(
            Provider::Fake(metadata),
            FakeTpm::initialized(b"owner", b"cluster"),
            activated_fs(Role::Node, "10.118.0.2"),
        )
        .await;
        assert!(f.core.initialize().await.unwrap());
        assert_eq!(f.core.state().await, CoreState::IsNode);

        let peer1 = peer("10.118.0.1", 1);
        let source = ScriptedPeerSource::new(vec![
            Err("connection refused".to_string()),
            Ok((4, Some(vec![peer1.clone()]))),
        ]);
        let mut refresh_from = None;
        let initial = reinitialize(
            &f.core,
            &source,
            &options(),
            |_| panic!("a worker does not serve the VPN API"),
            |initial| refresh_from = Some(initial.clone()),
        )
        .await
        .unwrap();

        assert_eq!(f.vpn.peers(), vec![peer1]);
        assert_eq!(f.vpn.interface_ip(), "10.118.0.2");
        assert_eq!(initial.resource_version, 4);
        assert_eq!(refresh_from, Some(initial));
        assert_eq!(
            *source.asked.lock().unwrap(),
            vec![
                ("192.0.2.1:9000".to_string(), 0),
                ("192.0.2.1:9000".to_string(), 0)
            ]
        );
    }

    struct Persistent(MemoryStore);

    #[async_trait]
    impl StoreFactory for Persistent {
        async fn create(&self) -> Result<Arc<dyn Store>> {
            Ok(Arc::new(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_reinitialize_as_coordinator() {
        let me = instance("cp-0", Role::Coordinator, "192.0.2.1");
        let metadata = FakeMetadata::new(me.clone()).with_instances(vec![
            me,
            instance("cp-1", Role::Coordinator, "192.0.2.2"),
        ]);
        let persistent = MemoryStore::new();
        {
            let data = StoreWrapper::new(&persistent);
            data.put_master_secret(b"master").await.unwrap();
            data.put_kek_id("kek").await.unwrap();
            data.put_kms_data(&KmsInfo {
                kms_uri: "kms://cluster-kms".to_string(),
                storage_uri: "storage://no-store".to_string(),
                kek_id: "kek".to_string(),
            })
            .await
            .unwrap();
        }

        let fs = Arc::new(activated_fs(Role::Coordinator, "10.118.0.1"));
        let vpn = Arc::new(crate::vpn::FakeVpn::new());
        let core = Core::new(
            vpn.clone(),
            Arc::new(crate::cluster::ClusterFake::new()),
            Arc::new(Provider::Fake(metadata)),
            FakeTpm::initialized(b"owner", b"cluster").opener(),
            fs,
            Some(Arc::new(Persistent(persistent))),
        )
        .await
        .unwrap();
        assert!(core.initialize().await.unwrap());

        let source = ScriptedPeerSource::new(vec![Ok((2, Some(vec![peer("10.118.0.2", 2)])))]);
        let mut api_ip = String::new();
        reinitialize(
            &core,
            &source,
            &options(),
            |ip| {
                api_ip = ip.to_string();
                Ok(())
            },
            |_| panic!("a coordinator does not run the worker refresh"),
        )
        .await
        .unwrap();

        assert_eq!(api_ip, "10.118.0.1");
        assert_eq!(source.asked.lock().unwrap()[0].0, "192.0.2.2:9000");
        assert_eq!(vpn.peers().len(), 1);
        assert_eq!(core.get_data_key("disk", 16).await.unwrap().len(), 16);
        assert_eq!(core.state().await, CoreState::ActivatingNodes);
    }

    #[tokio::test]
    async fn test_reinitialize_failure_marks_failed() {
        let me = instance("cp-0", Role::Coordinator, "192.0.2.1");
        let metadata = FakeMetadata::new(me.clone())
            .with_instances(vec![me, instance("cp-1", Role::Coordinator, "192.0.2.2")]);
        let f = fixture_with(
            Provider::Fake(metadata),
            FakeTpm::initialized(b"owner", b"cluster"),
            activated_fs(Role::Coordinator, "10.118.0.1"),
        )
        .await;
        assert!(f.core.initialize().await.unwrap());

        let source = ScriptedPeerSource::new(vec![Ok((1, Some(vec![])))]);
        let result = reinitialize(
            &f.core,
            &source,
            &options(),
            |_| anyhow::bail!("port in use"),
            |_| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(f.core.state().await, CoreState::Failed);
    }

    #[tokio::test]
    async fn test_refresh_peers_mirrors_store() {
        let f = fixture_with(
            Provider::Unsupported,
            FakeTpm::new(),
            MemFs::new(),
        )
        .await;
        let p1 = peer("10.118.0.1", 1);
        let p2 = peer("10.118.0.3", 3);
        let source = ScriptedPeerSource::new(vec![
            Ok((5, Some(vec![p1.clone(), p2.clone()]))),
            Ok((5, None)),
        ]);

        let version = refresh_peers(&f.core, &source, "192.0.2.1:9000", 0).await.unwrap();
        assert_eq!(version, 5);
        assert_eq!(f.vpn.peers(), vec![p1.clone(), p2.clone()]);
        let store = f.core.store();
        let data = StoreWrapper::new(&*store);
        assert_eq!(data.get_peers().await.unwrap(), vec![p1.clone(), p2.clone()]);
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 2);

        assert_eq!(
            refresh_peers(&f.core, &source, "192.0.2.1:9000", 5).await.unwrap(),
            5
        );
        assert_eq!(source.heartbeats.lock().unwrap().len(), 2);
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refresh_peers_bumps_local_version_on_change() {
        let f = fixture_with(Provider::Unsupported, FakeTpm::new(), MemFs::new()).await;
        let p1 = peer("10.118.0.1", 1);
        let p3 = peer("10.118.0.3", 3);
        let source = ScriptedPeerSource::new(vec![
            Ok((5, Some(vec![p1.clone(), p3.clone()]))),
            Ok((6, Some(vec![p1.clone(), p3]))),
            Ok((7, Some(vec![p1]))),
        ]);
        let store = f.core.store();
        let data = StoreWrapper::new(&*store);

        refresh_peers(&f.core, &source, "192.0.2.1:9000", 0).await.unwrap();
        let after_first = data.get_peers_resource_version().await.unwrap();
        refresh_peers(&f.core, &source, "192.0.2.1:9000", 5).await.unwrap();
        assert_eq!(data.get_peers_resource_version().await.unwrap(), after_first);
        refresh_peers(&f.core, &source, "192.0.2.1:9000", 6).await.unwrap();
        assert_eq!(data.get_peers_resource_version().await.unwrap(), after_first + 1);
        assert_eq!(data.get_peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_peer_refresh_stops_on_shutdown() {
        let f = fixture_with(Provider::Unsupported, FakeTpm::new(), MemFs::new()).await;
        let source: Arc<dyn PeerSource> = Arc::new(ScriptedPeerSource::new(vec![]));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_peer_refresh(
            Arc::new(f.core),
            source,
            "192.0.2.1:9000".to_string(),
            0,
            Duration::from_millis(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
