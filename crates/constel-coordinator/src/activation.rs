//! One-shot activation of a fresh node, as first coordinator or as worker.
//!
//! The first coordinator bootstraps the cluster and then activates the worker
//! nodes it was given through the [`NodeActivator`] port. Any failure after the
//! TPM mark moves the core to `Failed`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use constel_core::Error;
use constel_core::constants::COORDINATOR_VPN_IP;
use constel_core::instance::{Peer, bytes_b64};
use constel_core::naming::join_host_port;
use constel_core::role::Role;
use constel_core::state::CoreState;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::Core;
use crate::reinit::{PeerSource, fail_on_error};
use crate::storewrapper::StoreWrapper;

/// Everything the first coordinator needs to bootstrap the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorActivation {
    #[serde(with = "bytes_b64")]
    pub master_secret: Vec<u8>,
    pub kms_uri: String,
    pub storage_uri: String,
    pub kek_id: String,
    #[serde(default)]
    pub use_existing_kek: bool,
    #[serde(default)]
    pub autoscaling_node_groups: Vec<String>,
    /// Public IPs of the worker nodes to activate right away.
    #[serde(default)]
    pub node_public_ips: Vec<String>,
    /// WireGuard public key of the administrator's machine.
    #[serde(with = "bytes_b64")]
    pub admin_vpn_pub_key: Vec<u8>,
}

/// Handed back to the administrator once the coordinator is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    pub admin_vpn_ip: String,
    #[serde(with = "bytes_b64")]
    pub coordinator_vpn_pub_key: Vec<u8>,
    #[serde(with = "bytes_b64")]
    pub kubeconfig: Vec<u8>,
    #[serde(with = "bytes_b64")]
    pub owner_id: Vec<u8>,
    #[serde(with = "bytes_b64")]
    pub cluster_id: Vec<u8>,
}

/// Sent by a coordinator to a fresh worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeActivation {
    pub node_vpn_ip: String,
    pub peers: Vec<Peer>,
    #[serde(with = "bytes_b64")]
    pub owner_id: Vec<u8>,
    #[serde(with = "bytes_b64")]
    pub cluster_id: Vec<u8>,
}

/// How a coordinator reaches fresh worker nodes.
#[async_trait]
pub trait NodeActivator: Send + Sync {
    /// Activate the node at `endpoint`. Returns the node's VPN public key.
    async fn activate_node(&self, endpoint: &str, activation: &NodeActivation) -> Result<Vec<u8>>;

    /// Have the activated node at `endpoint` join Kubernetes through the
    /// coordinator at `coordinator_vpn_ip`.
    async fn join_cluster(&self, endpoint: &str, coordinator_vpn_ip: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationOptions {
    /// Port of the activation API on every node.
    pub activation_port: u16,
}

async fn require_state(core: &Core, required: CoreState) -> Result<()> {
    let state = core.state().await;
    if state != required {
        bail!(Error::StateInvariant(format!(
            "node is {}, activation requires {}",
            state, required
        )));
    }
    Ok(())
}

/// Bootstrap the cluster on this node and activate the listed workers.
///
/// `public_ip` is the address this node was reached at. `start_api` is given
/// the coordinator VPN IP once the VPN is up and must start the VPN-API.
pub async fn activate_as_coordinator<F>(
    core: &Core,
    activator: &dyn NodeActivator,
    request: &CoordinatorActivation,
    public_ip: &str,
    options: &ActivationOptions,
    start_api: F,
) -> Result<AdminConfig>
where
    F: FnOnce(&str) -> Result<()>,
{
    require_state(core, CoreState::AcceptingInit).await?;
    if request.master_secret.is_empty() {
        bail!(Error::Configuration("empty master secret".to_string()));
    }
    if request.admin_vpn_pub_key.is_empty() {
        bail!(Error::Configuration("empty admin VPN public key".to_string()));
    }

    let (owner_id, cluster_id) = fail_on_error(core, core.get_ids(Some(&request.master_secret)).await).await?;
    fail_on_error(
        core,
        core.advance_state(CoreState::ActivatingNodes, &owner_id, &cluster_id).await,
    )
    .await?;

    let bootstrapped = async {
        core.set_up_kms(
            &request.storage_uri,
            &request.kms_uri,
            &request.kek_id,
            request.use_existing_kek,
        )
        .await?;

        let vpn_ip = COORDINATOR_VPN_IP.to_string();
        core.set_vpn_ip(&vpn_ip).context("Failed to set coordinator VPN IP")?;
        let coordinator_pub_key = core.get_vpn_pub_key()?;
        core.add_peer(&Peer {
            public_endpoint: join_host_port(public_ip, &options.activation_port.to_string()),
            vpn_ip: vpn_ip.clone(),
            vpn_pub_key: coordinator_pub_key.clone(),
            role: Role::Coordinator,
        })
        .await?;

        let kubeconfig = core
            .init_cluster(request.autoscaling_node_groups.clone())
            .await?;
        start_api(&vpn_ip).context("Failed to start VPN API")?;
        core.switch_to_persistent_store().await?;

        activate_nodes(core, activator, &request.node_public_ips, options).await?;
        core.persist_node_state(Role::Coordinator, &owner_id, &cluster_id)
            .await?;

        let admin_vpn_ip = core.get_next_node_ip().await?;
        core.add_peer(&Peer {
            public_endpoint: String::new(),
            vpn_ip: admin_vpn_ip.clone(),
            vpn_pub_key: request.admin_vpn_pub_key.clone(),
            role: Role::Admin,
        })
        .await?;

        anyhow::Ok(AdminConfig {
            admin_vpn_ip,
            coordinator_vpn_pub_key: coordinator_pub_key,
            kubeconfig,
            owner_id: owner_id.clone(),
            cluster_id: cluster_id.clone(),
        })
    }
    .await;
    let config = fail_on_error(core, bootstrapped).await?;
    info!(
        admin_vpn_ip = %config.admin_vpn_ip,
        nodes = request.node_public_ips.len(),
        "Activated as coordinator"
    );
    Ok(config)
}

/// Activate more workers on a running coordinator. Failures leave the
/// coordinator's state alone.
pub async fn activate_additional_nodes(
    core: &Core,
    activator: &dyn NodeActivator,
    node_public_ips: &[String],
    options: &ActivationOptions,
) -> Result<()> {
    require_state(core, CoreState::ActivatingNodes).await?;
    activate_nodes(core, activator, node_public_ips, options).await
}

async fn activate_nodes(
    core: &Core,
    activator: &dyn NodeActivator,
    node_public_ips: &[String],
    options: &ActivationOptions,
) -> Result<()> {
    let (_, peers) = core.get_peers(0).await?;
    let peers = peers.unwrap_or_default();
    let (owner_id, cluster_id) = core.get_ids(None).await?;
    let coordinator_vpn_ip = core
        .get_vpn_ip()
        .context("Failed to retrieve coordinator VPN IP")?;

    for public_ip in node_public_ips {
        let endpoint = join_host_port(public_ip, &options.activation_port.to_string());
        let node_vpn_ip = core.get_next_node_ip().await?;
        let activation = NodeActivation {
            node_vpn_ip: node_vpn_ip.clone(),
            peers: peers.clone(),
            owner_id: owner_id.clone(),
            cluster_id: cluster_id.clone(),
        };
        let pub_key = match activator.activate_node(&endpoint, &activation).await {
            Ok(pub_key) => pub_key,
            Err(e) => {
                if let Err(release) = core.release_node_ip(&node_vpn_ip).await {
                    warn!(vpn_ip = %node_vpn_ip, error = %release, "Failed to return unused VPN IP");
                }
                return Err(e.context(format!("Failed to activate node {}", endpoint)));
            }
        };
        core.add_peer(&Peer {
            public_endpoint: endpoint.clone(),
            vpn_ip: node_vpn_ip.clone(),
            vpn_pub_key: pub_key,
            role: Role::Node,
        })
        .await?;
        activator
            .join_cluster(&endpoint, &coordinator_vpn_ip)
            .await
            .with_context(|| format!("Node {} failed to join the cluster", endpoint))?;
        info!(endpoint = %endpoint, vpn_ip = %node_vpn_ip, "Activated node");
    }
    Ok(())
}

/// Take this fresh node into the VPN as a worker. Returns its VPN public key.
pub async fn activate_as_node(core: &Core, activation: &NodeActivation) -> Result<Vec<u8>> {
    require_state(core, CoreState::AcceptingInit).await?;
    if activation.owner_id.is_empty() || activation.cluster_id.is_empty() {
        bail!(Error::Configuration(
            "owner ID and cluster ID must not be empty".to_string()
        ));
    }
    core.advance_state(CoreState::IsNode, &activation.owner_id, &activation.cluster_id)
        .await?;

    let activated = async {
        core.set_vpn_ip(&activation.node_vpn_ip)
            .context("Failed to set node VPN IP")?;
        core.update_peers(&activation.peers)?;
        let store = core.store();
        let tx = store.begin_transaction().await?;
        let mirrored = StoreWrapper::new(&*tx).update_peers(&activation.peers).await;
        match mirrored {
            Ok(_) => tx.commit().await?,
            Err(e) => {
                tx.rollback().await;
                return Err(e);
            }
        }
        core.persist_node_state(Role::Node, &activation.owner_id, &activation.cluster_id)
            .await?;
        core.get_vpn_pub_key()
    }
    .await;
    let pub_key = fail_on_error(core, activated).await?;
    info!(vpn_ip = %activation.node_vpn_ip, peers = activation.peers.len(), "Activated as node");
    Ok(pub_key)
}

/// Join Kubernetes with arguments fetched from the coordinator's VPN-API at
/// `coordinator_endpoint`.
pub async fn join_cluster_as_node(
    core: &Core,
    source: &dyn PeerSource,
    coordinator_endpoint: &str,
) -> Result<()> {
    require_state(core, CoreState::IsNode).await?;
    let joined = async {
        let args = source
            .get_k8s_join_args(coordinator_endpoint)
            .await
            .with_context(|| format!("Failed to get join arguments from {}", coordinator_endpoint))?;
        core.join_cluster(&args, "", Role::Node).await
    }
    .await;
    fail_on_error(core, joined).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::tests::{fixture, fixture_with};
    use crate::reinit::tests::ScriptedPeerSource;
    use crate::tpm::{FakeTpm, Tpm};
    use constel_cloud::Provider;
    use constel_core::fs::MemFs;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Activates in-process worker cores, keyed by endpoint.
    #[derive(Default)]
    pub(crate) struct InProcessActivator {
        pub(crate) nodes: HashMap<String, Arc<Core>>,
        pub(crate) joins: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NodeActivator for InProcessActivator {
        async fn activate_node(&self, endpoint: &str, activation: &NodeActivation) -> Result<Vec<u8>> {
            let node = self
                .nodes
                .get(endpoint)
                .ok_or_else(|| anyhow::anyhow!("no node at {}", endpoint))?;
            activate_as_node(node, activation).await
        }

        async fn join_cluster(&self, endpoint: &str, coordinator_vpn_ip: &str) -> Result<()> {
            self.joins
                .lock()
                .unwrap()
                .push((endpoint.to_string(), coordinator_vpn_ip.to_string()));
            Ok(())
        }
    }

    pub(crate) fn options() -> ActivationOptions {
        ActivationOptions {
            activation_port: 9001,
        }
    }

    pub(crate) fn coordinator_request(node_public_ips: &[&str]) -> CoordinatorActivation {
        CoordinatorActivation {
            master_secret: b"master".to_vec(),
            kms_uri: "kms://cluster-kms".to_string(),
            storage_uri: "storage://no-store".to_string(),
            kek_id: "kek".to_string(),
            use_existing_kek: false,
            autoscaling_node_groups: Vec::new(),
            node_public_ips: node_public_ips.iter().map(|ip| ip.to_string()).collect(),
            admin_vpn_pub_key: vec![9; 32],
        }
    }

    #[tokio::test]
    async fn test_activate_as_coordinator_with_nodes() {
        let coordinator = fixture().await;
        let worker = fixture().await;
        let worker_core = Arc::new(worker.core);
        let activator = InProcessActivator {
            nodes: HashMap::from([("192.0.2.20:9001".to_string(), Arc::clone(&worker_core))]),
            ..Default::default()
        };

        let mut api_ip = String::new();
        let config = activate_as_coordinator(
            &coordinator.core,
            &activator,
            &coordinator_request(&["192.0.2.20"]),
            "192.0.2.1",
            &options(),
            |ip| {
                api_ip = ip.to_string();
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(api_ip, "10.118.0.1");
        assert_eq!(coordinator.core.state().await, CoreState::ActivatingNodes);
        assert!(coordinator.tpm.is_node_initialized().unwrap());
        assert_eq!(coordinator.vpn.interface_ip(), "10.118.0.1");
        assert_eq!(coordinator.cluster.inits().len(), 1);
        assert_eq!(config.kubeconfig, b"kubeconfig");
        assert_eq!(config.admin_vpn_ip, "10.118.0.3");
        assert_eq!(
            config.coordinator_vpn_pub_key,
            coordinator.core.get_vpn_pub_key().unwrap()
        );
        assert_eq!(
            config.owner_id,
            crate::core::derive_owner_id(b"master").unwrap()
        );
        assert_eq!(
            coordinator.core.node_state().unwrap().role,
            Role::Coordinator
        );
        assert_eq!(coordinator.core.get_data_key("disk", 32).await.unwrap().len(), 32);

        let (_, peers) = coordinator.core.get_peers(0).await.unwrap();
        let roles: Vec<(String, Role)> = peers
            .unwrap()
            .into_iter()
            .map(|p| (p.vpn_ip, p.role))
            .collect();
        assert_eq!(
            roles,
            vec![
                ("10.118.0.1".to_string(), Role::Coordinator),
                ("10.118.0.2".to_string(), Role::Node),
                ("10.118.0.3".to_string(), Role::Admin),
            ]
        );

        assert_eq!(worker_core.state().await, CoreState::IsNode);
        assert_eq!(worker.vpn.interface_ip(), "10.118.0.2");
        assert!(worker.tpm.is_node_initialized().unwrap());
        assert_eq!(worker.vpn.peers().len(), 1);
        assert_eq!(worker.vpn.peers()[0].vpn_ip, "10.118.0.1");
        let worker_state = worker_core.node_state().unwrap();
        assert_eq!(worker_state.role, Role::Node);
        assert_eq!(worker_state.owner_id, config.owner_id);
        assert_eq!(worker_state.cluster_id, config.cluster_id);
        assert_eq!(
            *activator.joins.lock().unwrap(),
            vec![("192.0.2.20:9001".to_string(), "10.118.0.1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_activate_as_coordinator_rejects_bad_input() {
        let f = fixture().await;
        let activator = InProcessActivator::default();
        let mut request = coordinator_request(&[]);
        request.master_secret.clear();
        let err = activate_as_coordinator(&f.core, &activator, &request, "192.0.2.1", &options(), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(
            constel_core::error::find(&err),
            Some(Error::Configuration(_))
        ));
        assert_eq!(f.core.state().await, CoreState::AcceptingInit);
        assert!(!f.tpm.is_node_initialized().unwrap());
    }

    #[tokio::test]
    async fn test_activate_as_coordinator_failure_marks_failed() {
        let f = fixture().await;
        let activator = InProcessActivator::default();
        let result = activate_as_coordinator(
            &f.core,
            &activator,
            &coordinator_request(&["192.0.2.20"]),
            "192.0.2.1",
            &options(),
            |_| Ok(()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(f.core.state().await, CoreState::Failed);
        assert!(f.core.node_state().is_err());
    }

    #[tokio::test]
    async fn test_activate_twice_rejected() {
        let f = fixture().await;
        let activator = InProcessActivator::default();
        activate_as_coordinator(&f.core, &activator, &coordinator_request(&[]), "192.0.2.1", &options(), |_| Ok(()))
            .await
            .unwrap();
        let err = activate_as_coordinator(&f.core, &activator, &coordinator_request(&[]), "192.0.2.1", &options(), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(
            constel_core::error::find(&err),
            Some(Error::StateInvariant(_))
        ));
        assert_eq!(f.core.state().await, CoreState::ActivatingNodes);
    }

    #[tokio::test]
    async fn test_activate_additional_nodes() {
        let coordinator = fixture().await;
        let activator = InProcessActivator::default();
        assert!(
            activate_additional_nodes(&coordinator.core, &activator, &[], &options())
                .await
                .is_err()
        );
        activate_as_coordinator(&coordinator.core, &activator, &coordinator_request(&[]), "192.0.2.1", &options(), |_| Ok(()))
            .await
            .unwrap();

        let worker = fixture().await;
        let activator = InProcessActivator {
            nodes: HashMap::from([("192.0.2.30:9001".to_string(), Arc::new(worker.core))]),
            ..Default::default()
        };
        activate_additional_nodes(
            &coordinator.core,
            &activator,
            &["192.0.2.30".to_string()],
            &options(),
        )
        .await
        .unwrap();
        assert_eq!(worker.vpn.interface_ip(), "10.118.0.3");
        // The coordinator and the admin are both known to the new node.
        assert_eq!(worker.vpn.peers().len(), 2);

        // An unreachable node returns its IP to the pool and keeps the coordinator up.
        let err = activate_additional_nodes(
            &coordinator.core,
            &activator,
            &["192.0.2.99".to_string()],
            &options(),
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("192.0.2.99:9001"));
        assert_eq!(coordinator.core.state().await, CoreState::ActivatingNodes);
        assert_eq!(coordinator.core.get_next_node_ip().await.unwrap(), "10.118.0.4");
    }

    #[tokio::test]
    async fn test_activate_as_node_requires_ids() {
        let f = fixture().await;
        let activation = NodeActivation {
            node_vpn_ip: "10.118.0.2".to_string(),
            peers: Vec::new(),
            owner_id: Vec::new(),
            cluster_id: b"cluster".to_vec(),
        };
        assert!(activate_as_node(&f.core, &activation).await.is_err());
        assert_eq!(f.core.state().await, CoreState::AcceptingInit);
    }

    #[tokio::test]
    async fn test_activate_as_node_tpm_failure() {
        let f = fixture_with(Provider::Unsupported, FakeTpm::new().failing(), MemFs::new()).await;
        let activation = NodeActivation {
            node_vpn_ip: "10.118.0.2".to_string(),
            peers: Vec::new(),
            owner_id: b"owner".to_vec(),
            cluster_id: b"cluster".to_vec(),
        };
        assert!(activate_as_node(&f.core, &activation).await.is_err());
        assert_eq!(f.core.state().await, CoreState::AcceptingInit);
        assert!(f.core.node_state().is_err());
        assert_eq!(f.vpn.interface_ip(), "");
    }

    #[tokio::test]
    async fn test_join_cluster_as_node() {
        let f = fixture().await;
        let source = ScriptedPeerSource::new(vec![]);
        assert!(
            join_cluster_as_node(&f.core, &source, "10.118.0.1:9000")
                .await
                .is_err()
        );

        activate_as_node(
            &f.core,
            &NodeActivation {
                node_vpn_ip: "10.118.0.2".to_string(),
                peers: Vec::new(),
                owner_id: b"owner".to_vec(),
                cluster_id: b"cluster".to_vec(),
            },
        )
        .await
        .unwrap();
        join_cluster_as_node(&f.core, &source, "10.118.0.1:9000")
            .await
            .unwrap();
        let joins = f.cluster.joins();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].role, Role::Node);
        assert_eq!(joins[0].node_vpn_ip, "10.118.0.2");
        assert_eq!(joins[0].args.token, "kube-fake-token");
        assert_eq!(
            *source.join_args_asked.lock().unwrap(),
            vec!["10.118.0.1:9000".to_string()]
        );
    }
}
