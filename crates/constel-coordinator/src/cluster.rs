//! Kubernetes cluster port used when initializing or joining.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use constel_core::fs::FileSystem;
use constel_core::role::Role;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::shell::run;

/// Lifetime of bootstrap tokens handed to joining nodes.
pub const JOIN_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Bootstrap-token discovery data a node needs to join.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinArgs {
    pub api_server_endpoint: String,
    pub token: String,
    #[serde(default)]
    pub ca_cert_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitClusterInput {
    pub api_server_advertise_ip: String,
    pub node_ip: String,
    pub node_name: String,
    pub provider_id: String,
    pub supports_cloud_controller_manager: bool,
    pub cloud_controller_manager_name: String,
    pub autoscaling_node_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClusterInput {
    pub args: JoinArgs,
    pub node_name: String,
    pub node_ip: String,
    /// Passed separately so a joining control plane binds etcd to the overlay.
    pub node_vpn_ip: String,
    pub provider_id: String,
    pub cert_key: String,
    pub ccm_supported: bool,
    pub role: Role,
}

pub trait Cluster: Send + Sync {
    /// Bootstrap a new cluster with this node as the first control plane.
    fn init_cluster(&self, input: &InitClusterInput) -> Result<()>;
    fn join_cluster(&self, input: &JoinClusterInput) -> Result<()>;
    /// Admin kubeconfig. Only available after `init_cluster`.
    fn get_kubeconfig(&self) -> Result<Vec<u8>>;
    /// Key a control plane needs to join. Must run on a control plane.
    fn get_kubeadm_certificate_key(&self) -> Result<String>;
    fn get_join_token(&self, ttl: Duration) -> Result<JoinArgs>;
    fn start_kubelet(&self) -> Result<()>;
}

pub const ADMIN_CONF_PATH: &str = "/etc/kubernetes/admin.conf";
const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
const API_SERVER_PORT: u16 = 6443;

fn kubelet_args(node_ip: &str, provider_id: &str, ccm: bool) -> Value {
    let mut args = json!({ "node-ip": node_ip });
    if !provider_id.is_empty() {
        args["provider-id"] = json!(provider_id);
    }
    if ccm {
        args["cloud-provider"] = json!("external");
    }
    args
}

/// kubeadm documents for `kubeadm init`, as a YAML stream of JSON documents.
pub fn init_config(input: &InitClusterInput) -> String {
    let init = json!({
        "apiVersion": KUBEADM_API_VERSION,
        "kind": "InitConfiguration",
        "localAPIEndpoint": {
            "advertiseAddress": input.api_server_advertise_ip,
            "bindPort": API_SERVER_PORT,
        },
        "nodeRegistration": {
            "name": input.node_name,
            "kubeletExtraArgs": kubelet_args(
                &input.node_ip,
                &input.provider_id,
                input.supports_cloud_controller_manager,
            ),
        },
    });
    let cluster = json!({
        "apiVersion": KUBEADM_API_VERSION,
        "kind": "ClusterConfiguration",
        "controlPlaneEndpoint": format!("{}:{}", input.api_server_advertise_ip, API_SERVER_PORT),
    });
    format!("{}\n---\n{}\n", init, cluster)
}

/// kubeadm document for `kubeadm join`. Control planes advertise their VPN IP.
pub fn join_config(input: &JoinClusterInput) -> String {
    let mut join = json!({
        "apiVersion": KUBEADM_API_VERSION,
        "kind": "JoinConfiguration",
        "discovery": {
            "bootstrapToken": {
                "apiServerEndpoint": input.args.api_server_endpoint,
                "token": input.args.token,
                "caCertHashes": input.args.ca_cert_hashes,
            },
        },
        "nodeRegistration": {
            "name": input.node_name,
            "kubeletExtraArgs": kubelet_args(&input.node_ip, &input.provider_id, input.ccm_supported),
        },
    });
    if input.role == Role::Coordinator {
        join["controlPlane"] = json!({
            "localAPIEndpoint": {
                "advertiseAddress": input.node_vpn_ip,
                "bindPort": API_SERVER_PORT,
            },
            "certificateKey": input.cert_key,
        });
    }
    format!("{}\n", join)
}

/// Parse the output of `kubeadm token create --print-join-command`.
pub fn parse_join_command(output: &str) -> Result<JoinArgs> {
    let fields: Vec<&str> = output.split_whitespace().collect();
    let Some(pos) = fields.windows(2).position(|w| w == ["kubeadm", "join"]) else {
        bail!("Not a kubeadm join command: {}", output.trim());
    };
    let mut args = JoinArgs::default();
    let mut rest = fields[pos + 2..].iter();
    while let Some(field) = rest.next() {
        match *field {
            "--token" => args.token = rest.next().map(|s| s.to_string()).unwrap_or_default(),
            "--discovery-token-ca-cert-hash" => {
                if let Some(hash) = rest.next() {
                    args.ca_cert_hashes.push(hash.to_string());
                }
            }
            f if !f.starts_with("--") && args.api_server_endpoint.is_empty() => {
                args.api_server_endpoint = f.to_string();
            }
            _ => {}
        }
    }
    if args.api_server_endpoint.is_empty() || args.token.is_empty() {
        bail!("Incomplete kubeadm join command: {}", output.trim());
    }
    Ok(args)
}

fn kubeadm_with_config(subcommand: &str, config: &str, extra: &[&str]) -> Result<()> {
    let mut file = tempfile::NamedTempFile::new().context("Failed to create kubeadm config file")?;
    file.write_all(config.as_bytes())
        .context("Failed to write kubeadm config")?;
    let path = file.path().to_string_lossy().into_owned();
    let mut args = vec![subcommand, "--config", path.as_str()];
    args.extend_from_slice(extra);
    run("kubeadm", &args)?;
    Ok(())
}

/// Cluster driven through the `kubeadm` and `systemctl` tools.
pub struct KubeadmCluster {
    fs: Arc<dyn FileSystem>,
}

impl KubeadmCluster {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }
}

impl Cluster for KubeadmCluster {
    fn init_cluster(&self, input: &InitClusterInput) -> Result<()> {
        kubeadm_with_config("init", &init_config(input), &["--upload-certs"])
            .context("kubeadm init failed")?;
        info!(
            node = %input.node_name,
            autoscaling_node_groups = ?input.autoscaling_node_groups,
            "Initialized Kubernetes control plane"
        );
        Ok(())
    }

    fn join_cluster(&self, input: &JoinClusterInput) -> Result<()> {
        kubeadm_with_config("join", &join_config(input), &[]).context("kubeadm join failed")?;
        info!(node = %input.node_name, role = %input.role, "Joined Kubernetes cluster");
        Ok(())
    }

    fn get_kubeconfig(&self) -> Result<Vec<u8>> {
        self.fs
            .read(Path::new(ADMIN_CONF_PATH))
            .with_context(|| format!("Failed to read {}", ADMIN_CONF_PATH))
    }

    fn get_kubeadm_certificate_key(&self) -> Result<String> {
        let key = run("kubeadm", &["certs", "certificate-key"])?.trim().to_string();
        run(
            "kubeadm",
            &["init", "phase", "upload-certs", "--upload-certs", "--certificate-key", key.as_str()],
        )
        .context("Failed to upload control-plane certificates")?;
        Ok(key)
    }

    fn get_join_token(&self, ttl: Duration) -> Result<JoinArgs> {
        let ttl = format!("{}s", ttl.as_secs());
        let output = run(
            "kubeadm",
            &["token", "create", "--ttl", ttl.as_str(), "--print-join-command"],
        )?;
        parse_join_command(&output)
    }

    fn start_kubelet(&self) -> Result<()> {
        run("systemctl", &["enable", "--now", "kubelet"])?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClusterFakeCalls {
    inits: Vec<InitClusterInput>,
    joins: Vec<JoinClusterInput>,
}

/// Behaves like a cluster without touching Kubernetes.
#[derive(Debug, Default)]
pub struct ClusterFake {
    calls: Mutex<ClusterFakeCalls>,
}

impl ClusterFake {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, ClusterFakeCalls> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inits(&self) -> Vec<InitClusterInput> {
        self.calls().inits.clone()
    }

    pub fn joins(&self) -> Vec<JoinClusterInput> {
        self.calls().joins.clone()
    }
}

impl Cluster for ClusterFake {
    fn init_cluster(&self, input: &InitClusterInput) -> Result<()> {
        self.calls().inits.push(input.clone());
        Ok(())
    }

    fn join_cluster(&self, input: &JoinClusterInput) -> Result<()> {
        self.calls().joins.push(input.clone());
        Ok(())
    }

    fn get_kubeconfig(&self) -> Result<Vec<u8>> {
        Ok(b"kubeconfig".to_vec())
    }

    fn get_kubeadm_certificate_key(&self) -> Result<String> {
        Ok("controlPlaneCertficateKey".to_string())
    }

    fn get_join_token(&self, _ttl: Duration) -> Result<JoinArgs> {
        Ok(JoinArgs {
            api_server_endpoint: "0.0.0.0".to_string(),
            token: "kube-fake-token".to_string(),
            ca_cert_hashes: vec![
                "sha256:a60ebe9b0879090edd83b40a4df4bebb20506bac1e51d518ff8f4505a721930f"
                    .to_string(),
            ],
        })
    }

    fn start_kubelet(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_args_json() {
        let args = ClusterFake::new().get_join_token(JOIN_TOKEN_TTL).unwrap();
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["apiServerEndpoint"], "0.0.0.0");
        assert_eq!(json["token"], "kube-fake-token");
        assert_eq!(json["caCertHashes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_init_config() {
        let config = init_config(&InitClusterInput {
            api_server_advertise_ip: "10.118.0.1".to_string(),
            node_ip: "192.0.2.1".to_string(),
            node_name: "cp-0".to_string(),
            provider_id: "gce://p/z/cp-0".to_string(),
            supports_cloud_controller_manager: true,
            ..Default::default()
        });
        let docs: Vec<Value> = config
            .split("\n---\n")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "InitConfiguration");
        assert_eq!(docs[0]["nodeRegistration"]["name"], "cp-0");
        let kubelet = &docs[0]["nodeRegistration"]["kubeletExtraArgs"];
        assert_eq!(kubelet["node-ip"], "192.0.2.1");
        assert_eq!(kubelet["provider-id"], "gce://p/z/cp-0");
        assert_eq!(kubelet["cloud-provider"], "external");
        assert_eq!(docs[1]["controlPlaneEndpoint"], "10.118.0.1:6443");
    }

    #[test]
    fn test_join_config() {
        let mut input = JoinClusterInput {
            args: ClusterFake::new().get_join_token(JOIN_TOKEN_TTL).unwrap(),
            node_name: "worker-0".to_string(),
            node_ip: "192.0.2.3".to_string(),
            node_vpn_ip: "10.118.0.3".to_string(),
            provider_id: String::new(),
            cert_key: "key".to_string(),
            ccm_supported: false,
            role: Role::Node,
        };
        let doc: Value = serde_json::from_str(&join_config(&input)).unwrap();
        assert_eq!(doc["discovery"]["bootstrapToken"]["token"], "kube-fake-token");
        assert!(doc.get("controlPlane").is_none());
        let kubelet = &doc["nodeRegistration"]["kubeletExtraArgs"];
        assert!(kubelet.get("provider-id").is_none());
        assert!(kubelet.get("cloud-provider").is_none());

        input.role = Role::Coordinator;
        let doc: Value = serde_json::from_str(&join_config(&input)).unwrap();
        assert_eq!(doc["controlPlane"]["certificateKey"], "key");
        assert_eq!(
            doc["controlPlane"]["localAPIEndpoint"]["advertiseAddress"],
            "10.118.0.3"
        );
    }

    #[test]
    fn test_parse_join_command() {
        let out = "kubeadm join 192.0.2.1:6443 --token abcdef.0123456789abcdef \\\n\t--discovery-token-ca-cert-hash sha256:deadbeef \n";
        let args = parse_join_command(out).unwrap();
        assert_eq!(args.api_server_endpoint, "192.0.2.1:6443");
        assert_eq!(args.token, "abcdef.0123456789abcdef");
        assert_eq!(args.ca_cert_hashes, vec!["sha256:deadbeef".to_string()]);

        assert!(parse_join_command("kubeadm join --token x").is_err());
        assert!(parse_join_command("error: not authorized").is_err());
    }

    #[test]
    fn test_fake_records_calls() {
        let fake = ClusterFake::new();
        fake.init_cluster(&InitClusterInput {
            node_name: "cp-0".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(fake.inits()[0].node_name, "cp-0");
        assert!(fake.joins().is_empty());
        assert_eq!(fake.get_kubeconfig().unwrap(), b"kubeconfig");
    }
}
