//! The cloud metadata port: one closed set of providers behind a uniform surface.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use constel_core::Error;
use constel_core::instance::Instance;
use constel_core::naming::join_host_port;
use constel_core::role::Role;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::azure::{self, AzureMetadata};
use crate::fake::FakeMetadata;
use crate::gcp::{self, GcpMetadata};
use crate::qemu::{self, QemuMetadata};

/// Cloud a node runs on, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Azure,
    Gcp,
    Qemu,
    #[default]
    None,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
            ProviderKind::Qemu => "qemu",
            ProviderKind::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "azure" => Ok(ProviderKind::Azure),
            "gcp" => Ok(ProviderKind::Gcp),
            "qemu" => Ok(ProviderKind::Qemu),
            "none" => Ok(ProviderKind::None),
            other => Err(Error::Configuration(format!(
                "unknown cloud provider: {}",
                other
            ))),
        }
    }
}

/// Metadata access for the cloud this node runs on.
pub enum Provider {
    Azure(AzureMetadata),
    Gcp(GcpMetadata),
    Qemu(QemuMetadata),
    Fake(FakeMetadata),
    /// No metadata API. Lookups fail with [`Error::PlatformUnsupported`].
    Unsupported,
}

/// Base URLs of the metadata APIs. `None` keeps the provider's well-known address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataEndpoints {
    pub azure_imds: Option<String>,
    pub azure_arm: Option<String>,
    pub gcp_metadata: Option<String>,
    pub gcp_compute: Option<String>,
    pub qemu: Option<String>,
}

fn unsupported(op: &str) -> anyhow::Error {
    Error::PlatformUnsupported(format!("{} requires a cloud metadata API", op)).into()
}

impl Provider {
    /// Metadata client for `kind`. Every request is bounded by `timeout`.
    pub fn for_kind(kind: ProviderKind, endpoints: &MetadataEndpoints, timeout: Duration) -> Result<Self> {
        let provider = match kind {
            ProviderKind::Azure => Provider::Azure(AzureMetadata::with_endpoints(
                endpoints.azure_imds.as_deref().unwrap_or(azure::IMDS_URL),
                endpoints.azure_arm.as_deref().unwrap_or(azure::ARM_URL),
                timeout,
            )?),
            ProviderKind::Gcp => Provider::Gcp(GcpMetadata::with_endpoints(
                endpoints.gcp_metadata.as_deref().unwrap_or(gcp::METADATA_URL),
                endpoints.gcp_compute.as_deref().unwrap_or(gcp::COMPUTE_URL),
                timeout,
            )?),
            ProviderKind::Qemu => Provider::Qemu(QemuMetadata::with_endpoint(
                endpoints.qemu.as_deref().unwrap_or(qemu::METADATA_URL),
                timeout,
            )?),
            ProviderKind::None => Provider::Unsupported,
        };
        Ok(provider)
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Azure(_) => ProviderKind::Azure,
            Provider::Gcp(_) => ProviderKind::Gcp,
            Provider::Qemu(_) => ProviderKind::Qemu,
            Provider::Fake(_) | Provider::Unsupported => ProviderKind::None,
        }
    }

    /// All instances of this cluster.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        match self {
            Provider::Azure(m) => m.list().await,
            Provider::Gcp(m) => m.list().await,
            Provider::Qemu(m) => m.list().await,
            Provider::Fake(m) => m.list(),
            Provider::Unsupported => Err(unsupported("List")),
        }
    }

    /// The instance this process runs on.
    pub async fn self_instance(&self) -> Result<Instance> {
        match self {
            Provider::Azure(m) => m.self_instance().await,
            Provider::Gcp(m) => m.self_instance().await,
            Provider::Qemu(m) => m.self_instance().await,
            Provider::Fake(m) => m.self_instance(),
            Provider::Unsupported => Err(unsupported("Self")),
        }
    }

    pub async fn get_instance(&self, provider_id: &str) -> Result<Instance> {
        match self {
            Provider::Azure(m) => m.get_instance(provider_id).await,
            Provider::Gcp(m) => m.get_instance(provider_id).await,
            Provider::Qemu(m) => m.get_instance(provider_id).await,
            Provider::Fake(m) => m.get_instance(provider_id),
            Provider::Unsupported => Err(unsupported("GetInstance")),
        }
    }

    /// `host:port` of the Kubernetes API load balancer.
    pub async fn get_load_balancer_endpoint(&self) -> Result<String> {
        match self {
            Provider::Azure(m) => m.get_load_balancer_endpoint().await,
            Provider::Gcp(m) => m.get_load_balancer_endpoint().await,
            Provider::Qemu(m) => m.get_load_balancer_endpoint().await,
            Provider::Fake(m) => m.get_load_balancer_endpoint(),
            Provider::Unsupported => Err(unsupported("GetLoadBalancerEndpoint")),
        }
    }

    /// Cluster UID. Empty on QEMU.
    pub async fn uid(&self) -> Result<String> {
        match self {
            Provider::Azure(m) => m.uid().await,
            Provider::Gcp(m) => m.uid().await,
            Provider::Qemu(m) => Ok(m.uid()),
            Provider::Fake(m) => Ok(m.uid()),
            Provider::Unsupported => Err(unsupported("UID")),
        }
    }

    /// Publish this node's role where the platform supports it.
    pub async fn signal_role(&self, role: Role) -> Result<()> {
        match self {
            Provider::Azure(m) => m.signal_role(role).await,
            Provider::Gcp(m) => m.signal_role(role).await,
            Provider::Qemu(_) | Provider::Unsupported => Ok(()),
            Provider::Fake(m) => m.signal_role(role),
        }
    }

    /// Publish this node's VPN IP where the platform supports it.
    pub async fn set_vpn_ip(&self, vpn_ip: &str) -> Result<()> {
        match self {
            Provider::Azure(_) | Provider::Qemu(_) | Provider::Unsupported => Ok(()),
            Provider::Gcp(m) => m.set_vpn_ip(vpn_ip).await,
            Provider::Fake(m) => m.set_vpn_ip(vpn_ip),
        }
    }

    pub fn supported(&self) -> bool {
        match self {
            Provider::Fake(m) => m.supported(),
            Provider::Unsupported => false,
            _ => true,
        }
    }

    /// VPN-API endpoints (`vpcIP:port`) of all control-plane instances.
    pub async fn coordinator_endpoints(&self, port: u16) -> Result<Vec<String>> {
        let instances = self
            .list()
            .await
            .context("Failed to list instances")?;
        Ok(instances
            .into_iter()
            .filter(|i| i.role == Role::Coordinator && !i.vpc_ip.is_empty())
            .map(|i| join_host_port(&i.vpc_ip, &port.to_string()))
            .collect())
    }
}

/// Capture groups of `pattern` in `input`, or `None` if it does not match.
pub(crate) fn captures(pattern: &str, input: &str) -> Result<Option<Vec<String>>> {
    let re = Regex::new(pattern).with_context(|| format!("Invalid pattern {}", pattern))?;
    Ok(re.captures(input).map(|caps| {
        caps.iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_kind() {
        let endpoints = MetadataEndpoints {
            qemu: Some("http://127.0.0.1:1".to_string()),
            ..Default::default()
        };
        for kind in [
            ProviderKind::Azure,
            ProviderKind::Gcp,
            ProviderKind::Qemu,
            ProviderKind::None,
        ] {
            let provider = Provider::for_kind(kind, &endpoints, Duration::from_secs(1)).unwrap();
            assert_eq!(provider.kind(), kind);
        }
        assert!(!Provider::for_kind(ProviderKind::None, &endpoints, Duration::from_secs(1))
            .unwrap()
            .supported());
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

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("GCP".parse::<ProviderKind>().unwrap(), ProviderKind::Gcp);
        assert_eq!(ProviderKind::Azure.to_string(), "azure");
        assert!(matches!(
            "aws".parse::<ProviderKind>(),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_coordinator_endpoints() {
        let fake = FakeMetadata::new(instance("self", Role::Node, "192.0.2.5")).with_instances(vec![
            instance("cp-0", Role::Coordinator, "192.0.2.1"),
            instance("cp-1", Role::Coordinator, ""),
            instance("worker-0", Role::Node, "192.0.2.3"),
        ]);
        let provider = Provider::Fake(fake);
        assert_eq!(
            provider.coordinator_endpoints(9000).await.unwrap(),
            vec!["192.0.2.1:9000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        let provider = Provider::Unsupported;
        assert!(!provider.supported());
        let err = provider.self_instance().await.unwrap_err();
        assert!(matches!(
            constel_core::error::find(&err),
            Some(Error::PlatformUnsupported(_))
        ));
        provider.signal_role(Role::Coordinator).await.unwrap();
    }

    #[test]
    fn test_captures() {
        let caps = captures(r"^gce://([^/]+)/([^/]+)$", "gce://p/z").unwrap();
        assert_eq!(caps, Some(vec!["p".to_string(), "z".to_string()]));
        assert_eq!(captures(r"^x$", "y").unwrap(), None);
    }
}
