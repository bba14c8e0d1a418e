//! Azure metadata: IMDS for the local instance, ARM REST for everything else.
//!
//! Nodes are either scale-set VMs, whose role follows from the scale-set
//! name, or single VMs, whose role is carried in the `constellation-role` tag.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use constel_core::Error;
use constel_core::constants::{ROLE_METADATA_KEY, UID_METADATA_KEY};
use constel_core::instance::Instance;
use constel_core::role::{Role, extract_role};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::http::{HttpClient, Page, Pager, TokenCache};
use crate::provider::captures;

pub const IMDS_URL: &str = "http://169.254.169.254";
pub const ARM_URL: &str = "https://management.azure.com";

const IMDS_API_VERSION: &str = "2021-02-01";
const TOKEN_API_VERSION: &str = "2018-02-01";
const COMPUTE_API_VERSION: &str = "2021-11-01";
const NETWORK_API_VERSION: &str = "2021-05-01";
// Scale-set NICs are served through Microsoft.Compute with an older network API.
const SCALE_SET_NIC_API_VERSION: &str = "2018-10-01";
const TAGS_API_VERSION: &str = "2021-04-01";
const ARM_RESOURCE: &str = "https://management.azure.com/";

/// Port of the Kubernetes API behind the load balancer.
pub const API_SERVER_PORT: u16 = 6443;

const VM_PROVIDER_ID: &str = r"^azure:///subscriptions/([^/]+)/resourceGroups/([^/]+)/providers/Microsoft.Compute/virtualMachines/([^/]+)$";
const SCALE_SET_VM_PROVIDER_ID: &str = r"^azure:///subscriptions/([^/]+)/resourceGroups/([^/]+)/providers/Microsoft.Compute/virtualMachineScaleSets/([^/]+)/virtualMachines/([^/]+)$";
const COORDINATOR_SCALE_SET: &str = r"constellation-scale-set-coordinators-[A-Za-z0-9]+$";
const NODE_SCALE_SET: &str = r"constellation-scale-set-nodes-[A-Za-z0-9]+$";
const PUBLIC_IP_ID: &str = r"/subscriptions/[^/]+/resourceGroups/[^/]+/providers/Microsoft.Network/publicIPAddresses/(?P<IPname>[^/]+)";
const KEY_PATH: &str = r"^/home/([^/]+)/\.ssh/authorized_keys$";

/// A VM resource addressed by an Azure provider ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AzureResource {
    Vm {
        subscription: String,
        resource_group: String,
        name: String,
    },
    ScaleSetVm {
        subscription: String,
        resource_group: String,
        scale_set: String,
        instance_id: String,
    },
}

impl AzureResource {
    /// Parse a provider ID, trying the single-VM shape first.
    pub fn parse(provider_id: &str) -> Result<Self> {
        if let Some(c) = captures(VM_PROVIDER_ID, provider_id)? {
            return Ok(AzureResource::Vm {
                subscription: c[0].clone(),
                resource_group: c[1].clone(),
                name: c[2].clone(),
            });
        }
        if let Some(c) = captures(SCALE_SET_VM_PROVIDER_ID, provider_id)? {
            return Ok(AzureResource::ScaleSetVm {
                subscription: c[0].clone(),
                resource_group: c[1].clone(),
                scale_set: c[2].clone(),
                instance_id: c[3].clone(),
            });
        }
        Err(Error::Configuration(format!("invalid azure provider ID: {}", provider_id)).into())
    }

    pub fn subscription(&self) -> &str {
        match self {
            AzureResource::Vm { subscription, .. } | AzureResource::ScaleSetVm { subscription, .. } => {
                subscription
            }
        }
    }

    pub fn resource_group(&self) -> &str {
        match self {
            AzureResource::Vm { resource_group, .. }
            | AzureResource::ScaleSetVm { resource_group, .. } => resource_group,
        }
    }

    /// ARM resource path, starting with `/subscriptions/`.
    pub fn path(&self) -> String {
        match self {
            AzureResource::Vm {
                subscription,
                resource_group,
                name,
            } => format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}",
                subscription, resource_group, name
            ),
            AzureResource::ScaleSetVm {
                subscription,
                resource_group,
                scale_set,
                instance_id,
            } => format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}/virtualMachines/{}",
                subscription, resource_group, scale_set, instance_id
            ),
        }
    }

    pub fn provider_id(&self) -> String {
        format!("azure://{}", self.path())
    }
}

/// Role of a scale-set VM, derived from the scale-set name.
pub fn scale_set_role(scale_set: &str) -> Role {
    let matches = |pattern| captures(pattern, scale_set).ok().flatten().is_some();
    if matches(COORDINATOR_SCALE_SET) {
        Role::Coordinator
    } else if matches(NODE_SCALE_SET) {
        Role::Node
    } else {
        Role::Unknown
    }
}

#[derive(Debug, Deserialize)]
struct ImdsInstance {
    compute: ImdsCompute,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImdsCompute {
    resource_id: String,
    #[serde(default)]
    tags_list: Vec<ImdsTag>,
}

#[derive(Debug, Deserialize)]
struct ImdsTag {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct AzureList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

impl<T: serde::de::DeserializeOwned> Page for AzureList<T> {
    type Item = T;

    fn into_parts(self, _current: &Url) -> (Vec<T>, Option<Url>) {
        let next = self.next_link.and_then(|link| Url::parse(&link).ok());
        (self.value, next)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ArmVm {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    os_profile: Option<OsProfile>,
    network_profile: Option<NetworkProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OsProfile {
    computer_name: Option<String>,
    linux_configuration: Option<LinuxConfiguration>,
}

#[derive(Debug, Deserialize)]
struct LinuxConfiguration {
    ssh: Option<SshConfiguration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshConfiguration {
    #[serde(default)]
    public_keys: Vec<SshPublicKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SshPublicKey {
    path: Option<String>,
    key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkProfile {
    #[serde(default)]
    network_interfaces: Vec<SubResource>,
}

#[derive(Debug, Deserialize)]
struct SubResource {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ArmNic {
    properties: NicProperties,
}

#[derive(Debug, Deserialize)]
struct NicProperties {
    #[serde(rename = "ipConfigurations", default)]
    ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Deserialize)]
struct IpConfiguration {
    properties: IpConfigurationProperties,
}

#[derive(Debug, Deserialize)]
struct IpConfigurationProperties {
    #[serde(rename = "privateIPAddress")]
    private_ip_address: Option<String>,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct ArmScaleSet {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ArmLoadBalancer {
    properties: Option<LoadBalancerProperties>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerProperties {
    #[serde(rename = "frontendIPConfigurations", default)]
    frontend_ip_configurations: Vec<FrontendIpConfiguration>,
}

#[derive(Debug, Deserialize)]
struct FrontendIpConfiguration {
    properties: Option<FrontendIpProperties>,
}

#[derive(Debug, Deserialize)]
struct FrontendIpProperties {
    #[serde(rename = "publicIPAddress")]
    public_ip_address: Option<SubResource>,
}

#[derive(Debug, Deserialize)]
struct ArmPublicIp {
    properties: PublicIpProperties,
}

#[derive(Debug, Deserialize)]
struct PublicIpProperties {
    #[serde(rename = "ipAddress")]
    ip_address: Option<String>,
}

/// SSH keys by username, from `publicKeys[]` entries under `/home/<user>/.ssh/authorized_keys`.
fn extract_ssh_keys(os_profile: Option<&OsProfile>) -> BTreeMap<String, Vec<String>> {
    let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let public_keys = os_profile
        .and_then(|p| p.linux_configuration.as_ref())
        .and_then(|l| l.ssh.as_ref())
        .map(|s| s.public_keys.as_slice())
        .unwrap_or_default();
    for key in public_keys {
        let (Some(path), Some(data)) = (&key.path, &key.key_data) else {
            continue;
        };
        if let Ok(Some(c)) = captures(KEY_PATH, path) {
            keys.entry(c[0].clone()).or_default().push(data.clone());
        }
    }
    keys
}

fn private_ip(nic: &ArmNic) -> Option<String> {
    let configs = &nic.properties.ip_configurations;
    configs
        .iter()
        .find(|c| c.properties.primary)
        .or_else(|| configs.first())
        .and_then(|c| c.properties.private_ip_address.clone())
}

pub struct AzureMetadata {
    http: HttpClient,
    imds_url: String,
    arm_url: String,
    tokens: TokenCache,
}

impl AzureMetadata {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_endpoints(IMDS_URL, ARM_URL, timeout)
    }

    /// Use custom IMDS and ARM base URLs.
    pub fn with_endpoints(imds_url: &str, arm_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(timeout)?,
            imds_url: imds_url.trim_end_matches('/').to_string(),
            arm_url: arm_url.trim_end_matches('/').to_string(),
            tokens: TokenCache::default(),
        })
    }

    async fn imds(&self) -> Result<ImdsInstance> {
        let url = format!(
            "{}/metadata/instance?api-version={}&format=json",
            self.imds_url, IMDS_API_VERSION
        );
        self.http
            .clone()
            .with_header("metadata", "True")?
            .get_json(&url)
            .await
            .context("Failed to query Azure IMDS")
    }

    async fn arm(&self) -> Result<HttpClient> {
        let url = Url::parse_with_params(
            &format!("{}/metadata/identity/oauth2/token", self.imds_url),
            &[("api-version", TOKEN_API_VERSION), ("resource", ARM_RESOURCE)],
        )
        .context("Invalid IMDS URL")?;
        let imds = self.http.clone().with_header("metadata", "True")?;
        let token = self.tokens.get(&imds, url.as_str()).await?;
        self.http.with_bearer(&token)
    }

    fn arm_url(&self, path: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.arm_url, path, api_version)
    }

    pub async fn provider_id(&self) -> Result<String> {
        Ok(format!("azure://{}", self.imds().await?.compute.resource_id))
    }

    pub async fn self_instance(&self) -> Result<Instance> {
        let provider_id = self.provider_id().await?;
        self.get_instance(&provider_id).await
    }

    pub async fn get_instance(&self, provider_id: &str) -> Result<Instance> {
        let resource = AzureResource::parse(provider_id)?;
        let arm = self.arm().await?;
        let vm: ArmVm = arm
            .get_json(&self.arm_url(&resource.path(), COMPUTE_API_VERSION))
            .await
            .with_context(|| format!("Failed to retrieve instance {}", provider_id))?;
        self.to_instance(&arm, &resource, vm).await
    }

    async fn to_instance(&self, arm: &HttpClient, resource: &AzureResource, vm: ArmVm) -> Result<Instance> {
        let (name, role) = match resource {
            AzureResource::Vm { .. } => (vm.name.clone(), extract_role(&vm.tags)),
            AzureResource::ScaleSetVm { scale_set, .. } => {
                let computer_name = vm
                    .properties
                    .os_profile
                    .as_ref()
                    .and_then(|p| p.computer_name.clone())
                    .unwrap_or_else(|| vm.name.clone());
                (computer_name, scale_set_role(scale_set))
            }
        };
        Ok(Instance {
            name,
            provider_id: resource.provider_id(),
            role,
            vpc_ip: self.vpc_ip(arm, resource, &vm).await?.unwrap_or_default(),
            public_ip: None,
            alias_ip_ranges: Vec::new(),
            secondary_ip_range: String::new(),
            ssh_keys: extract_ssh_keys(vm.properties.os_profile.as_ref()),
        })
    }

    async fn vpc_ip(&self, arm: &HttpClient, resource: &AzureResource, vm: &ArmVm) -> Result<Option<String>> {
        match resource {
            AzureResource::Vm { .. } => {
                let Some(nic_ref) = vm
                    .properties
                    .network_profile
                    .as_ref()
                    .and_then(|p| p.network_interfaces.first())
                else {
                    return Ok(None);
                };
                let nic: ArmNic = arm
                    .get_json(&self.arm_url(&nic_ref.id, NETWORK_API_VERSION))
                    .await
                    .context("Failed to retrieve network interface")?;
                Ok(private_ip(&nic))
            }
            AzureResource::ScaleSetVm { .. } => {
                let url = self.arm_url(
                    &format!("{}/networkInterfaces", resource.path()),
                    SCALE_SET_NIC_API_VERSION,
                );
                let nics: AzureList<ArmNic> = arm
                    .get_json(&url)
                    .await
                    .context("Failed to retrieve scale set network interfaces")?;
                Ok(nics.value.first().and_then(private_ip))
            }
        }
    }

    /// All scale-set VMs in the resource group, plus single VMs tagged with this cluster's UID.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let imds = self.imds().await?;
        let own = AzureResource::parse(&format!("azure://{}", imds.compute.resource_id))?;
        let uid = tag(&imds.compute.tags_list, UID_METADATA_KEY);
        let arm = self.arm().await?;
        let group = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute",
            own.subscription(),
            own.resource_group()
        );
        let mut instances = Vec::new();

        let scale_sets: Vec<ArmScaleSet> = Pager::<AzureList<ArmScaleSet>>::new(
            arm.clone(),
            self.parse_url(&self.arm_url(&format!("{}/virtualMachineScaleSets", group), COMPUTE_API_VERSION))?,
        )
        .collect()
        .await
        .context("Failed to list scale sets")?;
        for scale_set in scale_sets {
            let url = self.parse_url(&self.arm_url(
                &format!("{}/virtualMachineScaleSets/{}/virtualMachines", group, scale_set.name),
                COMPUTE_API_VERSION,
            ))?;
            let mut vms = Pager::<AzureList<ArmVm>>::new(arm.clone(), url);
            while let Some(vm) = vms.next().await.context("Failed to list scale set VMs")? {
                let resource = AzureResource::parse(&format!("azure://{}", vm.id))?;
                instances.push(self.to_instance(&arm, &resource, vm).await?);
            }
        }

        if let Some(uid) = uid {
            let url = self.parse_url(&self.arm_url(&format!("{}/virtualMachines", group), COMPUTE_API_VERSION))?;
            let mut vms = Pager::<AzureList<ArmVm>>::new(arm.clone(), url);
            while let Some(vm) = vms.next().await.context("Failed to list VMs")? {
                if vm.tags.get(UID_METADATA_KEY) != Some(&uid) {
                    continue;
                }
                let resource = AzureResource::parse(&format!("azure://{}", vm.id))?;
                instances.push(self.to_instance(&arm, &resource, vm).await?);
            }
        }
        Ok(instances)
    }

    fn parse_url(&self, url: &str) -> Result<Url> {
        Url::parse(url).with_context(|| format!("Invalid URL {}", url))
    }

    /// Public IP of the first load balancer frontend in the resource group.
    pub async fn get_load_balancer_endpoint(&self) -> Result<String> {
        let own = AzureResource::parse(&self.provider_id().await?)?;
        let arm = self.arm().await?;
        let network = format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network",
            own.subscription(),
            own.resource_group()
        );
        let mut balancers = Pager::<AzureList<ArmLoadBalancer>>::new(
            arm.clone(),
            self.parse_url(&self.arm_url(&format!("{}/loadBalancers", network), NETWORK_API_VERSION))?,
        );
        let mut properties = None;
        while let Some(lb) = balancers.next().await.context("Failed to list load balancers")? {
            if lb.properties.is_some() {
                properties = lb.properties;
                break;
            }
        }
        let properties = properties
            .ok_or_else(|| Error::NotFound("could not get any load balancer".to_string()))?;

        let ip_id = properties
            .frontend_ip_configurations
            .iter()
            .filter_map(|f| f.properties.as_ref())
            .find_map(|p| p.public_ip_address.as_ref().map(|ip| ip.id.clone()))
            .ok_or_else(|| {
                Error::NotFound("could not find public IP address reference in load balancer".to_string())
            })?;
        let ip_name = captures(PUBLIC_IP_ID, &ip_id)?
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                Error::Configuration(format!("could not find public IP address name in {}", ip_id))
            })?;

        let public_ip: ArmPublicIp = arm
            .get_json(&self.arm_url(
                &format!("{}/publicIPAddresses/{}", network, ip_name),
                NETWORK_API_VERSION,
            ))
            .await
            .context("Failed to retrieve public IP address")?;
        let address = public_ip.properties.ip_address.ok_or_else(|| {
            Error::NotFound("load balancer public IP has no address yet".to_string())
        })?;
        Ok(format!("{}:{}", address, API_SERVER_PORT))
    }

    /// The `constellation-uid` tag of this instance.
    pub async fn uid(&self) -> Result<String> {
        let imds = self.imds().await?;
        tag(&imds.compute.tags_list, UID_METADATA_KEY).ok_or_else(|| {
            Error::Configuration(format!("instance has no {} tag", UID_METADATA_KEY)).into()
        })
    }

    /// Tag single VMs with their role. Scale-set VMs carry it in the set name.
    pub async fn signal_role(&self, role: Role) -> Result<()> {
        let resource = AzureResource::parse(&self.provider_id().await?)?;
        if let AzureResource::ScaleSetVm { scale_set, .. } = &resource {
            debug!(scale_set = %scale_set, "Role is implied by scale set, not tagging");
            return Ok(());
        }
        let arm = self.arm().await?;
        let url = self.arm_url(
            &format!("{}/providers/Microsoft.Resources/tags/default", resource.path()),
            TAGS_API_VERSION,
        );
        let tags = BTreeMap::from([(ROLE_METADATA_KEY, role.to_string())]);
        let body = json!({
            "operation": "Merge",
            "properties": { "tags": tags },
        });
        arm.send_json(Method::PATCH, &url, &body)
            .await
            .context("Failed to tag instance with role")
    }
}

fn tag(tags: &[ImdsTag], name: &str) -> Option<String> {
    tags.iter().find(|t| t.name == name).map(|t| t.value.clone())
}
