//! GCP metadata: the instance metadata server plus the compute REST API.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use constel_core::Error;
use constel_core::constants::{
    CLOUD_CACHE_TTL, ROLE_METADATA_KEY, UID_METADATA_KEY, USE_METADATA_KEY, VPN_IP_METADATA_KEY,
};
use constel_core::instance::Instance;
use constel_core::role::{Role, extract_role};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::http::{HttpClient, Page, Pager, TokenCache, with_page_token};
use crate::provider::captures;

pub const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
pub const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";

const SSH_KEYS_METADATA_KEY: &str = "ssh-keys";
const DEFAULT_INTERFACE: &str = "nic0";
const PROVIDER_ID: &str = r"^gce://([^/]+)/([^/]+)/([^/]+)$";
const REGION: &str = r"^([a-z]*-[a-z]*[0-9])";

/// `gce://<project>/<zone>/<instance>`
pub fn join_provider_id(project: &str, zone: &str, instance: &str) -> String {
    format!("gce://{}/{}/{}", project, zone, instance)
}

/// Split a provider ID into `(project, zone, instance)`.
pub fn split_provider_id(provider_id: &str) -> Result<(String, String, String)> {
    match captures(PROVIDER_ID, provider_id)? {
        Some(c) => Ok((c[0].clone(), c[1].clone(), c[2].clone())),
        None => {
            Err(Error::Configuration(format!("invalid gce provider ID: {}", provider_id)).into())
        }
    }
}

/// Region of a zone: `europe-west3-b` is in `europe-west3`.
pub fn zone_to_region(zone: &str) -> Result<String> {
    captures(REGION, zone)?
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| Error::Configuration(format!("invalid zone: {}", zone)).into())
}

/// SSH keys from an `ssh-keys` metadata value, one `user:algo key [comment]` per line.
/// Anything after the key itself is dropped.
pub fn parse_ssh_keys(raw: &str) -> BTreeMap<String, Vec<String>> {
    let mut keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in raw.lines() {
        let Some((user, rest)) = line.split_once(':') else {
            continue;
        };
        let mut parts = rest.splitn(3, ' ');
        let (Some(algo), Some(key)) = (parts.next(), parts.next()) else {
            continue;
        };
        keys.entry(user.to_string())
            .or_default()
            .push(format!("{} {}", algo, key));
    }
    keys
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceInstance {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    metadata: GceMetadata,
    #[serde(default)]
    network_interfaces: Vec<GceNic>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct GceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct MetadataItem {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceNic {
    #[serde(default)]
    name: String,
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
    subnetwork: Option<String>,
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
    #[serde(default)]
    alias_ip_ranges: Vec<IpRange>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpRange {
    ip_cidr_range: String,
}

#[derive(Debug, Deserialize)]
struct GceRegion {
    #[serde(default)]
    zones: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GceSubnetwork {
    #[serde(default)]
    secondary_ip_ranges: Vec<IpRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardingRule {
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
    port_range: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GceList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl<T: serde::de::DeserializeOwned> Page for GceList<T> {
    type Item = T;

    fn into_parts(self, current: &Url) -> (Vec<T>, Option<Url>) {
        let next = self
            .next_page_token
            .filter(|t| !t.is_empty())
            .map(|token| with_page_token(current, &token));
        (self.items, next)
    }
}

impl GceInstance {
    /// Labels overlaid with metadata items. Metadata wins.
    fn merged_metadata(&self) -> BTreeMap<String, String> {
        let mut merged = self.labels.clone();
        for item in &self.metadata.items {
            if let Some(value) = &item.value {
                merged.insert(item.key.clone(), value.clone());
            }
        }
        merged
    }

    fn default_interface(&self) -> Option<&GceNic> {
        self.network_interfaces
            .iter()
            .find(|n| n.name == DEFAULT_INTERFACE)
    }

    fn into_instance(self, project: &str, zone: &str) -> Instance {
        let merged = self.merged_metadata();
        let nic0 = self.default_interface();
        let vpc_ip = nic0.and_then(|n| n.network_ip.clone()).unwrap_or_default();
        let public_ip = nic0
            .and_then(|n| n.access_configs.first())
            .and_then(|a| a.nat_ip.clone());
        let alias_ip_ranges = self
            .network_interfaces
            .iter()
            .flat_map(|n| n.alias_ip_ranges.iter().map(|r| r.ip_cidr_range.clone()))
            .collect();
        Instance {
            provider_id: join_provider_id(project, zone, &self.name),
            role: extract_role(&merged),
            vpc_ip,
            public_ip,
            alias_ip_ranges,
            secondary_ip_range: String::new(),
            ssh_keys: merged
                .get(SSH_KEYS_METADATA_KEY)
                .map(|raw| parse_ssh_keys(raw))
                .unwrap_or_default(),
            name: self.name,
        }
    }
}

struct ZoneCache {
    region: String,
    zones: Vec<String>,
    fetched: Instant,
}

pub struct GcpMetadata {
    http: HttpClient,
    metadata_url: String,
    compute_url: String,
    tokens: TokenCache,
    zones: Mutex<Option<ZoneCache>>,
    cache_ttl: Duration,
}

impl GcpMetadata {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_endpoints(METADATA_URL, COMPUTE_URL, timeout)
    }

    /// Use custom metadata server and compute API base URLs.
    pub fn with_endpoints(metadata_url: &str, compute_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(timeout)?,
            metadata_url: metadata_url.trim_end_matches('/').to_string(),
            compute_url: compute_url.trim_end_matches('/').to_string(),
            tokens: TokenCache::default(),
            zones: Mutex::new(None),
            cache_ttl: CLOUD_CACHE_TTL,
        })
    }

    fn metadata_client(&self) -> Result<HttpClient> {
        self.http.clone().with_header("metadata-flavor", "Google")
    }

    async fn metadata_value(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.metadata_url, path);
        let value = self
            .metadata_client()?
            .get_text(&url)
            .await
            .with_context(|| format!("Failed to query GCP metadata {}", path))?;
        Ok(value.trim().to_string())
    }

    pub async fn project_id(&self) -> Result<String> {
        self.metadata_value("project/project-id").await
    }

    /// Zone name. The server reports `projects/<num>/zones/<zone>`.
    pub async fn zone(&self) -> Result<String> {
        let raw = self.metadata_value("instance/zone").await?;
        Ok(raw.rsplit('/').next().unwrap_or_default().to_string())
    }

    pub async fn instance_name(&self) -> Result<String> {
        self.metadata_value("instance/name").await
    }

    pub async fn instance_attribute(&self, key: &str) -> Result<String> {
        self.metadata_value(&format!("instance/attributes/{}", key))
            .await
    }

    async fn compute(&self) -> Result<HttpClient> {
        let url = format!("{}/instance/service-accounts/default/token", self.metadata_url);
        let token = self.tokens.get(&self.metadata_client()?, &url).await?;
        self.http.with_bearer(&token)
    }

    fn compute_url(&self, path: &str) -> String {
        format!("{}{}", self.compute_url, path)
    }

    async fn get_compute_instance(
        &self,
        compute: &HttpClient,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<GceInstance> {
        compute
            .get_json(&self.compute_url(&format!(
                "/projects/{}/zones/{}/instances/{}",
                project, zone, name
            )))
            .await
            .with_context(|| format!("Failed to retrieve instance {}", name))
    }

    pub async fn self_instance(&self) -> Result<Instance> {
        let (project, zone, name) = (
            self.project_id().await?,
            self.zone().await?,
            self.instance_name().await?,
        );
        let compute = self.compute().await?;
        let gce = self
            .get_compute_instance(&compute, &project, &zone, &name)
            .await?;
        let subnetwork = gce.default_interface().and_then(|n| n.subnetwork.clone());
        let mut instance = gce.into_instance(&project, &zone);
        if let Some(subnetwork) = subnetwork {
            instance.secondary_ip_range = self
                .secondary_ip_range(&compute, &subnetwork)
                .await?
                .unwrap_or_default();
        }
        Ok(instance)
    }

    /// First secondary range of a subnetwork given by its self-link.
    async fn secondary_ip_range(&self, compute: &HttpClient, self_link: &str) -> Result<Option<String>> {
        let path = self_link
            .find("/projects/")
            .map(|idx| &self_link[idx..])
            .ok_or_else(|| Error::Configuration(format!("invalid subnetwork link: {}", self_link)))?;
        let subnetwork: GceSubnetwork = compute
            .get_json(&self.compute_url(path))
            .await
            .context("Failed to retrieve subnetwork")?;
        Ok(subnetwork
            .secondary_ip_ranges
            .into_iter()
            .next()
            .map(|r| r.ip_cidr_range))
    }

    pub async fn get_instance(&self, provider_id: &str) -> Result<Instance> {
        let (project, zone, name) = split_provider_id(provider_id)?;
        let compute = self.compute().await?;
        Ok(self
            .get_compute_instance(&compute, &project, &zone, &name)
            .await?
            .into_instance(&project, &zone))
    }

    /// Region and zones of this instance, cached for a day.
    async fn region_zones(&self, compute: &HttpClient, project: &str) -> Result<(String, Vec<String>)> {
        let mut cache = self.zones.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched.elapsed() < self.cache_ttl {
                return Ok((cached.region.clone(), cached.zones.clone()));
            }
        }
        let region = zone_to_region(&self.zone().await?)?;
        let info: GceRegion = compute
            .get_json(&self.compute_url(&format!("/projects/{}/regions/{}", project, region)))
            .await
            .with_context(|| format!("Failed to retrieve region {}", region))?;
        let zones: Vec<String> = info
            .zones
            .iter()
            .filter_map(|z| z.rsplit('/').next())
            .map(str::to_string)
            .collect();
        debug!(region = %region, zones = zones.len(), "Cached region zones");
        *cache = Some(ZoneCache {
            region: region.clone(),
            zones: zones.clone(),
            fetched: Instant::now(),
        });
        Ok((region, zones))
    }

    /// Instances in every zone of the region carrying this cluster's UID.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let uid = self.uid().await?;
        let project = self.project_id().await?;
        let compute = self.compute().await?;
        let (_, zones) = self.region_zones(&compute, &project).await?;

        let mut instances = Vec::new();
        for zone in zones {
            let url = Url::parse_with_params(
                &self.compute_url(&format!("/projects/{}/zones/{}/instances", project, zone)),
                &[("filter", format!("labels.{}={}", UID_METADATA_KEY, uid))],
            )
            .context("Invalid compute URL")?;
            let mut pager = Pager::<GceList<GceInstance>>::new(compute.clone(), url);
            while let Some(gce) = pager
                .next()
                .await
                .with_context(|| format!("Failed to list instances in {}", zone))?
            {
                if gce.merged_metadata().get(UID_METADATA_KEY) != Some(&uid) {
                    continue;
                }
                instances.push(gce.into_instance(&project, &zone));
            }
        }
        Ok(instances)
    }

    pub async fn uid(&self) -> Result<String> {
        self.instance_attribute(UID_METADATA_KEY)
            .await
            .context("Failed to retrieve cluster uid")
    }

    /// Kubernetes API endpoint: global forwarding rules first, then regional ones.
    pub async fn get_load_balancer_endpoint(&self) -> Result<String> {
        let uid = self.uid().await?;
        let project = self.project_id().await?;
        let compute = self.compute().await?;
        let filter = format!(
            "(labels.{}:{}) AND (labels.{}:kubernetes)",
            UID_METADATA_KEY, uid, USE_METADATA_KEY
        );

        let global = self.compute_url(&format!("/projects/{}/global/forwardingRules", project));
        if let Some(endpoint) = self
            .find_forwarding_rule(&compute, &global, &filter, &uid)
            .await?
        {
            return Ok(endpoint);
        }

        let (region, _) = self.region_zones(&compute, &project).await?;
        let regional = self.compute_url(&format!(
            "/projects/{}/regions/{}/forwardingRules",
            project, region
        ));
        self.find_forwarding_rule(&compute, &regional, &filter, &uid)
            .await?
            .ok_or_else(|| {
                Error::NotFound("kubernetes load balancer forwarding rule".to_string()).into()
            })
    }

    async fn find_forwarding_rule(
        &self,
        compute: &HttpClient,
        base: &str,
        filter: &str,
        uid: &str,
    ) -> Result<Option<String>> {
        let url = Url::parse_with_params(base, &[("filter", filter)]).context("Invalid compute URL")?;
        let rules: Vec<ForwardingRule> = Pager::<GceList<ForwardingRule>>::new(compute.clone(), url)
            .collect()
            .await
            .context("Failed to list forwarding rules")?;
        let mut matching = rules.into_iter().filter(|r| {
            r.labels.get(UID_METADATA_KEY).map(String::as_str) == Some(uid)
                && r.labels.get(USE_METADATA_KEY).map(String::as_str) == Some("kubernetes")
        });
        let Some(rule) = matching.next() else {
            return Ok(None);
        };
        if matching.next().is_some() {
            return Err(Error::Configuration(
                "multiple kubernetes forwarding rules match this cluster".to_string(),
            )
            .into());
        }
        let ip = rule
            .ip_address
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::NotFound("forwarding rule has no IP address".to_string()))?;
        let port = rule
            .port_range
            .as_deref()
            .and_then(|range| range.split('-').next())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::NotFound("forwarding rule has no port range".to_string()))?;
        Ok(Some(format!("{}:{}", ip, port)))
    }

    pub async fn signal_role(&self, role: Role) -> Result<()> {
        self.set_instance_metadata(ROLE_METADATA_KEY, &role.to_string())
            .await
    }

    pub async fn set_vpn_ip(&self, vpn_ip: &str) -> Result<()> {
        self.set_instance_metadata(VPN_IP_METADATA_KEY, vpn_ip).await
    }

    /// Set one metadata key on this instance, keeping all others.
    async fn set_instance_metadata(&self, key: &str, value: &str) -> Result<()> {
        let (project, zone, name) = (
            self.project_id().await?,
            self.zone().await?,
            self.instance_name().await?,
        );
        let compute = self.compute().await?;
        let gce = self
            .get_compute_instance(&compute, &project, &zone, &name)
            .await?;

        let mut items: BTreeMap<String, Option<String>> = gce
            .metadata
            .items
            .into_iter()
            .map(|i| (i.key, i.value))
            .collect();
        items.insert(key.to_string(), Some(value.to_string()));
        let metadata = GceMetadata {
            fingerprint: gce.metadata.fingerprint,
            items: items
                .into_iter()
                .map(|(key, value)| MetadataItem { key, value })
                .collect(),
        };

        let url = self.compute_url(&format!(
            "/projects/{}/zones/{}/instances/{}/setMetadata",
            project, zone, name
        ));
        compute
            .send_json(Method::POST, &url, &metadata)
            .await
            .with_context(|| format!("Failed to set instance metadata {}", key))
    }
}
