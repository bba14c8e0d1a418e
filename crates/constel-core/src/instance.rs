use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::naming::split_host_port;
use crate::role::Role;

/// A cluster member as seen through the cloud metadata port.
///
/// Instances are views materialized per request and are never cached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ProviderID")]
    pub provider_id: String,
    #[serde(rename = "Role", default)]
    pub role: Role,
    /// Primary private IP of the default interface. May be empty.
    #[serde(rename = "VPCIP", default)]
    pub vpc_ip: String,
    #[serde(rename = "PublicIP", default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(rename = "AliasIPRanges", default)]
    pub alias_ip_ranges: Vec<String>,
    /// Pod CIDR of the cluster.
    #[serde(rename = "SecondaryIPRange", default)]
    pub secondary_ip_range: String,
    #[serde(rename = "SSHKeys", default)]
    pub ssh_keys: BTreeMap<String, Vec<String>>,
}

/// A member of the VPN overlay. Identity is the public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// `host:port` the peer is reachable at.
    #[serde(rename = "PublicEndpoint")]
    pub public_endpoint: String,
    #[serde(rename = "VPNIP")]
    pub vpn_ip: String,
    #[serde(rename = "VPNPubKey", with = "bytes_b64")]
    pub vpn_pub_key: Vec<u8>,
    #[serde(rename = "Role", default)]
    pub role: Role,
}

impl Peer {
    /// Host part of the public endpoint. Fails if the endpoint has no port.
    pub fn endpoint_host(&self) -> Result<String> {
        let (host, _) = split_host_port(&self.public_endpoint)?;
        Ok(host)
    }
}

/// Serde helper encoding byte vectors as standard base64 strings.
pub mod bytes_b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
