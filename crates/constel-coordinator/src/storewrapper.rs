//! Typed access to the coordinator's key-value store.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};
use constel_core::Error;
use constel_core::constants::COORDINATOR_VPN_IP;
use constel_core::instance::Peer;
use serde::{Deserialize, Serialize};

use crate::cluster::JoinArgs;
use crate::store::{KeyValue, StoreError};

const MASTER_SECRET: &str = "masterSecret";
const CLUSTER_ID: &str = "clusterID";
const VPN_PUB_KEY: &str = "vpnKey";
const KUBERNETES_JOIN_ARGS: &str = "kubeJoin";
const KUBECONFIG: &str = "kubeConfig";
const KEK_ID: &str = "kekID";
const KMS_DATA: &str = "KMSData";
const PEER_PREFIX: &str = "PeerPrefix";
const PEERS_RESOURCE_VERSION: &str = "peersResourceVersion";
const FREED_NODE_IP_PREFIX: &str = "freeNodeVPNIPs";
const FREED_NODE_IP_SEQ: &str = "freedNodeVPNIPSequence";
const LAST_NODE_IP: &str = "LastNodeIPPrefix";

/// KMS settings persisted so a restarted coordinator can re-attach its KMS.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KmsInfo {
    #[serde(rename = "KMSURI")]
    pub kms_uri: String,
    #[serde(rename = "StorageURI")]
    pub storage_uri: String,
    #[serde(rename = "KeyEncryptionKeyID")]
    pub kek_id: String,
}

/// Typed view over a store or a transaction.
pub struct StoreWrapper<'a, S: KeyValue + ?Sized> {
    store: &'a S,
}

impl<'a, S: KeyValue + ?Sized> StoreWrapper<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.store.get(key).await?)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        Ok(self.store.put(key, value).await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self.get(key).await?;
        serde_json::from_slice(&raw).with_context(|| format!("Failed to parse stored {}", key))
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).with_context(|| format!("Failed to encode {}", key))?;
        self.put(key, &raw).await
    }

    pub async fn get_vpn_key(&self) -> Result<Vec<u8>> {
        self.get(VPN_PUB_KEY).await
    }

    pub async fn put_vpn_key(&self, key: &[u8]) -> Result<()> {
        self.put(VPN_PUB_KEY, key).await
    }

    pub async fn get_master_secret(&self) -> Result<Vec<u8>> {
        self.get(MASTER_SECRET).await
    }

    pub async fn put_master_secret(&self, secret: &[u8]) -> Result<()> {
        self.put(MASTER_SECRET, secret).await
    }

    pub async fn get_cluster_id(&self) -> Result<Vec<u8>> {
        self.get(CLUSTER_ID).await
    }

    pub async fn put_cluster_id(&self, cluster_id: &[u8]) -> Result<()> {
        self.put(CLUSTER_ID, cluster_id).await
    }

    pub async fn get_kek_id(&self) -> Result<String> {
        let raw = self.get(KEK_ID).await?;
        String::from_utf8(raw).context("Stored KEK ID is not UTF-8")
    }

    pub async fn put_kek_id(&self, kek_id: &str) -> Result<()> {
        self.put(KEK_ID, kek_id.as_bytes()).await
    }

    pub async fn get_kms_data(&self) -> Result<KmsInfo> {
        self.get_json(KMS_DATA).await
    }

    pub async fn put_kms_data(&self, info: &KmsInfo) -> Result<()> {
        self.put_json(KMS_DATA, info).await
    }

    pub async fn get_kubernetes_config(&self) -> Result<Vec<u8>> {
        self.get(KUBECONFIG).await
    }

    pub async fn put_kubernetes_config(&self, kubeconfig: &[u8]) -> Result<()> {
        self.put(KUBECONFIG, kubeconfig).await
    }

    pub async fn get_kubernetes_join_args(&self) -> Result<JoinArgs> {
        self.get_json(KUBERNETES_JOIN_ARGS).await
    }

    pub async fn put_kubernetes_join_args(&self, args: &JoinArgs) -> Result<()> {
        self.put_json(KUBERNETES_JOIN_ARGS, args).await
    }

    /// Store a peer under a key derived from its VPN IP.
    pub async fn put_peer(&self, peer: &Peer) -> Result<()> {
        if peer.vpn_ip.is_empty() {
            bail!("unique ID of peer not set");
        }
        self.put_json(&format!("{}{}", PEER_PREFIX, peer.vpn_ip), peer)
            .await
    }

    pub async fn remove_peer(&self, peer: &Peer) -> Result<()> {
        Ok(self
            .store
            .delete(&format!("{}{}", PEER_PREFIX, peer.vpn_ip))
            .await?)
    }

    pub async fn get_peer(&self, vpn_ip: &str) -> Result<Peer> {
        self.get_json(&format!("{}{}", PEER_PREFIX, vpn_ip)).await
    }

    pub async fn get_peers(&self) -> Result<Vec<Peer>> {
        let mut peers = Vec::new();
        for key in self.store.keys(PEER_PREFIX).await? {
            peers.push(self.get_json(&key).await?);
        }
        Ok(peers)
    }

    /// Current peers version; 0 if never set.
    pub async fn get_peers_resource_version(&self) -> Result<u64> {
        match self.store.get(PEERS_RESOURCE_VERSION).await {
            Ok(raw) => {
                let text = String::from_utf8_lossy(&raw);
                text.trim()
                    .parse()
                    .with_context(|| format!("Invalid peers resource version: {}", text))
            }
            Err(StoreError::ValueUnset(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Bump the peers version. Call within the transaction that changes the peers.
    pub async fn increment_peers_resource_version(&self) -> Result<u64> {
        let next = self.get_peers_resource_version().await? + 1;
        self.put(PEERS_RESOURCE_VERSION, next.to_string().as_bytes())
            .await?;
        Ok(next)
    }

    /// Make the stored peers equal `peers`, bumping the peers version if
    /// anything changed. Returns `(added, removed)`; a changed peer appears in both.
    pub async fn update_peers(&self, peers: &[Peer]) -> Result<(Vec<Peer>, Vec<Peer>)> {
        let mut wanted: BTreeMap<&str, &Peer> =
            peers.iter().map(|p| (p.vpn_ip.as_str(), p)).collect();
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for stored in self.get_peers().await? {
            match wanted.remove(stored.vpn_ip.as_str()) {
                Some(update) => {
                    if update.public_endpoint != stored.public_endpoint
                        || update.vpn_pub_key != stored.vpn_pub_key
                    {
                        added.push(update.clone());
                        removed.push(stored);
                    }
                }
                None => removed.push(stored),
            }
        }
        added.extend(wanted.into_values().cloned());

        for peer in &removed {
            self.remove_peer(peer).await?;
        }
        for peer in &added {
            self.put_peer(peer).await?;
        }
        if !added.is_empty() || !removed.is_empty() {
            self.increment_peers_resource_version().await?;
        }
        Ok((added, removed))
    }

    /// Whether a coordinator already set this store up: the IP pool cursor or
    /// the peers version is present.
    pub async fn is_initialized(&self) -> Result<bool> {
        for key in [LAST_NODE_IP, PEERS_RESOURCE_VERSION] {
            match self.store.get(key).await {
                Ok(_) => return Ok(true),
                Err(StoreError::ValueUnset(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Reserve the coordinator's own address; node IPs are handed out above it.
    pub async fn initialize_store_ips(&self) -> Result<()> {
        self.put_last_node_ip(COORDINATOR_VPN_IP).await
    }

    async fn put_last_node_ip(&self, ip: Ipv4Addr) -> Result<()> {
        self.put(LAST_NODE_IP, &ip.octets()).await
    }

    async fn get_last_node_ip(&self) -> Result<Ipv4Addr> {
        let raw = self.get(LAST_NODE_IP).await?;
        let octets: [u8; 4] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::StateInvariant(format!("stored last node IP has {} bytes", raw.len())))?;
        Ok(Ipv4Addr::from(octets))
    }

    /// Return a VPN IP to the pool. IPs already queued or never handed out are ignored.
    pub async fn put_freed_node_vpn_ip(&self, vpn_ip: &str) -> Result<()> {
        let ip: Ipv4Addr = vpn_ip
            .parse()
            .with_context(|| format!("Invalid VPN IP: {}", vpn_ip))?;
        if let Ok(last) = self.get_last_node_ip().await {
            if ip > last {
                return Ok(());
            }
        }
        for key in self.store.keys(FREED_NODE_IP_PREFIX).await? {
            if self.get(&key).await? == vpn_ip.as_bytes() {
                return Ok(());
            }
        }

        let seq = match self.store.get(FREED_NODE_IP_SEQ).await {
            Ok(raw) => String::from_utf8_lossy(&raw).trim().parse::<u64>().unwrap_or(0),
            Err(StoreError::ValueUnset(_)) => 0,
            Err(e) => return Err(e.into()),
        } + 1;
        self.put(FREED_NODE_IP_SEQ, seq.to_string().as_bytes())
            .await?;
        self.put(&format!("{}{:020}", FREED_NODE_IP_PREFIX, seq), vpn_ip.as_bytes())
            .await
    }

    /// Oldest freed VPN IP, removed from the queue.
    async fn pop_freed_node_vpn_ip(&self) -> Result<Option<String>> {
        let Some(key) = self.store.keys(FREED_NODE_IP_PREFIX).await?.into_iter().next() else {
            return Ok(None);
        };
        let ip = String::from_utf8(self.get(&key).await?).context("Stored freed IP is not UTF-8")?;
        self.store.delete(&key).await?;
        Ok(Some(ip))
    }

    async fn generate_next_node_ip(&self) -> Result<Ipv4Addr> {
        let last = self
            .get_last_node_ip()
            .await
            .context("Could not obtain last node IP from store")?;
        let next = next_node_ip(last)?;
        self.put_last_node_ip(next).await?;
        Ok(next)
    }

    /// Next VPN IP for a node: a freed one first, else a fresh one from the pool.
    pub async fn pop_next_free_node_ip(&self) -> Result<String> {
        if let Some(ip) = self.pop_freed_node_vpn_ip().await? {
            return Ok(ip);
        }
        Ok(self.generate_next_node_ip().await?.to_string())
    }
}

/// Next address in the /16 after `last`.
pub fn next_node_ip(last: Ipv4Addr) -> Result<Ipv4Addr> {
    let mut ip = last.octets();
    if (ip[3] < 255 && ip[2] < 255) || ip[3] < 254 {
        ip[3] += 1;
    } else if ip[2] < 255 {
        ip[3] = 0;
        ip[2] += 1;
    } else {
        return Err(Error::StateInvariant("no IPs left to assign".to_string()).into());
    }
    Ok(Ipv4Addr::from(ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use constel_core::role::Role;

    fn peer(ip: &str, key: u8, endpoint: &str) -> Peer {
        Peer {
            public_endpoint: endpoint.to_string(),
            vpn_ip: ip.to_string(),
            vpn_pub_key: vec![key],
            role: Role::Node,
        }
    }

    #[tokio::test]
    async fn test_peers_round_trip() {
        let store = MemoryStore::new();
        let data = StoreWrapper::new(&store);
        let p1 = peer("10.118.0.2", 1, "192.0.2.1:51820");
        let p2 = peer("10.118.0.3", 2, "192.0.2.2:51820");
        data.put_peer(&p1).await.unwrap();
        data.put_peer(&p2).await.unwrap();
        assert_eq!(data.get_peers().await.unwrap(), vec![p1.clone(), p2.clone()]);
        assert_eq!(data.get_peer("10.118.0.3").await.unwrap(), p2);

        data.remove_peer(&p1).await.unwrap();
        assert_eq!(data.get_peers().await.unwrap(), vec![p2]);
    }

    #[tokio::test]
    async fn test_put_peer_requires_vpn_ip() {
        let store = MemoryStore::new();
        assert!(
            StoreWrapper::new(&store)
                .put_peer(&peer("", 1, "192.0.2.1:51820"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_resource_version() {
        let store = MemoryStore::new();
        let data = StoreWrapper::new(&store);
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 0);
        assert_eq!(data.increment_peers_resource_version().await.unwrap(), 1);
        assert_eq!(data.increment_peers_resource_version().await.unwrap(), 2);
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_peers() {
        let store = MemoryStore::new();
        let data = StoreWrapper::new(&store);
        let p1 = peer("10.118.0.2", 1, "192.0.2.1:51820");
        let p1_moved = peer("10.118.0.2", 1, "192.0.2.10:51820");
        let p2 = peer("10.118.0.3", 2, "192.0.2.2:51820");
        let p3 = peer("10.118.0.4", 3, "192.0.2.3:51820");
        data.put_peer(&p1).await.unwrap();
        data.put_peer(&p2).await.unwrap();
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 0);

        let (added, removed) = data
            .update_peers(&[p1_moved.clone(), p3.clone()])
            .await
            .unwrap();
        assert_eq!(added, vec![p1_moved.clone(), p3.clone()]);
        assert_eq!(removed, vec![p1, p2]);
        assert_eq!(data.get_peers().await.unwrap(), vec![p1_moved.clone(), p3.clone()]);
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 1);

        let (added, removed) = data.update_peers(&[p1_moved, p3]).await.unwrap();
        assert!(added.is_empty());
        assert!(removed.is_empty());
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 1);

        data.update_peers(&[]).await.unwrap();
        assert!(data.get_peers().await.unwrap().is_empty());
        assert_eq!(data.get_peers_resource_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_is_initialized() {
        let store = MemoryStore::new();
        let data = StoreWrapper::new(&store);
        assert!(!data.is_initialized().await.unwrap());
        data.put_master_secret(b"master").await.unwrap();
        assert!(!data.is_initialized().await.unwrap());
        data.increment_peers_resource_version().await.unwrap();
        assert!(data.is_initialized().await.unwrap());

        let store = MemoryStore::new();
        let data = StoreWrapper::new(&store);
        data.initialize_store_ips().await.unwrap();
        assert!(data.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_ip_allocation_prefers_freed_fifo() {
        let store = MemoryStore::new();
        let data = StoreWrapper::new(&store);
        data.initialize_store_ips().await.unwrap();

        assert_eq!(data.pop_next_free_node_ip().await.unwrap(), "10.118.0.2");
        assert_eq!(data.pop_next_free_node_ip().await.unwrap(), "10.118.0.3");
        assert_eq!(data.pop_next_free_node_ip().await.unwrap(), "10.118.0.4");

        data.put_freed_node_vpn_ip("10.118.0.4").await.unwrap();
        data.put_freed_node_vpn_ip("10.118.0.2").await.unwrap();
        // Duplicates and never-allocated IPs are ignored.
        data.put_freed_node_vpn_ip("10.118.0.4").await.unwrap();
        data.put_freed_node_vpn_ip("10.118.0.9").await.unwrap();

        assert_eq!(data.pop_next_free_node_ip().await.unwrap(), "10.118.0.4");
        assert_eq!(data.pop_next_free_node_ip().await.unwrap(), "10.118.0.2");
        assert_eq!(data.pop_next_free_node_ip().await.unwrap(), "10.118.0.5");
    }

    #[tokio::test]
    async fn test_ip_allocation_requires_initialization() {
        let store = MemoryStore::new();
        assert!(
            StoreWrapper::new(&store)
                .pop_next_free_node_ip()
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_wrapper_over_transaction() {
        let store = MemoryStore::new();
        let tx = store.begin_transaction().await.unwrap();
        let data = StoreWrapper::new(&*tx);
        data.put_master_secret(b"secret").await.unwrap();
        data.put_kek_id("kek").await.unwrap();
        assert_eq!(data.get_kek_id().await.unwrap(), "kek");
        tx.commit().await.unwrap();

        let data = StoreWrapper::new(&store);
        assert_eq!(data.get_master_secret().await.unwrap(), b"secret");
    }

    #[test]
    fn test_next_node_ip() {
        assert_eq!(
            next_node_ip(Ipv4Addr::new(10, 118, 0, 1)).unwrap(),
            Ipv4Addr::new(10, 118, 0, 2)
        );
        assert_eq!(
            next_node_ip(Ipv4Addr::new(10, 118, 0, 255)).unwrap(),
            Ipv4Addr::new(10, 118, 1, 0)
        );
        assert_eq!(
            next_node_ip(Ipv4Addr::new(10, 118, 255, 253)).unwrap(),
            Ipv4Addr::new(10, 118, 255, 254)
        );
        let err = next_node_ip(Ipv4Addr::new(10, 118, 255, 254)).unwrap_err();
        assert!(matches!(
            constel_core::error::find(&err),
            Some(Error::StateInvariant(_))
        ));
    }
}
