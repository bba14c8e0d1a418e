//! Persistent store backed by the cluster's etcd.
//!
//! All keys live under a fixed prefix. Transactions take an etcd lock for
//! their whole lifetime and commit through a single etcd `Txn`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, Txn, TxnOp};
use tracing::{debug, info, warn};

use crate::store::{KeyValue, StagedWrites, Store, StoreError, StoreFactory, Transaction};

pub const ETCD_PREFIX: &str = "constellationRegion";
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Lease backing a transaction lock. The lock is released when the lease expires.
const LOCK_LEASE_TTL_SECS: i64 = 60;

fn backend(err: etcd_client::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .with_context(|| format!("Failed to connect to etcd at {}", endpoints.join(",")))?;
        info!(endpoints = %endpoints.join(","), "Connected to etcd");
        Ok(Self { client })
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", ETCD_PREFIX, key)
    }
}

#[async_trait]
impl KeyValue for EtcdStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .client
            .kv_client()
            .get(Self::full_key(key), None)
            .await
            .map_err(backend)?;
        match resp.kvs() {
            [] => Err(StoreError::ValueUnset(key.to_string())),
            [kv] => Ok(kv.value().to_vec()),
            _ => Err(StoreError::Backend(format!(
                "got multiple entries for key [{}] in etcd",
                key
            ))),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.client
            .kv_client()
            .put(Self::full_key(key), value.to_vec(), None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .kv_client()
            .delete(Self::full_key(key), None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let resp = self
            .client
            .kv_client()
            .get(
                Self::full_key(prefix),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(backend)?;
        let mut keys = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(backend)?;
            keys.push(key.strip_prefix(ETCD_PREFIX).unwrap_or(key).to_string());
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let lease = self
            .client
            .lease_client()
            .grant(LOCK_LEASE_TTL_SECS, None)
            .await
            .map_err(backend)?
            .id();
        let lock = self
            .client
            .lock_client()
            .lock(
                ETCD_PREFIX,
                Some(etcd_client::LockOptions::new().with_lease(lease)),
            )
            .await
            .map_err(backend)?;
        debug!(lease, "Acquired etcd transaction lock");
        Ok(Box::new(EtcdTransaction {
            store: self.clone(),
            staged: Mutex::new(StagedWrites::default()),
            lock_key: lock.key().to_vec(),
            lease,
        }))
    }

    async fn transfer(&self, _dst: &dyn Store) -> Result<(), StoreError> {
        Err(StoreError::Backend(
            "transfer out of the etcd store is not supported".to_string(),
        ))
    }
}

struct EtcdTransaction {
    store: EtcdStore,
    staged: Mutex<StagedWrites>,
    lock_key: Vec<u8>,
    lease: i64,
}

impl EtcdTransaction {
    fn staged(&self) -> MutexGuard<'_, StagedWrites> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn release(&self) {
        if let Err(e) = self
            .store
            .client
            .lock_client()
            .unlock(self.lock_key.clone())
            .await
        {
            warn!(error = %e, "Failed to release etcd transaction lock");
        }
        if let Err(e) = self.store.client.lease_client().revoke(self.lease).await {
            warn!(lease = self.lease, error = %e, "Failed to revoke etcd lease");
        }
    }
}

#[async_trait]
impl KeyValue for EtcdTransaction {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let staged = self.staged().lookup(key);
        match staged {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(StoreError::ValueUnset(key.to_string())),
            None => self.store.get(key).await,
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.staged().put(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.staged().delete(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let backing = self.store.keys(prefix).await?;
        Ok(self.staged().merge_keys(backing, prefix))
    }
}

#[async_trait]
impl Transaction for EtcdTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let ops: Vec<TxnOp> = {
            let staged = self.staged();
            staged
                .inserts
                .iter()
                .map(|(k, v)| TxnOp::put(EtcdStore::full_key(k), v.clone(), None))
                .chain(
                    staged
                        .deletes
                        .iter()
                        .map(|k| TxnOp::delete(EtcdStore::full_key(k), None)),
                )
                .collect()
        };
        let result = self
            .store
            .client
            .kv_client()
            .txn(Txn::new().and_then(ops))
            .await
            .map(|_| ())
            .map_err(backend);
        self.release().await;
        result
    }

    async fn rollback(self: Box<Self>) {
        self.release().await;
    }
}

/// Connects to the local etcd once the coordinator has been activated.
#[derive(Debug, Clone)]
pub struct EtcdStoreFactory {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
}

impl EtcdStoreFactory {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

#[async_trait]
impl StoreFactory for EtcdStoreFactory {
    async fn create(&self) -> Result<Arc<dyn Store>> {
        let store = EtcdStore::connect(&self.endpoints, self.dial_timeout).await?;
        Ok(Arc::new(store))
    }
}
