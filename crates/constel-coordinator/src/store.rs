//! Key-value store port with transactions, and its in-memory implementation.
//!
//! Transactions stage their writes and apply them in one step on commit.
//! Only one transaction runs at a time per store, and plain writes wait for
//! the running transaction to finish.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: requested value not set: {0}")]
    ValueUnset(String),
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unset(&self) -> bool {
        matches!(self, StoreError::ValueUnset(_))
    }
}

/// Plain key-value access shared by stores and transactions.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Delete `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All keys starting with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait Store: KeyValue {
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Copy the entries `dst` does not hold yet into `dst`, in one `dst`
    /// transaction. Existing `dst` entries are never overwritten.
    async fn transfer(&self, dst: &dyn Store) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Transaction: KeyValue {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>);
}

/// Creates the persistent store a coordinator switches to after activation.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<Arc<dyn Store>>;
}

pub(crate) type Data = BTreeMap<String, Vec<u8>>;

/// Process-local store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<Data>>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

fn prefixed_keys<'a>(keys: impl Iterator<Item = &'a String>, prefix: &str) -> Vec<String> {
    keys.filter(|k| k.starts_with(prefix)).cloned().collect()
}

#[async_trait]
impl KeyValue for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.data()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::ValueUnset(key.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let _guard = self.tx_lock.lock().await;
        self.data().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.tx_lock.lock().await;
        self.data().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(prefixed_keys(self.data().keys(), prefix))
    }
}

/// Stage every entry of `entries` that `dst` lacks and commit.
pub(crate) async fn copy_missing(dst: &dyn Store, entries: Data) -> Result<usize, StoreError> {
    let tx = dst.begin_transaction().await?;
    let staged = async {
        let mut copied = 0usize;
        for (key, value) in &entries {
            match tx.get(key).await {
                Ok(_) => {}
                Err(e) if e.is_unset() => {
                    tx.put(key, value).await?;
                    copied += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok::<_, StoreError>(copied)
    }
    .await;
    match staged {
        Ok(copied) => {
            tx.commit().await?;
            Ok(copied)
        }
        Err(e) => {
            tx.rollback().await;
            Err(e)
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = Arc::clone(&self.tx_lock).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            staged: Mutex::new(StagedWrites::default()),
            _guard: guard,
        }))
    }

    async fn transfer(&self, dst: &dyn Store) -> Result<(), StoreError> {
        let snapshot = {
            let _guard = self.tx_lock.lock().await;
            self.data().clone()
        };
        copy_missing(dst, snapshot).await.map(|_| ())
    }
}

/// Writes buffered by a transaction until commit.
#[derive(Debug, Default)]
pub(crate) struct StagedWrites {
    pub(crate) inserts: BTreeMap<String, Vec<u8>>,
    pub(crate) deletes: BTreeSet<String>,
}

impl StagedWrites {
    /// `Some(Some(v))` for a staged put, `Some(None)` for a staged delete.
    pub(crate) fn lookup(&self, key: &str) -> Option<Option<Vec<u8>>> {
        if let Some(value) = self.inserts.get(key) {
            return Some(Some(value.clone()));
        }
        self.deletes.contains(key).then_some(None)
    }

    pub(crate) fn put(&mut self, key: &str, value: &[u8]) {
        self.deletes.remove(key);
        self.inserts.insert(key.to_string(), value.to_vec());
    }

    pub(crate) fn delete(&mut self, key: &str) {
        self.inserts.remove(key);
        self.deletes.insert(key.to_string());
    }

    /// Overlay staged writes on the backing keys.
    pub(crate) fn merge_keys(&self, backing: Vec<String>, prefix: &str) -> Vec<String> {
        let mut keys: BTreeSet<String> = backing
            .into_iter()
            .filter(|k| !self.deletes.contains(k))
            .collect();
        keys.extend(prefixed_keys(self.inserts.keys(), prefix));
        keys.into_iter().collect()
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    staged: Mutex<StagedWrites>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn staged(&self) -> MutexGuard<'_, StagedWrites> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValue for MemoryTransaction {
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
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        let staged = this.staged.into_inner().unwrap_or_else(|e| e.into_inner());
        {
            let mut data = this.store.data();
            for key in staged.deletes {
                data.remove(&key);
            }
            data.extend(staged.inserts);
        }
        drop(this._guard);
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}
