//! Key management: the KMS port, the in-cluster KMS, and URI-driven setup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use constel_core::Error;
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::info;
use url::Url;
use zeroize::Zeroizing;

/// Longest output HKDF-SHA256 can expand to.
pub const MAX_DERIVED_KEY_LENGTH: usize = 255 * 32;

/// Derive `length` bytes from `secret` with HKDF-SHA256.
///
/// `length` must be in `1..=MAX_DERIVED_KEY_LENGTH` and is checked before the
/// output buffer is allocated.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    if length == 0 || length > MAX_DERIVED_KEY_LENGTH {
        bail!(Error::Configuration(format!(
            "data key length {} out of range 1..={}",
            length, MAX_DERIVED_KEY_LENGTH
        )));
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = vec![0u8; length];
    hk.expand(info, &mut key)
        .map_err(|_| anyhow!("Cannot derive a key of {} bytes", length))?;
    Ok(key)
}

#[async_trait]
pub trait Kms: Send + Sync {
    /// Import `kek` under `kek_id`.
    async fn create_kek(&self, kek_id: &str, kek: &[u8]) -> Result<()>;
    /// Data key `dek_id` of `length` bytes, protected by KEK `kek_id`.
    async fn get_dek(&self, kek_id: &str, dek_id: &str, length: usize) -> Result<Vec<u8>>;

    /// Whether imported KEKs live only in this process and must be re-imported after a restart.
    fn is_volatile(&self) -> bool {
        false
    }
}

/// KMS running inside the cluster. Data keys are derived from the imported KEK.
#[derive(Default)]
pub struct ClusterKms {
    salt: Vec<u8>,
    keks: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl ClusterKms {
    pub fn new(salt: Vec<u8>) -> Self {
        Self {
            salt,
            keks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Kms for ClusterKms {
    async fn create_kek(&self, kek_id: &str, kek: &[u8]) -> Result<()> {
        if kek.is_empty() {
            bail!(Error::Configuration(format!("empty key encryption key {}", kek_id)));
        }
        self.keks
            .lock()
            .map_err(|_| anyhow!("KEK table lock poisoned"))?
            .insert(kek_id.to_string(), Zeroizing::new(kek.to_vec()));
        info!(kek_id, "Imported key encryption key");
        Ok(())
    }

    async fn get_dek(&self, kek_id: &str, dek_id: &str, length: usize) -> Result<Vec<u8>> {
        let kek = self
            .keks
            .lock()
            .map_err(|_| anyhow!("KEK table lock poisoned"))?
            .get(kek_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("key encryption key {}", kek_id)))?;
        derive_key(&kek, &self.salt, dek_id.as_bytes(), length)
            .with_context(|| format!("Failed to derive data key {}", dek_id))
    }

    fn is_volatile(&self) -> bool {
        true
    }
}

const KMS_SCHEME: &str = "kms";
const CLUSTER_KMS_HOST: &str = "cluster-kms";
const STORAGE_SCHEME: &str = "storage";
const NO_STORE_HOST: &str = "no-store";

fn parse_uri(uri: &str, kind: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| {
        Error::Configuration(format!("invalid {} URI {}: {}", kind, uri, e)).into()
    })
}

/// Parse a KMS URI into a KMS handle. Only `kms://cluster-kms[?salt=<base64url>]` is known.
pub fn kms_from_uri(kms_uri: &str) -> Result<ClusterKms> {
    let url = parse_uri(kms_uri, "KMS")?;
    if url.scheme() != KMS_SCHEME || url.host_str() != Some(CLUSTER_KMS_HOST) {
        bail!(Error::Configuration(format!("unsupported KMS URI: {}", kms_uri)));
    }
    let salt = match url.query_pairs().find(|(k, _)| k == "salt") {
        Some((_, value)) => URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .map_err(|e| Error::Configuration(format!("invalid KMS salt: {}", e)))?,
        None => Vec::new(),
    };
    Ok(ClusterKms::new(salt))
}

/// Validate a storage URI. Only `storage://no-store` is known.
pub fn check_storage_uri(storage_uri: &str) -> Result<()> {
    let url = parse_uri(storage_uri, "storage")?;
    if url.scheme() != STORAGE_SCHEME || url.host_str() != Some(NO_STORE_HOST) {
        bail!(Error::Configuration(format!(
            "unsupported storage URI: {}",
            storage_uri
        )));
    }
    Ok(())
}

/// Build the KMS described by the two URIs.
pub fn set_up_kms(storage_uri: &str, kms_uri: &str) -> Result<Arc<dyn Kms>> {
    check_storage_uri(storage_uri)?;
    let kms = kms_from_uri(kms_uri)?;
    Ok(Arc::new(kms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key(b"secret", b"Constellation", b"id", 32).unwrap();
        let b = derive_key(b"secret", b"Constellation", b"id", 32).unwrap();
        let c = derive_key(b"other", b"Constellation", b"id", 32).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(derive_key(b"secret", b"", b"", 255 * 32 + 1).is_err());
    }

    #[test]
    fn test_derive_key_length_bounds() {
        assert_eq!(
            derive_key(b"secret", b"", b"", MAX_DERIVED_KEY_LENGTH).unwrap().len(),
            MAX_DERIVED_KEY_LENGTH
        );
        for length in [0, MAX_DERIVED_KEY_LENGTH + 1, usize::MAX] {
            let err = derive_key(b"secret", b"", b"", length).unwrap_err();
            assert!(matches!(
                constel_core::error::find(&err),
                Some(Error::Configuration(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_cluster_kms_rejects_oversized_dek() {
        let kms = ClusterKms::new(Vec::new());
        kms.create_kek("kek", b"master").await.unwrap();
        assert!(kms.get_dek("kek", "disk", usize::MAX).await.is_err());
        assert!(kms.get_dek("kek", "disk", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_cluster_kms() {
        let kms = ClusterKms::new(b"salt".to_vec());
        assert!(kms.get_dek("kek", "disk", 32).await.is_err());
        kms.create_kek("kek", b"master").await.unwrap();
        let dek = kms.get_dek("kek", "disk", 32).await.unwrap();
        assert_eq!(dek, derive_key(b"master", b"salt", b"disk", 32).unwrap());
        assert_ne!(dek, kms.get_dek("kek", "other-disk", 32).await.unwrap());
        assert!(kms.create_kek("empty", b"").await.is_err());
    }

    #[test]
    fn test_kms_uri() {
        let kms = kms_from_uri("kms://cluster-kms?salt=c2FsdA").unwrap();
        assert_eq!(kms.salt, b"salt");
        assert!(kms_from_uri("kms://cluster-kms").unwrap().salt.is_empty());

        for bad in ["kms://aws-kms", "gcp://cluster-kms", "not a uri"] {
            let err = kms_from_uri(bad).err().unwrap();
            assert!(matches!(
                constel_core::error::find(&err),
                Some(Error::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_storage_uri() {
        assert!(check_storage_uri("storage://no-store").is_ok());
        assert!(check_storage_uri("storage://gcs").is_err());
        assert!(set_up_kms("storage://no-store", "kms://cluster-kms").is_ok());
        assert!(set_up_kms("storage://azure-blob", "kms://cluster-kms").is_err());
    }
}
