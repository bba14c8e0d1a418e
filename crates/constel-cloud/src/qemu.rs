//! QEMU metadata: a plain HTTP service on the libvirt network serving `Instance` JSON.

use std::time::Duration;

use anyhow::{Context, Result};
use constel_core::Error;
use constel_core::instance::Instance;

use crate::http::HttpClient;

pub const METADATA_URL: &str = "http://10.42.0.1:8080";

pub struct QemuMetadata {
    http: HttpClient,
    base_url: String,
}

impl QemuMetadata {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_endpoint(METADATA_URL, timeout)
    }

    pub fn with_endpoint(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn self_instance(&self) -> Result<Instance> {
        self.http
            .get_json(&self.url("/self"))
            .await
            .context("Failed to retrieve self instance from QEMU metadata")
    }

    pub async fn list(&self) -> Result<Vec<Instance>> {
        self.http
            .get_json(&self.url("/peers"))
            .await
            .context("Failed to retrieve peers from QEMU metadata")
    }

    pub async fn get_instance(&self, provider_id: &str) -> Result<Instance> {
        self.list()
            .await?
            .into_iter()
            .find(|i| i.provider_id == provider_id)
            .ok_or_else(|| Error::NotFound(format!("instance {}", provider_id)).into())
    }

    /// `host:port` of the API server. Served either as a JSON string or as plain text.
    pub async fn get_load_balancer_endpoint(&self) -> Result<String> {
        let raw = self
            .http
            .get_text(&self.url("/endpoint"))
            .await
            .context("Failed to retrieve endpoint from QEMU metadata")?;
        let endpoint = serde_json::from_str::<String>(&raw).unwrap_or_else(|_| raw.trim().to_string());
        if endpoint.is_empty() {
            return Err(Error::NotFound("QEMU metadata returned no endpoint".to_string()).into());
        }
        Ok(endpoint)
    }

    /// Hash of the init secret the cluster was created with.
    pub async fn init_secret_hash(&self) -> Result<Vec<u8>> {
        self.http
            .get_bytes(&self.url("/initsecrethash"))
            .await
            .context("Failed to retrieve init secret hash from QEMU metadata")
    }

    /// QEMU clusters are single-tenant; the UID is always empty.
    pub fn uid(&self) -> String {
        String::new()
    }
}
