use crate::config::{HttpSettings, StorageConfig};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use urlencoding::encode;

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("supabase is not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
}

/// Durable storage for generated artifacts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path` and returns a publicly resolvable URL.
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SupabaseError>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, collection: &str, document: &Value) -> Result<(), SupabaseError>;
}

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: Option<String>,
    service_key: Option<String>,
    bucket: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(config: &StorageConfig, settings: HttpSettings) -> Self {
        Self {
            base_url: config
                .base_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string()),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
            http: build_client(settings),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.service_key.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str), SupabaseError> {
        match (self.base_url.as_deref(), self.service_key.as_deref()) {
            (Some(base), Some(key)) => Ok((base, key)),
            _ => Err(SupabaseError::NotConfigured),
        }
    }

    fn public_url(&self, base: &str, object_path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            base, self.bucket, object_path
        )
    }
}

#[async_trait]
impl BlobStore for SupabaseClient {
    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SupabaseError> {
        let (base, key) = self.credentials()?;
        let object_path = encode_path(path);
        let url = format!("{}/storage/v1/object/{}/{}", base, self.bucket, object_path);
        let response = self
            .http
            .post(url)
            .header("apikey", key)
            .bearer_auth(key)
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        Ok(self.public_url(base, &object_path))
    }
}

#[async_trait]
impl MetadataStore for SupabaseClient {
    async fn insert(&self, collection: &str, document: &Value) -> Result<(), SupabaseError> {
        let (base, key) = self.credentials()?;
        let url = format!("{}/rest/v1/{}", base, collection);
        let response = self
            .http
            .post(url)
            .header("apikey", key)
            .bearer_auth(key)
            .header("Prefer", "return=minimal")
            .json(document)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// Product names end up in object keys, so each segment is percent-encoded
// while the separators stay intact.
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
