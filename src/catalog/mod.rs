//! Catalog Fetcher: loads promotable products from the remote catalog service
//! and keeps the last good result for the view layer.

pub mod view;

use crate::config::HttpSettings;
use crate::http::build_client;
use crate::models::Product;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

const CATALOG_PATH: &str = "promotion/predict-promotions";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_promotable_products(&self) -> Result<Vec<Product>, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct PromotionalProducts {
    #[serde(default)]
    promotional_products: Vec<Product>,
}

impl CatalogClient {
    pub fn new(base_url: &str, settings: HttpSettings) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client(settings),
        }
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn fetch_promotable_products(&self) -> Result<Vec<Product>, CatalogError> {
        let url = format!("{}/{}", self.base_url, CATALOG_PATH);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| CatalogError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: PromotionalProducts = response
            .json()
            .await
            .map_err(|err| CatalogError::Deserialize(err.to_string()))?;
        Ok(payload.promotional_products)
    }
}

/// Last successfully fetched catalog. A failed refresh never clobbers it.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    products: Vec<Product>,
    loaded_at: Option<DateTime<Utc>>,
}

impl Catalog {
    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }

    pub fn find(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.product_id == product_id)
    }

    /// Installs a fetch result. On error the previous products stay in place.
    pub fn apply(
        &mut self,
        fetched: Result<Vec<Product>, CatalogError>,
    ) -> Result<usize, CatalogError> {
        let fetched = fetched?;
        let fetched_count = fetched.len();
        let products = dedupe_by_id(fetched);
        if products.len() != fetched_count {
            warn!(
                target = "promo.catalog",
                dropped = fetched_count - products.len(),
                "duplicate_product_ids_dropped"
            );
        }
        info!(target = "promo.catalog", count = products.len(), "catalog_loaded");
        self.products = products;
        self.loaded_at = Some(Utc::now());
        Ok(self.products.len())
    }
}

// Keeps the first occurrence; products without an id are kept as-is so the
// draft can reject them later.
fn dedupe_by_id(products: Vec<Product>) -> Vec<Product> {
    let mut seen = HashSet::new();
    products
        .into_iter()
        .filter(|p| p.product_id.is_empty() || seen.insert(p.product_id.clone()))
        .collect()
}
