use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DefaultOnNull, serde_as};

/// A promotable product as served by the catalog service.
///
/// The catalog uses `product_*` column names (including the mixed-case
/// `product_Brand`); nulls collapse to empty strings so completeness can be
/// checked in one place.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub product_id: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, rename = "product_name")]
    pub name: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, rename = "product_category")]
    pub category: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, rename = "product_Brand", alias = "product_brand")]
    pub brand: String,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default, rename = "product_department")]
    pub department: String,
}

impl Product {
    pub fn is_complete(&self) -> bool {
        !self.product_id.trim().is_empty() && !self.name.trim().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// Link between a product and its uploaded banner, pending confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedImageRecord {
    pub product: Product,
    pub remote_image_url: String,
    pub stored_image_url: String,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
}

/// Document written to the metadata store on sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocument {
    pub product_id: String,
    pub product_name: String,
    pub product_category: String,
    pub product_brand: String,
    pub product_department: String,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl SyncDocument {
    pub fn from_record(record: &GeneratedImageRecord) -> Self {
        let product = &record.product;
        Self {
            product_id: product.product_id.clone(),
            product_name: product.name.clone(),
            product_category: product.category.clone(),
            product_brand: product.brand.clone(),
            product_department: product.department.clone(),
            image_url: record.stored_image_url.clone(),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
