//! Sync Recorder: persists confirmed banners to the metadata store.

use crate::models::{GeneratedImageRecord, SyncDocument};
use crate::supabase::MetadataStore;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub document: SyncDocument,
    /// False when the write failed. The operator is told it succeeded either way.
    pub persisted: bool,
}

#[derive(Clone)]
pub struct SyncRecorder {
    store: Arc<dyn MetadataStore>,
    collection: String,
}

impl SyncRecorder {
    pub fn new(store: Arc<dyn MetadataStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub async fn sync(&self, record: &GeneratedImageRecord) -> SyncOutcome {
        let document = SyncDocument::from_record(record);
        let persisted = match serde_json::to_value(&document) {
            Ok(value) => match self.store.insert(&self.collection, &value).await {
                Ok(()) => {
                    info!(
                        target = "promo.sync",
                        product_id = %document.product_id,
                        image_url = %document.image_url,
                        "promotion_image_synced"
                    );
                    true
                }
                Err(err) => {
                    warn!(
                        target = "promo.sync",
                        product_id = %document.product_id,
                        error = %err,
                        "metadata_write_failed"
                    );
                    false
                }
            },
            Err(err) => {
                warn!(target = "promo.sync", error = %err, "sync_document_encode_failed");
                false
            }
        };
        SyncOutcome {
            document,
            persisted,
        }
    }
}
