use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::engine::error::{ResolveError, StoreError};
use crate::engine::expiry::expire_at;
use crate::engine::pool::Performer;
use crate::engine::registry::Registry;
use crate::engine::store::Store;
use crate::engine::types::PackageMetadata;

/// Fetches registry documents, cached in the `packages` table
pub struct MetadataPerformer {
    store: Arc<dyn Store>,
    registry: Arc<dyn Registry>,
}

impl MetadataPerformer {
    pub fn new(store: Arc<dyn Store>, registry: Arc<dyn Registry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait::async_trait]
impl Performer for MetadataPerformer {
    type Output = PackageMetadata;

    fn name(&self) -> &'static str {
        "metadata"
    }

    fn get(&self, key: &str) -> Option<PackageMetadata> {
        self.store
            .get_package(key)
            .inspect_err(|e| warn!("Failed to read package {} from cache: {}", key, e))
            .ok()
            .flatten()
    }

    fn put(&self, key: &str, value: &PackageMetadata) -> Result<(), StoreError> {
        // Packages without a publish time for `latest` are treated as old
        let last_update = value.latest_time().unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.store
            .put_package(key, value, expire_at(last_update, Utc::now()))
    }

    async fn compute(&self, key: &str) -> Result<PackageMetadata, ResolveError> {
        debug!("Fetching {} from registry", key);
        let body = self.registry.fetch_document(key).await?;

        serde_json::from_slice(&body).map_err(|e| {
            warn!("Failed to parse registry document for {}: {}", key, e);
            ResolveError::MalformedData(format!("{}: {}", key, e))
        })
    }
}
