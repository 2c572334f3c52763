use std::sync::Arc;

use tracing::warn;

use crate::engine::error::{ResolveError, StoreError};
use crate::engine::pool::Performer;
use crate::engine::resolver::Resolver;
use crate::engine::store::Store;
use crate::engine::types::ResolvedTree;
use crate::engine::vulnerability::annotate;

/// Resolves uploaded manifests in place, including dev-dependencies
pub struct UploadedFilePerformer {
    store: Arc<dyn Store>,
    resolver: Arc<Resolver>,
}

impl UploadedFilePerformer {
    pub fn new(store: Arc<dyn Store>, resolver: Arc<Resolver>) -> Self {
        Self { store, resolver }
    }
}

#[async_trait::async_trait]
impl Performer for UploadedFilePerformer {
    type Output = ResolvedTree;

    fn name(&self) -> &'static str {
        "file"
    }

    /// Only trees that have actually been resolved count as cached
    fn get(&self, key: &str) -> Option<ResolvedTree> {
        self.store
            .get_uploaded_file(key)
            .inspect_err(|e| warn!("Failed to read uploaded file {}: {}", key, e))
            .ok()
            .flatten()
            .filter(ResolvedTree::is_ready)
    }

    fn put(&self, key: &str, value: &ResolvedTree) -> Result<(), StoreError> {
        self.store.put_uploaded_file(key, value)
    }

    async fn compute(&self, key: &str) -> Result<ResolvedTree, ResolveError> {
        let skeleton = self
            .store
            .get_uploaded_file(key)?
            .ok_or_else(|| ResolveError::NotFound(format!("uploaded file {}", key)))?;

        let mut tree = ResolvedTree::new(skeleton.info, skeleton.time);
        self.resolver.resolve_manifest(&mut tree, true).await;
        annotate(&mut tree, self.store.as_ref())?;

        Ok(tree)
    }
}
