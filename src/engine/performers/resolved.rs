use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::engine::error::{ResolveError, StoreError};
use crate::engine::expiry::expire_at;
use crate::engine::pool::Performer;
use crate::engine::resolver::Resolver;
use crate::engine::store::Store;
use crate::engine::types::ResolvedTree;
use crate::engine::vulnerability::annotate;

/// Pool key for one version of a package
pub fn version_key(name: &str, version: &str) -> String {
    format!("{}\t{}", name, version)
}

/// Splits a key built by [`version_key`]
pub fn parse_version_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('\t')
}

/// Resolves full dependency trees, cached in the `resolved_versions` table
pub struct ResolvedVersionPerformer {
    store: Arc<dyn Store>,
    resolver: Arc<Resolver>,
}

impl ResolvedVersionPerformer {
    pub fn new(store: Arc<dyn Store>, resolver: Arc<Resolver>) -> Self {
        Self { store, resolver }
    }
}

#[async_trait::async_trait]
impl Performer for ResolvedVersionPerformer {
    type Output = ResolvedTree;

    fn name(&self) -> &'static str {
        "version"
    }

    fn get(&self, key: &str) -> Option<ResolvedTree> {
        let (name, version) = parse_version_key(key)?;
        self.store
            .get_resolved_version(name, version)
            .inspect_err(|e| warn!("Failed to read {}@{} from cache: {}", name, version, e))
            .ok()
            .flatten()
    }

    fn put(&self, key: &str, value: &ResolvedTree) -> Result<(), StoreError> {
        let Some((name, version)) = parse_version_key(key) else {
            warn!("Refusing to store malformed version key {:?}", key);
            return Ok(());
        };
        let last_update = value.time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        self.store.put_resolved_version(
            name,
            version,
            value,
            expire_at(last_update, Utc::now()),
        )
    }

    async fn compute(&self, key: &str) -> Result<ResolvedTree, ResolveError> {
        let (name, version) = parse_version_key(key)
            .ok_or_else(|| ResolveError::NotFound(format!("malformed version key {:?}", key)))?;

        let package = self.resolver.metadata().process(name).wait().await?;
        let mut tree = self.resolver.resolve(&package, version).await?;
        annotate(&mut tree, self.store.as_ref())?;

        Ok(tree)
    }
}
