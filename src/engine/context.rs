//! Entry point for resolution requests
//!
//! A [`ResolutionContext`] is built once at startup and owns one pool per
//! resource kind. Requests wait a bounded time for their result and answer
//! [`Resolution::Pending`] when the work is still running in the background.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::deferred::Outcome;
use crate::engine::error::{ResolveError, StoreError};
use crate::engine::expiry::MIN_EXPIRY;
use crate::engine::feed::{self, VulnerabilityFeed};
use crate::engine::performers::{
    MetadataPerformer, MetadataPool, ResolvedVersionPerformer, ResolvedVersionPool,
    UploadedFilePerformer, UploadedFilePool, version_key,
};
use crate::engine::pool::DedupPool;
use crate::engine::registry::Registry;
use crate::engine::resolver::{Platform, Resolver};
use crate::engine::store::{ExpiredCounts, Store};
use crate::engine::types::{ResolvedTree, VersionMetadata};
use crate::engine::vulnerability::annotate;

/// Answer to a resolution request
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready(Arc<ResolvedTree>),
    /// Still being computed; ask again later
    Pending,
}

impl Resolution {
    fn from_outcome(outcome: Outcome<ResolvedTree>) -> Result<Self, ResolveError> {
        match outcome {
            Ok(tree) => Ok(Resolution::Ready(tree)),
            Err(ResolveError::Timeout) => Ok(Resolution::Pending),
            Err(e) => Err(e),
        }
    }
}

pub struct ResolutionContext {
    store: Arc<dyn Store>,
    feed: Arc<dyn VulnerabilityFeed>,
    metadata: Arc<MetadataPool>,
    versions: ResolvedVersionPool,
    files: UploadedFilePool,
    wait_timeout: Duration,
    max_upload_bytes: usize,
}

impl ResolutionContext {
    /// Builds the pools and spawns their workers on the current runtime
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        registry: Arc<dyn Registry>,
        feed: Arc<dyn VulnerabilityFeed>,
    ) -> Self {
        let metadata = Arc::new(DedupPool::start(
            MetadataPerformer::new(store.clone(), registry),
            config.pools.metadata,
        ));
        let resolver = Arc::new(Resolver::new(
            metadata.clone(),
            Platform::from(&config.target),
        ));
        let versions = DedupPool::start(
            ResolvedVersionPerformer::new(store.clone(), resolver.clone()),
            config.pools.versions,
        );
        let files = DedupPool::start(
            UploadedFilePerformer::new(store.clone(), resolver),
            config.pools.files,
        );

        Self {
            store,
            feed,
            metadata,
            versions,
            files,
            wait_timeout: config.wait_timeout(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    /// Version the `latest` dist-tag of `name` points to.
    ///
    /// Answers from the stored column when possible so no document has to be
    /// decoded. Yields [`ResolveError::Timeout`] if the registry is slow.
    pub async fn latest_version(&self, name: &str) -> Result<String, ResolveError> {
        self.latest_version_within(name, self.wait_timeout).await
    }

    async fn latest_version_within(
        &self,
        name: &str,
        budget: Duration,
    ) -> Result<String, ResolveError> {
        let cached = self
            .store
            .get_package_latest_version(name)
            .inspect_err(|e| warn!("Failed to read latest version of {}: {}", name, e))
            .ok()
            .flatten();
        if let Some(version) = cached {
            return Ok(version);
        }

        let package = self
            .metadata
            .process(name)
            .wait_timeout(budget)
            .await?;
        package
            .latest_tag()
            .map(str::to_string)
            .ok_or_else(|| ResolveError::NotFound(format!("{} has no latest version", name)))
    }

    /// Resolves the `latest` version of `name`.
    ///
    /// Looking up the version and resolving it share one wait budget.
    pub async fn resolve_package_latest(&self, name: &str) -> Result<Resolution, ResolveError> {
        let started = Instant::now();
        let version = match self.latest_version_within(name, self.wait_timeout).await {
            Ok(version) => version,
            Err(ResolveError::Timeout) => return Ok(Resolution::Pending),
            Err(e) => return Err(e),
        };

        let remaining = self.wait_timeout.saturating_sub(started.elapsed());
        self.resolve_version_within(name, &version, remaining).await
    }

    pub async fn resolve_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Resolution, ResolveError> {
        self.resolve_version_within(name, version, self.wait_timeout).await
    }

    /// An exhausted budget still answers from already resolved results
    async fn resolve_version_within(
        &self,
        name: &str,
        version: &str,
        budget: Duration,
    ) -> Result<Resolution, ResolveError> {
        let outcome = self
            .versions
            .process(&version_key(name, version))
            .wait_timeout(budget)
            .await;
        Resolution::from_outcome(outcome)
    }

    pub async fn resolve_uploaded_file(&self, id: &str) -> Result<Resolution, ResolveError> {
        let outcome = self
            .files
            .process(id)
            .wait_timeout(self.wait_timeout)
            .await;
        Resolution::from_outcome(outcome)
    }

    /// Stores an uploaded package.json and starts resolving it.
    ///
    /// Returns the id under which the result can be requested.
    pub fn upload_manifest(&self, bytes: &[u8]) -> Result<String, ResolveError> {
        if bytes.len() > self.max_upload_bytes {
            return Err(ResolveError::TooLarge {
                size: bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let info: VersionMetadata = serde_json::from_slice(bytes)
            .map_err(|e| ResolveError::MalformedData(format!("uploaded manifest: {}", e)))?;

        let id = Uuid::new_v4().simple().to_string();
        let mut skeleton = ResolvedTree::new(info, Some(Utc::now()));
        annotate(&mut skeleton, self.store.as_ref())?;
        self.store.put_uploaded_file(&id, &skeleton)?;

        info!(
            "Stored upload {} ({} dependencies, {} dev)",
            id,
            skeleton.info.dependencies.len(),
            skeleton.info.dev_dependencies.len()
        );

        // Start resolving right away; the caller polls with resolve_uploaded_file
        let _ = self.files.process(&id);
        Ok(id)
    }

    /// Deletes expired rows and drops settled in-memory pool entries
    pub fn expire_now(&self) -> Result<ExpiredCounts, StoreError> {
        let counts = self.store.expire_older_than(Utc::now())?;

        let retention = MIN_EXPIRY.to_std().unwrap_or(Duration::from_secs(3600));
        let swept = self.metadata.sweep(retention)
            + self.versions.sweep(retention)
            + self.files.sweep(retention);
        debug!("Swept {} settled pool entries", swept);

        Ok(counts)
    }

    /// Imports new records from the vulnerability feed
    pub async fn sync_vulnerabilities(&self) -> Result<usize, StoreError> {
        let imported =
            feed::sync_vulnerabilities(self.feed.as_ref(), self.store.as_ref()).await?;
        info!("Imported {} vulnerabilities", imported);
        Ok(imported)
    }

    /// Runs [`Self::expire_now`] every `interval` until the context is dropped.
    ///
    /// Long-running hosts that embed the context call this once after
    /// construction. The one-shot CLI commands skip it and expose the same
    /// sweep through `depscope expire`.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(context) = weak.upgrade() else {
                    debug!("Resolution context dropped, stopping maintenance");
                    return;
                };
                if let Err(e) = context.expire_now() {
                    error!("Failed to expire cached rows: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cache::Cache;
    use crate::engine::feed::MockVulnerabilityFeed;
    use crate::engine::registry::MockRegistry;
    use crate::engine::types::PackageMetadata;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn context_with(config: Config) -> (TempDir, ResolutionContext) {
        let (temp_dir, _store, context) = context_and_store(config);
        (temp_dir, context)
    }

    fn context_and_store(config: Config) -> (TempDir, Arc<Cache>, ResolutionContext) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(Cache::new(&temp_dir.path().join("test.db")).unwrap());
        let context = ResolutionContext::new(
            &config,
            store.clone(),
            Arc::new(MockRegistry::new()),
            Arc::new(MockVulnerabilityFeed::new()),
        );
        (temp_dir, store, context)
    }

    #[tokio::test]
    async fn upload_over_limit_is_rejected() {
        let (_temp_dir, context) = context_with(Config {
            max_upload_bytes: 16,
            ..Config::default()
        });

        let result = context.upload_manifest(br#"{"name":"far-too-long-for-the-limit"}"#);

        assert!(matches!(result, Err(ResolveError::TooLarge { limit: 16, .. })));
    }

    #[tokio::test]
    async fn malformed_upload_is_rejected() {
        let (_temp_dir, context) = context_with(Config::default());

        let result = context.upload_manifest(b"not json");

        assert!(matches!(result, Err(ResolveError::MalformedData(_))));
    }

    #[tokio::test]
    async fn upload_without_dependencies_is_ready_immediately() {
        let (_temp_dir, context) = context_with(Config::default());

        let id = context
            .upload_manifest(br#"{"name":"empty-app","version":"0.1.0"}"#)
            .unwrap();
        let resolution = context.resolve_uploaded_file(&id).await.unwrap();

        assert_eq!(id.len(), 32);
        let Resolution::Ready(tree) = resolution else {
            panic!("expected a ready tree");
        };
        assert_eq!(tree.info.name, "empty-app");
        assert_eq!(tree.stats.packages, 1);
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let (_temp_dir, context) = context_with(Config::default());

        let result = context.resolve_uploaded_file("missing").await;

        assert!(matches!(result, Err(ResolveError::NotFound(_))));
    }

    #[tokio::test]
    async fn maintenance_sweeps_expired_rows_periodically() {
        let config = Config {
            maintenance_interval: 20,
            ..Config::default()
        };
        let (_temp_dir, store, context) = context_and_store(config.clone());
        let package: PackageMetadata =
            serde_json::from_str(r#"{"name":"stale","dist-tags":{"latest":"1.0.0"}}"#).unwrap();
        store
            .put_package("stale", &package, Utc::now() - TimeDelta::minutes(1))
            .unwrap();

        let context = Arc::new(context);
        let handle = context.spawn_maintenance(config.maintenance_interval());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.expire_older_than(Utc::now()).unwrap().packages, 0);

        drop(context);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
