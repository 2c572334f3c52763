//! Registry test utilities

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use depscope::config::Config;
use depscope::engine::cache::Cache;
use depscope::engine::context::ResolutionContext;
use depscope::engine::error::RegistryError;
use depscope::engine::feed::{FeedPage, VulnerabilityFeed};
use depscope::engine::registry::Registry;
use depscope::engine::vulnerability::Vulnerability;

/// In-memory registry that counts fetches per package
#[derive(Default)]
pub struct FixtureRegistry {
    documents: HashMap<String, Vec<u8>>,
    fetches: Mutex<HashMap<String, usize>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a package whose last release becomes `latest`
    pub fn with_package(mut self, name: &str, releases: &[(&str, &[(&str, &str)])]) -> Self {
        let document = package_document(name, releases);
        self.documents.insert(
            name.to_string(),
            serde_json::to_vec(&document).unwrap(),
        );
        self
    }

    /// Delays every fetch, so callers can observe in-flight work
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self, name: &str) -> usize {
        self.fetches.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    /// Highest number of fetches that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for FixtureRegistry {
    async fn fetch_document(&self, package_name: &str) -> Result<Vec<u8>, RegistryError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(package_name.to_string())
            .or_default() += 1;

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.documents
            .get(package_name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(package_name.to_string()))
    }
}

/// Builds a registry document; every release has 3 files and 1000 bytes
pub fn package_document(name: &str, releases: &[(&str, &[(&str, &str)])]) -> Value {
    let mut versions = serde_json::Map::new();
    let mut time = serde_json::Map::new();
    for (version, deps) in releases {
        let dependencies: serde_json::Map<String, Value> = deps
            .iter()
            .map(|(dep, constraint)| (dep.to_string(), json!(constraint)))
            .collect();
        versions.insert(
            version.to_string(),
            json!({
                "name": name,
                "version": version,
                "dependencies": dependencies,
                "_npmUser": { "name": "maintainer", "email": "m@example.com" },
                "dist": { "fileCount": 3, "unpackedSize": 1000 }
            }),
        );
        time.insert(version.to_string(), json!("2020-01-01T00:00:00.000Z"));
    }
    let latest = releases.last().map(|(v, _)| *v).unwrap_or_default();

    json!({
        "name": name,
        "dist-tags": { "latest": latest },
        "versions": versions,
        "time": time
    })
}

/// Vulnerability feed serving fixed pages, then empty ones
#[derive(Default)]
pub struct StaticFeed {
    pages: Vec<Vec<Vulnerability>>,
}

impl StaticFeed {
    pub fn new(pages: Vec<Vec<Vulnerability>>) -> Self {
        Self { pages }
    }
}

#[async_trait]
impl VulnerabilityFeed for StaticFeed {
    async fn fetch_page(&self, page: u32) -> Result<FeedPage, RegistryError> {
        let vulnerabilities = (page as usize)
            .checked_sub(1)
            .and_then(|index| self.pages.get(index))
            .cloned()
            .unwrap_or_default();
        Ok(FeedPage {
            status: "ok".to_string(),
            vulnerabilities,
        })
    }
}

pub struct TestContext {
    pub _temp_dir: TempDir,
    pub store: Arc<Cache>,
    pub registry: Arc<FixtureRegistry>,
    pub context: Arc<ResolutionContext>,
}

/// Config with a generous wait so results are ready on the first request
pub fn patient_config() -> Config {
    Config {
        wait_timeout: 10_000,
        ..Config::default()
    }
}

pub fn create_context(registry: FixtureRegistry, feed: StaticFeed, config: Config) -> TestContext {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(Cache::new(&temp_dir.path().join("test.db")).unwrap());
    let registry = Arc::new(registry);
    let context = Arc::new(ResolutionContext::new(
        &config,
        store.clone(),
        registry.clone(),
        Arc::new(feed),
    ));

    TestContext {
        _temp_dir: temp_dir,
        store,
        registry,
        context,
    }
}
