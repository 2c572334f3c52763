use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Pool sizing
// =============================================================================

/// Workers fetching registry documents (network bound)
pub const METADATA_WORKERS: usize = 8;

/// Workers resolving dependency trees
pub const RESOLVE_WORKERS: usize = 4;

/// Workers resolving uploaded manifests
pub const UPLOAD_WORKERS: usize = 4;

// =============================================================================
// Time-related constants
// =============================================================================

/// How long a resolution request waits before answering "pending" (1 second)
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1_000;

/// Interval between expiry sweeps in milliseconds (1 hour)
pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Timeout for a single HTTP request (30 seconds)
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Upstream services
// =============================================================================

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";

pub const DEFAULT_FEED_URL: &str = "https://security.snyk.io/api/listing";

pub const USER_AGENT: &str = "depscope";

// =============================================================================
// Resolution
// =============================================================================

/// Platform that platform-restricted dependencies are matched against
pub const TARGET_OS: &str = "linux";
pub const TARGET_CPU: &str = "x64";

/// Largest accepted manifest upload (1 MiB)
pub const MAX_UPLOAD_BYTES: usize = 1 << 20;

/// Engine configuration, read from an optional JSON file
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub registry_url: String,
    pub feed_url: String,
    pub pools: PoolConfig,
    pub target: TargetConfig,
    /// Wait timeout for resolution requests in milliseconds
    pub wait_timeout: u64,
    /// Expiry sweep interval in milliseconds
    pub maintenance_interval: u64,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            pools: PoolConfig::default(),
            target: TargetConfig::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT_MS,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL_MS,
            max_upload_bytes: MAX_UPLOAD_BYTES,
        }
    }
}

impl Config {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval)
    }
}

/// Worker counts per pool
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub metadata: usize,
    pub versions: usize,
    pub files: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            metadata: METADATA_WORKERS,
            versions: RESOLVE_WORKERS,
            files: UPLOAD_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    pub os: String,
    pub cpu: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            os: TARGET_OS.to_string(),
            cpu: TARGET_CPU.to_string(),
        }
    }
}

/// Returns the path to the data directory for depscope.
/// Uses $XDG_DATA_HOME/depscope if XDG_DATA_HOME is set,
/// otherwise falls back to ~/.local/share/depscope,
/// or ./depscope if neither is available.
pub fn data_dir() -> PathBuf {
    data_dir_with_env(std::env::var("XDG_DATA_HOME").ok(), dirs::home_dir())
}

/// Returns the path to the database file.
pub fn db_path() -> PathBuf {
    data_dir().join("depscope.db")
}

/// Returns the path to the log file.
pub fn log_path() -> PathBuf {
    data_dir().join("depscope.log")
}

fn data_dir_with_env(xdg_data_home: Option<String>, home_dir: Option<PathBuf>) -> PathBuf {
    let data_dir = xdg_data_home
        .map(PathBuf::from)
        .or_else(|| home_dir.map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));

    data_dir.join("depscope")
}
