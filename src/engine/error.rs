use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status} for {url}")]
    Status { status: String, url: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Error carried through the dedup pools and handed to every waiter.
///
/// Must be `Clone` because a single outcome is broadcast to all callers
/// waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The pool is still computing; callers should poll again later.
    #[error("timeout waiting for result")]
    Timeout,

    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("invalid constraint {constraint}")]
    InvalidConstraint { constraint: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
}

impl From<RegistryError> for ResolveError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(name) => ResolveError::NotFound(name),
            RegistryError::InvalidResponse(message) => ResolveError::MalformedData(message),
            other => ResolveError::UpstreamFetch(other.to_string()),
        }
    }
}

impl From<StoreError> for ResolveError {
    fn from(error: StoreError) -> Self {
        ResolveError::Storage(error.to_string())
    }
}
