//! HTTP clients for the npm registry and the vulnerability feed

pub mod npm;

pub use npm::NpmRegistry;

use crate::config::{HTTP_TIMEOUT, USER_AGENT};
use crate::engine::error::RegistryError;

/// Builds the HTTP client shared by registry and feed implementations
pub(crate) fn http_client() -> Result<reqwest::Client, RegistryError> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()?)
}
