//! Registry trait for fetching package documents

#[cfg(test)]
use mockall::automock;

use crate::engine::error::RegistryError;

/// Trait for fetching raw package documents from a registry
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Fetches the full metadata document for a package
    ///
    /// # Arguments
    /// * `package_name` - The name of the package (e.g., "@types/node")
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` - Raw JSON body of the document
    /// * `Err(RegistryError)` - If the fetch fails or the status is not 2xx
    async fn fetch_document(&self, package_name: &str) -> Result<Vec<u8>, RegistryError>;
}
