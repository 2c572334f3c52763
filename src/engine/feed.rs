//! Vulnerability feed client and incremental import

#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::engine::error::{RegistryError, StoreError};
use crate::engine::registries::http_client;
use crate::engine::store::Store;
use crate::engine::vulnerability::Vulnerability;

/// One page of the vulnerability listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPage {
    pub status: String,
    pub vulnerabilities: Vec<Vulnerability>,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    vulnerabilities: Vec<serde_json::Value>,
}

/// Source of vulnerability records, newest first, paged from 1
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait VulnerabilityFeed: Send + Sync {
    /// Fetches one page; a status other than `ok` is an error
    async fn fetch_page(&self, page: u32) -> Result<FeedPage, RegistryError>;
}

/// Feed implementation for the Snyk public listing API
pub struct SnykFeed {
    client: reqwest::Client,
    base_url: String,
}

impl SnykFeed {
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl VulnerabilityFeed for SnykFeed {
    async fn fetch_page(&self, page: u32) -> Result<FeedPage, RegistryError> {
        let url = format!("{}?type=npm&pageNumber={}", self.base_url, page);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Vulnerability feed returned status {}: {}", status, url);
            return Err(RegistryError::Status {
                status: status.to_string(),
                url,
            });
        }

        let listing: ListingResponse = response.json().await.map_err(|e| {
            warn!("Failed to parse vulnerability listing: {}", e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        if listing.status != "ok" {
            return Err(RegistryError::InvalidResponse(format!(
                "listing status: {}",
                listing.status
            )));
        }

        // A single odd record must not hide the rest of the page
        let vulnerabilities = listing
            .vulnerabilities
            .into_iter()
            .filter_map(|record| {
                serde_json::from_value::<Vulnerability>(record)
                    .inspect_err(|e| warn!("Skipping malformed vulnerability record: {}", e))
                    .ok()
            })
            .collect();

        Ok(FeedPage {
            status: listing.status,
            vulnerabilities,
        })
    }
}

/// Imports new vulnerabilities until a known record, an empty page, or a
/// fetch error is reached. Returns the number of stored records.
pub async fn sync_vulnerabilities(
    feed: &dyn VulnerabilityFeed,
    store: &dyn Store,
) -> Result<usize, StoreError> {
    let last_known = store.get_latest_vulnerability()?.map(|v| v.id);
    let mut imported = 0;
    let mut page = 1;

    loop {
        let vulnerabilities = match feed.fetch_page(page).await {
            Ok(feed_page) => feed_page.vulnerabilities,
            Err(e) => {
                warn!("Failed to fetch vulnerability page {}: {}", page, e);
                break;
            }
        };

        if vulnerabilities.is_empty() {
            info!("Received all vulnerabilities");
            break;
        }

        for vulnerability in vulnerabilities {
            if last_known.as_deref() == Some(vulnerability.id.as_str()) {
                info!("Reached known vulnerability {}", vulnerability.id);
                return Ok(imported);
            }
            match store.put_vulnerability(&vulnerability) {
                Ok(()) => imported += 1,
                Err(e) => warn!("Failed to store vulnerability {}: {}", vulnerability.id, e),
            }
        }

        debug!("Imported vulnerability page {}", page);
        page += 1;
    }

    Ok(imported)
}
