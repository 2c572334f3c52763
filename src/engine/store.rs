//! Persistence contract for cached registry data, resolved trees and vulnerabilities

use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::engine::error::StoreError;
use crate::engine::types::{PackageMetadata, ResolvedTree};
use crate::engine::vulnerability::Vulnerability;

/// Number of rows removed by an expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiredCounts {
    pub packages: usize,
    pub resolved_versions: usize,
}

/// Trait for storing and retrieving cached resolution data
///
/// `get_*` lookups never return rows whose expiry time has passed, even if
/// the periodic sweep has not deleted them yet.
#[cfg_attr(test, automock)]
pub trait Store: Send + Sync + 'static {
    fn get_package(&self, name: &str) -> Result<Option<PackageMetadata>, StoreError>;

    /// Cheap lookup of the `latest` dist-tag without decoding the document
    fn get_package_latest_version(&self, name: &str) -> Result<Option<String>, StoreError>;

    fn put_package(
        &self,
        name: &str,
        package: &PackageMetadata,
        expire_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn get_resolved_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ResolvedTree>, StoreError>;

    fn put_resolved_version(
        &self,
        name: &str,
        version: &str,
        tree: &ResolvedTree,
        expire_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn get_uploaded_file(&self, id: &str) -> Result<Option<ResolvedTree>, StoreError>;

    /// Insert or replace an uploaded file; uploaded files never expire
    fn put_uploaded_file(&self, id: &str, tree: &ResolvedTree) -> Result<(), StoreError>;

    fn get_vulnerabilities_for_packages(
        &self,
        names: &[String],
    ) -> Result<Vec<Vulnerability>, StoreError>;

    /// Most recently published vulnerability, used to stop feed imports
    fn get_latest_vulnerability(&self) -> Result<Option<Vulnerability>, StoreError>;

    fn put_vulnerability(&self, vulnerability: &Vulnerability) -> Result<(), StoreError>;

    /// Delete packages and resolved versions that expired before `now`
    fn expire_older_than(&self, now: DateTime<Utc>) -> Result<ExpiredCounts, StoreError>;
}
