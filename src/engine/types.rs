//! Package metadata and resolution result types

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::engine::vulnerability::{Vulnerability, VulnerabilityStats};

/// Registry document for one package, as returned by `GET /<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: HashMap<String, String>,
    #[serde(default)]
    pub versions: HashMap<String, VersionMetadata>,
    #[serde(default)]
    pub time: HashMap<String, DateTime<Utc>>,
}

impl PackageMetadata {
    /// Version the `latest` dist-tag points to
    pub fn latest_tag(&self) -> Option<&str> {
        self.dist_tags.get("latest").map(String::as_str)
    }

    pub fn latest_version(&self) -> Option<&VersionMetadata> {
        self.latest_tag().and_then(|tag| self.versions.get(tag))
    }

    /// Publish time of the `latest` version, used to derive cache expiry
    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.latest_tag()
            .and_then(|tag| self.time.get(tag))
            .copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NpmUser {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dist {
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub unpacked_size: u64,
}

/// Manifest of a single published version (or an uploaded package.json)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<serde_json::Value>,
    #[serde(default)]
    pub license: Option<serde_json::Value>,
    #[serde(default)]
    pub dependencies: IndexMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: IndexMap<String, String>,
    #[serde(rename = "_npmUser", default)]
    pub npm_user: NpmUser,
    #[serde(default)]
    pub dist: Dist,
    #[serde(default)]
    pub os: Vec<String>,
    #[serde(default)]
    pub cpu: Vec<String>,
}

impl VersionMetadata {
    /// Publisher display name: `name ( email )`, name, email, or empty
    pub fn publisher(&self) -> String {
        let NpmUser { name, email } = &self.npm_user;
        match (name.is_empty(), email.is_empty()) {
            (false, false) => format!("{} ( {} )", name, email),
            (false, true) => name.clone(),
            (true, false) => email.clone(),
            (true, true) => String::new(),
        }
    }

    /// Whether this version can be installed on the given OS/CPU pair.
    ///
    /// Lists follow npm semantics: plain entries form an allow list and
    /// `!`-prefixed entries deny a platform.
    pub fn matches_platform(&self, os: &str, cpu: &str) -> bool {
        platform_allowed(&self.os, os) && platform_allowed(&self.cpu, cpu)
    }
}

fn platform_allowed(list: &[String], target: &str) -> bool {
    if list.is_empty() {
        return true;
    }

    let mut has_allow_entries = false;
    for entry in list {
        match entry.strip_prefix('!') {
            Some(denied) if denied == target => return false,
            Some(_) => {}
            None if entry == target => return true,
            None => has_allow_entries = true,
        }
    }
    !has_allow_entries
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub packages: u64,
    pub versions: u64,
    pub files: u64,
    pub disk_space: u64,
    #[serde(default)]
    pub vulnerability_stats: VulnerabilityStats,
}

/// Aggregate result of resolving one root version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTree {
    pub info: VersionMetadata,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Dependency name to the distinct versions selected anywhere in the closure
    #[serde(default)]
    pub dependencies: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub publishers: BTreeMap<String, u64>,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    pub stats: Stats,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResolvedTree {
    /// Seeds an aggregate with the root's own statistics
    pub fn new(info: VersionMetadata, time: Option<DateTime<Utc>>) -> Self {
        let stats = Stats {
            packages: 1,
            versions: 1,
            files: info.dist.file_count,
            disk_space: info.dist.unpacked_size,
            vulnerability_stats: VulnerabilityStats::default(),
        };

        let mut publishers = BTreeMap::new();
        let publisher = info.publisher();
        if !publisher.is_empty() {
            publishers.insert(publisher, 1);
        }

        Self {
            info,
            time,
            dependencies: IndexMap::new(),
            publishers,
            vulnerabilities: Vec::new(),
            stats,
            errors: Vec::new(),
        }
    }

    /// An uploaded manifest is ready once resolution has actually run.
    ///
    /// Manifests without any dependencies or dev-dependencies are ready as
    /// stored; otherwise resolution must have selected a version or recorded
    /// an error.
    pub fn is_ready(&self) -> bool {
        let has_edges =
            !self.info.dependencies.is_empty() || !self.info.dev_dependencies.is_empty();
        !has_edges || !self.dependencies.is_empty() || !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn version_with_user(name: &str, email: &str) -> VersionMetadata {
        VersionMetadata {
            npm_user: NpmUser {
                name: name.to_string(),
                email: email.to_string(),
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case("isaacs", "i@izs.me", "isaacs ( i@izs.me )")]
    #[case("isaacs", "", "isaacs")]
    #[case("", "i@izs.me", "i@izs.me")]
    #[case("", "", "")]
    fn publisher_formats_name_and_email(
        #[case] name: &str,
        #[case] email: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(version_with_user(name, email).publisher(), expected);
    }

    #[rstest]
    #[case(vec![], vec![], true)]
    #[case(vec!["linux"], vec![], true)]
    #[case(vec!["darwin"], vec![], false)]
    #[case(vec!["darwin", "linux"], vec!["x64"], true)]
    #[case(vec![], vec!["arm64"], false)]
    #[case(vec!["!win32"], vec![], true)]
    #[case(vec!["!linux"], vec![], false)]
    #[case(vec!["linux"], vec!["!x64"], false)]
    fn matches_platform_for_linux_x64(
        #[case] os: Vec<&str>,
        #[case] cpu: Vec<&str>,
        #[case] expected: bool,
    ) {
        let version = VersionMetadata {
            os: os.into_iter().map(String::from).collect(),
            cpu: cpu.into_iter().map(String::from).collect(),
            ..Default::default()
        };
        assert_eq!(version.matches_platform("linux", "x64"), expected);
    }

    #[test]
    fn package_metadata_parses_registry_document() {
        let metadata: PackageMetadata = serde_json::from_value(json!({
            "name": "left-pad",
            "dist-tags": { "latest": "1.3.0" },
            "versions": {
                "1.3.0": {
                    "name": "left-pad",
                    "version": "1.3.0",
                    "license": { "type": "WTFPL" },
                    "homepage": "https://github.com/stevemao/left-pad",
                    "dependencies": { "a": "^1.0.0", "b": "~2.1.0" },
                    "_npmUser": { "name": "stevemao", "email": "s@example.com" },
                    "dist": { "fileCount": 7, "unpackedSize": 11234 }
                }
            },
            "time": {
                "created": "2014-03-14T00:00:00.000Z",
                "1.3.0": "2018-04-09T01:31:32.543Z"
            }
        }))
        .unwrap();

        let latest = metadata.latest_version().unwrap();
        assert_eq!(latest.dist.file_count, 7);
        assert_eq!(latest.dist.unpacked_size, 11234);
        assert_eq!(
            latest.dependencies.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(latest.license, Some(json!({ "type": "WTFPL" })));
        assert_eq!(
            metadata.latest_time().unwrap().to_rfc3339(),
            "2018-04-09T01:31:32.543+00:00"
        );
    }

    #[test]
    fn new_tree_seeds_stats_from_root() {
        let info = VersionMetadata {
            name: "leaf".to_string(),
            version: "1.0.0".to_string(),
            dist: Dist {
                file_count: 4,
                unpacked_size: 2048,
            },
            npm_user: NpmUser {
                name: "alice".to_string(),
                email: String::new(),
            },
            ..Default::default()
        };

        let tree = ResolvedTree::new(info, None);

        assert_eq!(
            tree.stats,
            Stats {
                packages: 1,
                versions: 1,
                files: 4,
                disk_space: 2048,
                vulnerability_stats: VulnerabilityStats::default(),
            }
        );
        assert_eq!(tree.publishers.get("alice"), Some(&1));
        assert!(tree.is_ready());
    }

    #[test]
    fn tree_with_unresolved_dependencies_is_not_ready() {
        let mut info = VersionMetadata::default();
        info.dependencies
            .insert("react".to_string(), "^18.0.0".to_string());

        assert!(!ResolvedTree::new(info, None).is_ready());
    }

    #[test]
    fn tree_with_only_dev_dependencies_is_not_ready_until_resolved() {
        let mut info = VersionMetadata::default();
        info.dev_dependencies
            .insert("jest".to_string(), "^29.0.0".to_string());
        let mut tree = ResolvedTree::new(info, None);

        assert!(!tree.is_ready());

        tree.dependencies
            .insert("jest".to_string(), vec!["29.7.0".to_string()]);
        assert!(tree.is_ready());
    }

    #[test]
    fn tree_whose_dependencies_all_failed_is_ready() {
        let mut info = VersionMetadata::default();
        info.dependencies
            .insert("ghost".to_string(), "^1.0.0".to_string());
        let mut tree = ResolvedTree::new(info, None);
        tree.errors.push("could not get ghost: not found".to_string());

        assert!(tree.is_ready());
    }
}
