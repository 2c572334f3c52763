//! Vulnerability records and correlation against resolved trees

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::error::StoreError;
use crate::engine::range::{VersionRange, parse_version};
use crate::engine::store::Store;
use crate::engine::types::ResolvedTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemverSpec {
    #[serde(default)]
    pub vulnerable: Vec<String>,
}

/// A feed record describing vulnerable ranges of one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    #[serde(default)]
    pub package_manager: String,
    pub package_name: String,
    #[serde(default)]
    pub title: String,
    pub publication_time: DateTime<Utc>,
    #[serde(default)]
    pub semver: SemverSpec,
    pub severity: Severity,
}

/// Histogram of matched vulnerabilities per severity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityStats {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl VulnerabilityStats {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.low + self.medium + self.high + self.critical
    }
}

/// Whether any installed version falls in any vulnerable range.
///
/// Malformed versions and range expressions are skipped with a warning.
fn is_affected(vulnerability: &Vulnerability, installed: &[String]) -> bool {
    let ranges: Vec<VersionRange> = vulnerability
        .semver
        .vulnerable
        .iter()
        .filter_map(|expr| {
            VersionRange::parse(expr).or_else(|| {
                warn!(
                    "Skipping malformed range {:?} in vulnerability {}",
                    expr, vulnerability.id
                );
                None
            })
        })
        .collect();

    installed.iter().any(|raw| {
        let Some(version) = parse_version(raw) else {
            warn!(
                "Skipping malformed installed version {:?} of {}",
                raw, vulnerability.package_name
            );
            return false;
        };
        ranges.iter().any(|range| range.satisfies(&version))
    })
}

/// Matches candidate vulnerabilities against the versions installed in `tree`
pub fn correlate(
    tree: &ResolvedTree,
    candidates: &[Vulnerability],
) -> (Vec<Vulnerability>, VulnerabilityStats) {
    let mut matched = Vec::new();
    let mut stats = VulnerabilityStats::default();

    for vulnerability in candidates {
        let installed: Vec<String> = if vulnerability.package_name == tree.info.name {
            vec![tree.info.version.clone()]
        } else {
            tree.dependencies
                .get(&vulnerability.package_name)
                .cloned()
                .unwrap_or_default()
        };

        if is_affected(vulnerability, &installed) {
            debug!(
                "{} affects {} {:?}",
                vulnerability.id, vulnerability.package_name, installed
            );
            stats.record(vulnerability.severity);
            matched.push(vulnerability.clone());
        }
    }

    (matched, stats)
}

/// Loads vulnerabilities for every package in `tree` and annotates it
pub fn annotate(tree: &mut ResolvedTree, store: &dyn Store) -> Result<(), StoreError> {
    let mut names = Vec::with_capacity(tree.dependencies.len() + 1);
    names.push(tree.info.name.clone());
    names.extend(tree.dependencies.keys().cloned());

    let candidates = store.get_vulnerabilities_for_packages(&names)?;
    let (vulnerabilities, stats) = correlate(tree, &candidates);

    tree.vulnerabilities = vulnerabilities;
    tree.stats.vulnerability_stats = stats;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::MockStore;
    use crate::engine::types::VersionMetadata;
    use rstest::rstest;

    fn vulnerability(id: &str, package: &str, ranges: &[&str], severity: Severity) -> Vulnerability {
        Vulnerability {
            id: id.to_string(),
            package_manager: "npm".to_string(),
            package_name: package.to_string(),
            title: format!("{} in {}", id, package),
            publication_time: "2024-01-01T00:00:00Z".parse().unwrap(),
            semver: SemverSpec {
                vulnerable: ranges.iter().map(|r| r.to_string()).collect(),
            },
            severity,
        }
    }

    fn tree_with(root: &str, root_version: &str, deps: &[(&str, &[&str])]) -> ResolvedTree {
        let mut tree = ResolvedTree::new(
            VersionMetadata {
                name: root.to_string(),
                version: root_version.to_string(),
                ..Default::default()
            },
            None,
        );
        for (name, versions) in deps {
            tree.dependencies.insert(
                name.to_string(),
                versions.iter().map(|v| v.to_string()).collect(),
            );
        }
        tree
    }

    #[rstest]
    #[case("1.0.0", true)]
    #[case("1.3.0", false)]
    fn vulnerable_range_matches_installed_dependency(
        #[case] installed: &str,
        #[case] expected: bool,
    ) {
        let tree = tree_with("app", "1.0.0", &[("minimist", &[installed])]);
        let candidates = vec![vulnerability("SNYK-1", "minimist", &["<1.2.3"], Severity::High)];

        let (matched, stats) = correlate(&tree, &candidates);

        assert_eq!(matched.len(), usize::from(expected));
        assert_eq!(stats.high, u64::from(expected));
    }

    #[test]
    fn root_package_is_matched_against_its_own_version() {
        let tree = tree_with("lodash", "4.17.15", &[]);
        let candidates = vec![vulnerability(
            "SNYK-JS-LODASH",
            "lodash",
            &["<4.17.19"],
            Severity::Critical,
        )];

        let (matched, stats) = correlate(&tree, &candidates);

        assert_eq!(matched, candidates);
        assert_eq!(stats.critical, 1);
    }

    #[test]
    fn severity_is_counted_once_per_vulnerability() {
        let tree = tree_with("app", "1.0.0", &[("qs", &["1.0.0", "2.0.0"])]);
        let candidates = vec![vulnerability(
            "SNYK-QS",
            "qs",
            &["<1.5.0", ">=2.0.0 <2.1.0"],
            Severity::Medium,
        )];

        let (matched, stats) = correlate(&tree, &candidates);

        assert_eq!(matched.len(), 1);
        assert_eq!(
            stats,
            VulnerabilityStats {
                medium: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn malformed_ranges_and_versions_are_skipped() {
        let tree = tree_with("app", "1.0.0", &[("ws", &["not-a-version", "5.0.0"])]);
        let candidates = vec![
            vulnerability("SNYK-WS-1", "ws", &["garbage range", "<6.0.0"], Severity::Low),
            vulnerability("SNYK-WS-2", "ws", &["garbage range"], Severity::High),
        ];

        let (matched, stats) = correlate(&tree, &candidates);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "SNYK-WS-1");
        assert_eq!(stats.total(), 1);
    }

    #[test]
    fn unrelated_package_is_not_matched() {
        let tree = tree_with("app", "1.0.0", &[("qs", &["1.0.0"])]);
        let candidates = vec![vulnerability("SNYK-X", "express", &["*"], Severity::Low)];

        let (matched, stats) = correlate(&tree, &candidates);

        assert!(matched.is_empty());
        assert_eq!(stats, VulnerabilityStats::default());
    }

    #[test]
    fn annotate_queries_root_and_dependency_names() {
        let mut tree = tree_with("app", "1.0.0", &[("minimist", &["1.0.0"])]);
        let mut store = MockStore::new();
        store
            .expect_get_vulnerabilities_for_packages()
            .withf(|names| names == ["app".to_string(), "minimist".to_string()])
            .times(1)
            .returning(|_| {
                Ok(vec![vulnerability(
                    "SNYK-1",
                    "minimist",
                    &["<1.2.3"],
                    Severity::High,
                )])
            });

        annotate(&mut tree, &store).unwrap();

        assert_eq!(tree.vulnerabilities.len(), 1);
        assert_eq!(tree.stats.vulnerability_stats.high, 1);
    }

    #[test]
    fn annotate_propagates_storage_errors() {
        let mut tree = tree_with("app", "1.0.0", &[]);
        let mut store = MockStore::new();
        store
            .expect_get_vulnerabilities_for_packages()
            .returning(|_| Err(StoreError::LockPoisoned));

        let result = annotate(&mut tree, &store);

        assert!(matches!(result, Err(StoreError::LockPoisoned)));
    }

    #[test]
    fn vulnerability_deserializes_feed_record() {
        let record: Vulnerability = serde_json::from_str(
            r#"{
                "id": "SNYK-JS-MINIMIST-559764",
                "packageManager": "npm",
                "packageName": "minimist",
                "title": "Prototype Pollution",
                "publicationTime": "2020-03-11T08:25:47.093051Z",
                "semver": { "vulnerable": ["<0.2.1", ">=1.0.0 <1.2.3"] },
                "severity": "medium"
            }"#,
        )
        .unwrap();

        assert_eq!(record.severity, Severity::Medium);
        assert_eq!(record.semver.vulnerable.len(), 2);
    }
}
