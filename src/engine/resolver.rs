//! Recursive dependency resolution
//!
//! Sibling dependencies are fetched concurrently through the metadata pool,
//! awaited together, and then merged into one [`ResolvedTree`] in manifest
//! order. A dependency name gains a new version only when none of its
//! already selected versions satisfies the requesting constraint.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, join_all};
use tracing::{debug, info};

use crate::config::{TARGET_CPU, TARGET_OS, TargetConfig};
use crate::engine::error::ResolveError;
use crate::engine::performers::MetadataPool;
use crate::engine::range::VersionRange;
use crate::engine::types::{PackageMetadata, ResolvedTree, VersionMetadata};

/// OS/CPU pair used to filter platform-specific dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub cpu: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: TARGET_OS.to_string(),
            cpu: TARGET_CPU.to_string(),
        }
    }
}

impl From<&TargetConfig> for Platform {
    fn from(target: &TargetConfig) -> Self {
        Self {
            os: target.os.clone(),
            cpu: target.cpu.clone(),
        }
    }
}

/// (name, version) pairs from the root down to the package being expanded
type Path = Vec<(String, String)>;

pub struct Resolver {
    metadata: Arc<MetadataPool>,
    platform: Platform,
}

impl Resolver {
    pub fn new(metadata: Arc<MetadataPool>, platform: Platform) -> Self {
        Self { metadata, platform }
    }

    pub fn metadata(&self) -> &Arc<MetadataPool> {
        &self.metadata
    }

    /// Resolves `version` of `package` (the `latest` tag when empty).
    ///
    /// Only an unknown root version fails; problems with individual
    /// dependencies end up in the tree's error list.
    pub async fn resolve(
        &self,
        package: &PackageMetadata,
        version: &str,
    ) -> Result<ResolvedTree, ResolveError> {
        let root = if version.is_empty() {
            package.latest_version().ok_or_else(|| {
                ResolveError::NotFound(format!("{} has no latest version", package.name))
            })?
        } else {
            package
                .versions
                .get(version)
                .ok_or_else(|| ResolveError::NotFound(format!("{}@{}", package.name, version)))?
        };

        let time = package.time.get(&root.version).copied();
        let mut tree = ResolvedTree::new(root.clone(), time);
        self.resolve_manifest(&mut tree, false).await;
        Ok(tree)
    }

    /// Expands the dependencies of `tree.info` into `tree`.
    ///
    /// `include_dev` applies to the root manifest only.
    pub async fn resolve_manifest(&self, tree: &mut ResolvedTree, include_dev: bool) {
        let root = tree.info.clone();
        let mut path = vec![(root.name.clone(), root.version.clone())];

        self.gather(&root, tree, include_dev, &mut path).await;

        info!(
            "Resolved {}@{}: {} packages, {} versions, {} errors",
            root.name,
            root.version,
            tree.stats.packages,
            tree.stats.versions,
            tree.errors.len()
        );
    }

    fn gather<'a>(
        &'a self,
        manifest: &'a VersionMetadata,
        tree: &'a mut ResolvedTree,
        include_dev: bool,
        path: &'a mut Path,
    ) -> BoxFuture<'a, ()> {
        async move {
            let mut edges: Vec<(&String, &String)> = manifest.dependencies.iter().collect();
            if include_dev {
                edges.extend(manifest.dev_dependencies.iter());
            }
            if edges.is_empty() {
                return;
            }

            // Fan out every fetch before awaiting any of them
            let pending: Vec<_> = edges
                .iter()
                .map(|(name, _)| self.metadata.process(name))
                .collect();
            let fetched = join_all(pending.iter().map(|deferred| deferred.wait())).await;

            for ((name, constraint), outcome) in edges.into_iter().zip(fetched) {
                let package = match outcome {
                    Ok(package) => package,
                    Err(e) => {
                        tree.errors.push(format!("could not get {}: {}", name, e));
                        continue;
                    }
                };

                let range = match constraint.parse::<VersionRange>() {
                    Ok(range) => range,
                    Err(e) => {
                        tree.errors.push(format!("{} for {}", e, name));
                        continue;
                    }
                };

                let Some(child) = range
                    .max_satisfying(package.versions.keys().map(String::as_str))
                    .and_then(|version| package.versions.get(version))
                else {
                    tree.errors.push(format!(
                        "no matching version for {} constraint {}",
                        name, constraint
                    ));
                    continue;
                };

                if !child.matches_platform(&self.platform.os, &self.platform.cpu) {
                    debug!(
                        "Skipping {}@{}: not available on {}/{}",
                        name, child.version, self.platform.os, self.platform.cpu
                    );
                    continue;
                }

                if tree
                    .dependencies
                    .get(name.as_str())
                    .is_some_and(|versions| range.matches_any(versions))
                {
                    continue;
                }

                if path
                    .iter()
                    .any(|(n, v)| n == name && *v == child.version)
                {
                    tree.errors.push(cycle_message(path, name, &child.version));
                    continue;
                }

                merge_child(tree, name, child);

                path.push((name.clone(), child.version.clone()));
                self.gather(child, tree, false, path).await;
                path.pop();
            }
        }
        .boxed()
    }
}

fn merge_child(tree: &mut ResolvedTree, name: &str, child: &VersionMetadata) {
    match tree.dependencies.get_mut(name) {
        Some(versions) => versions.push(child.version.clone()),
        None => {
            tree.dependencies
                .insert(name.to_string(), vec![child.version.clone()]);
            tree.stats.packages += 1;
        }
    }

    let publisher = child.publisher();
    if !publisher.is_empty() {
        *tree.publishers.entry(publisher).or_default() += 1;
    }

    tree.stats.versions += 1;
    tree.stats.files += child.dist.file_count;
    tree.stats.disk_space += child.dist.unpacked_size;
}

fn cycle_message(path: &Path, name: &str, version: &str) -> String {
    let start = path
        .iter()
        .position(|(n, v)| n == name && v == version)
        .unwrap_or(0);
    let mut hops: Vec<String> = path[start..]
        .iter()
        .map(|(n, v)| format!("{}@{}", n, v))
        .collect();
    hops.push(format!("{}@{}", name, version));
    format!("dependency cycle: {}", hops.join(" -> "))
}
