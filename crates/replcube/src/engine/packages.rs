//! Package resolution
//!
//! Turns `name@version` references into artifact paths. Two resolvers ship
//! with the crate: an in-memory catalogue and a local package cache directory.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::engine::ResolvedReference;
use crate::types::ExternalReference;

/// Errors from resolving a single reference
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("package '{name}' ({version}) was not found")]
    NotFound { name: String, version: String },

    #[error("package '{name}' has no artifacts")]
    Empty { name: String },

    #[error("failed to read package cache at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ResolveError {
    fn not_found(reference: &ExternalReference) -> Self {
        ResolveError::NotFound {
            name: reference.name.clone(),
            version: reference.version_label().to_string(),
        }
    }
}

/// Resolves package references to artifacts
#[async_trait]
pub trait PackageResolver: Send + Sync + fmt::Debug {
    async fn resolve(
        &self,
        reference: &ExternalReference,
    ) -> Result<ResolvedReference, ResolveError>;
}

/// Compare dotted version strings numerically where possible
///
/// `1.10.0` sorts after `1.9.2`; non-numeric parts compare as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-']);
    let mut right = b.split(['.', '-']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// In-memory catalogue of packages
#[derive(Debug, Clone, Default)]
pub struct StaticPackageResolver {
    /// lowercase name -> version -> artifacts
    packages: HashMap<String, BTreeMap<String, (String, Vec<PathBuf>)>>,
}

impl StaticPackageResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package version with its artifacts
    pub fn with_package(
        mut self,
        name: &str,
        version: &str,
        artifacts: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.packages.entry(name.to_lowercase()).or_default().insert(
            version.to_string(),
            (
                name.to_string(),
                artifacts.into_iter().map(Into::into).collect(),
            ),
        );
        self
    }
}

#[async_trait]
impl PackageResolver for StaticPackageResolver {
    async fn resolve(
        &self,
        reference: &ExternalReference,
    ) -> Result<ResolvedReference, ResolveError> {
        let versions = self
            .packages
            .get(&reference.name.to_lowercase())
            .ok_or_else(|| ResolveError::not_found(reference))?;

        let (version, (name, artifacts)) = match &reference.version {
            Some(wanted) => versions
                .get_key_value(wanted)
                .ok_or_else(|| ResolveError::not_found(reference))?,
            None => versions
                .iter()
                .max_by(|(a, _), (b, _)| compare_versions(a, b))
                .ok_or_else(|| ResolveError::not_found(reference))?,
        };

        Ok(ResolvedReference {
            reference: ExternalReference::new(name.clone(), Some(version.clone())),
            artifacts: artifacts.clone(),
        })
    }
}

/// Local package cache laid out as `<root>/<name>/<version>/<artifacts>`
///
/// Name matching ignores case. "latest" picks the highest version directory.
#[derive(Debug, Clone)]
pub struct DirectoryPackageResolver {
    root: PathBuf,
}

impl DirectoryPackageResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn subdirectories(path: &Path) -> Result<Vec<(String, PathBuf)>, ResolveError> {
        let io_err = |source| ResolveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(path).await.map_err(io_err)?;
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if entry.file_type().await.map_err(io_err)?.is_dir() {
                dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
        Ok(dirs)
    }
}

#[async_trait]
impl PackageResolver for DirectoryPackageResolver {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn resolve(
        &self,
        reference: &ExternalReference,
    ) -> Result<ResolvedReference, ResolveError> {
        let (name, package_dir) = Self::subdirectories(&self.root)
            .await?
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&reference.name))
            .ok_or_else(|| ResolveError::not_found(reference))?;

        let versions = Self::subdirectories(&package_dir).await?;
        let (version, version_dir) = match &reference.version {
            Some(wanted) => versions.into_iter().find(|(v, _)| v == wanted),
            None => versions
                .into_iter()
                .max_by(|(a, _), (b, _)| compare_versions(a, b)),
        }
        .ok_or_else(|| ResolveError::not_found(reference))?;

        let io_err = |source| ResolveError::Io {
            path: version_dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&version_dir).await.map_err(io_err)?;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            if entry.file_type().await.map_err(io_err)?.is_file() {
                artifacts.push(entry.path());
            }
        }
        if artifacts.is_empty() {
            return Err(ResolveError::Empty { name });
        }
        artifacts.sort();

        debug!(package = %name, %version, count = artifacts.len(), "package resolved");
        Ok(ResolvedReference {
            reference: ExternalReference::new(name, Some(version)),
            artifacts,
        })
    }
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn version_order_is_antisymmetric(a in "[0-9]{1,3}(\\.[0-9]{1,3}){0,3}", b in "[0-9]{1,3}(\\.[0-9]{1,3}){0,3}") {
            prop_assert_eq!(compare_versions(&a, &b), compare_versions(&b, &a).reverse());
            prop_assert_eq!(compare_versions(&a, &a), Ordering::Equal);
        }
    }
}
