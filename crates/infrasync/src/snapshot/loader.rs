//! Reads and writes resource files in a tenant's working tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::resource::{RepositoryResource, ResourceDocument, ResourceKind};
use crate::repository::error::{RepositoryError, Result};

/// Extension used when writing resource files.
pub const RESOURCE_EXTENSION: &str = "yml";

/// Resource file access rooted at a tenant's clone directory.
pub struct SnapshotLoader {
    root: PathBuf,
}

impl SnapshotLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scans every kind directory and returns the valid resources.
    ///
    /// Invalid files are skipped with a warning. When two resources of
    /// different kinds share a name, both are dropped.
    pub fn load(&self) -> Result<Vec<RepositoryResource>> {
        if !self.root.is_dir() {
            return Err(RepositoryError::ReadDirectory {
                path: self.root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing clone"),
            });
        }

        let mut loaded = Vec::new();
        for kind in ResourceKind::all() {
            loaded.extend(self.scan_kind(*kind));
        }

        Ok(drop_name_collisions(loaded))
    }

    fn scan_kind(&self, kind: ResourceKind) -> Vec<RepositoryResource> {
        let dir = self.root.join(kind.directory());
        if !dir.is_dir() {
            return Vec::new();
        }

        // Resources sit directly in their kind directory, where `find_file` looks.
        let mut resources: BTreeMap<String, RepositoryResource> = BTreeMap::new();
        for entry in WalkDir::new(&dir)
            .max_depth(1)
            .sort_by_file_name()
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || !is_resource_file(path) || self.is_hidden(path) {
                continue;
            }

            let resource = match self.load_file(path) {
                Ok(resource) => resource,
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if resource.kind != kind {
                if resource.kind.directory() != kind.directory() {
                    log::warn!(
                        "Skipping {}: {} resource found in '{}' directory",
                        path.display(),
                        resource.kind,
                        kind.directory()
                    );
                }
                // Otherwise the directory is shared and the owning kind's scan picks it up.
                continue;
            }

            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if stem != resource.name() {
                log::warn!(
                    "Skipping {}: file name does not match resource name '{}'",
                    path.display(),
                    resource.name()
                );
                continue;
            }

            if resources.contains_key(resource.name()) {
                let preferred = self.find_file(kind, resource.name());
                log::warn!(
                    "Duplicate files for {}/{}, keeping {}",
                    kind,
                    resource.name(),
                    preferred
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                );
                if preferred.as_deref() != Some(path) {
                    continue;
                }
            }
            resources.insert(resource.name().to_string(), resource);
        }
        resources.into_values().collect()
    }

    fn is_hidden(&self, path: &Path) -> bool {
        path.strip_prefix(&self.root)
            .map(|relative| {
                relative.components().any(|c| {
                    c.as_os_str()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Loads a single resource file.
    pub fn load_file(&self, path: &Path) -> Result<RepositoryResource> {
        let content = fs::read_to_string(path).map_err(|e| RepositoryError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.parse_resource(&content, path)
    }

    /// Parses a resource document from YAML content.
    pub fn parse_resource(&self, content: &str, path: &Path) -> Result<RepositoryResource> {
        let doc: ResourceDocument =
            serde_yaml::from_str(content).map_err(|e| RepositoryError::ParseYaml {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if doc.metadata.name.trim().is_empty() {
            return Err(RepositoryError::InvalidResource {
                path: path.to_path_buf(),
                message: "metadata.name is empty".to_string(),
            });
        }

        Ok(RepositoryResource::from_document(doc))
    }

    /// Path a new resource file is written to.
    pub fn resource_path(&self, kind: ResourceKind, name: &str) -> PathBuf {
        self.root
            .join(kind.directory())
            .join(format!("{}.{}", name, RESOURCE_EXTENSION))
    }

    /// Locates the existing file of a resource, whichever YAML extension it uses.
    pub fn find_file(&self, kind: ResourceKind, name: &str) -> Option<PathBuf> {
        let dir = self.root.join(kind.directory());
        ["yml", "yaml"]
            .iter()
            .map(|ext| dir.join(format!("{}.{}", name, ext)))
            .find(|p| p.is_file())
    }

    /// Writes a new resource. Fails if the resource file already exists.
    pub fn add(&self, resource: &RepositoryResource) -> Result<()> {
        validate_name(resource.name())?;
        if self.find_file(resource.kind, resource.name()).is_some() {
            return Err(RepositoryError::ResourceAlreadyExists {
                kind: resource.kind.to_string(),
                name: resource.name().to_string(),
            });
        }
        self.write_resource(resource, &self.resource_path(resource.kind, resource.name()))
    }

    /// Overwrites an existing resource. Fails if there is no such file.
    pub fn update(&self, resource: &RepositoryResource) -> Result<()> {
        let path = self
            .find_file(resource.kind, resource.name())
            .ok_or_else(|| RepositoryError::ResourceNotFound {
                kind: resource.kind.to_string(),
                name: resource.name().to_string(),
            })?;
        self.write_resource(resource, &path)
    }

    /// Deletes an existing resource. Fails if there is no such file.
    pub fn remove(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let path = self
            .find_file(kind, name)
            .ok_or_else(|| RepositoryError::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        fs::remove_file(&path).map_err(|e| RepositoryError::WriteFile { path, source: e })
    }

    fn write_resource(&self, resource: &RepositoryResource, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RepositoryError::WriteFile {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let content = serde_yaml::to_string(&resource.to_document())
            .map_err(|e| RepositoryError::SerializeYaml(e.to_string()))?;

        fs::write(path, content).map_err(|e| RepositoryError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn is_resource_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(RepositoryError::InvalidResource {
            path: PathBuf::from(name),
            message: "resource name must be a plain file name".to_string(),
        });
    }
    Ok(())
}

/// Drops every resource whose name is also used by a resource of another kind.
fn drop_name_collisions(resources: Vec<RepositoryResource>) -> Vec<RepositoryResource> {
    let mut kinds_by_name: BTreeMap<&str, BTreeSet<ResourceKind>> = BTreeMap::new();
    for resource in &resources {
        kinds_by_name
            .entry(resource.name())
            .or_default()
            .insert(resource.kind);
    }

    let ambiguous: Vec<String> = kinds_by_name
        .into_iter()
        .filter(|(_, kinds)| kinds.len() > 1)
        .map(|(name, _)| name.to_string())
        .collect();

    if ambiguous.is_empty() {
        return resources;
    }

    for name in &ambiguous {
        let kinds: Vec<String> = resources
            .iter()
            .filter(|r| r.name() == name)
            .map(|r| r.kind.to_string())
            .collect();
        log::warn!(
            "Dropping resources named '{}': name is used by [{}]",
            name,
            kinds.join(", ")
        );
    }

    resources
        .into_iter()
        .filter(|r| !ambiguous.iter().any(|n| n == r.name()))
        .collect()
}
