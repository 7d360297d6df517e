//! Bundle discovery.
//!
//! The loader walks its configured roots in order (core, bundled, user or any
//! order the host gives it), visits bundle directories sorted by name and
//! produces one [`PluginDescriptor`] per valid bundle. Invalid bundles are
//! rejected individually without stopping the scan.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::manifest::{PluginManifest, MANIFEST_FILE_NAME};
use crate::migration::Migration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    Core,
    Bundled,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRoot {
    pub kind: RootKind,
    pub path: PathBuf,
}

impl PluginRoot {
    pub fn new(kind: RootKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// A validated bundle on disk.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub manifest: Arc<PluginManifest>,
    pub bundle_root: PathBuf,
    pub root_kind: RootKind,
    pub discovered_at: DateTime<Utc>,
}

impl PluginDescriptor {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn version(&self) -> &Version {
        &self.manifest.version
    }

    /// Reads the migration scripts the manifest points at.
    pub async fn read_migrations(&self) -> Result<Vec<Migration>> {
        let mut migrations = Vec::with_capacity(self.manifest.migrations.len());
        for entry in &self.manifest.migrations {
            let up = self.read_script(&entry.up).await?;
            let down = match &entry.down {
                Some(path) => Some(self.read_script(path).await?),
                None => None,
            };
            migrations.push(Migration::sql(entry.version, entry.name.clone(), &up, down.as_deref()));
        }
        Ok(migrations)
    }

    async fn read_script(&self, relative: &str) -> Result<String> {
        let path = bundle_file(&self.bundle_root, relative)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RuntimeError::invalid_manifest(&path, format!("cannot read migration: {e}")))
    }
}

/// Result of scanning every root.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub descriptors: BTreeMap<String, PluginDescriptor>,
    pub rejected: Vec<RuntimeError>,
}

#[derive(Debug, Clone)]
pub struct PluginLoader {
    roots: Vec<PluginRoot>,
    host_version: Version,
}

impl PluginLoader {
    pub fn new(roots: Vec<PluginRoot>, host_version: Version) -> Self {
        Self {
            roots,
            host_version,
        }
    }

    pub fn roots(&self) -> &[PluginRoot] {
        &self.roots
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Scans all roots. The first bundle to claim an id wins; later ones are
    /// reported as [`RuntimeError::DuplicateManifest`].
    pub async fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for root in &self.roots {
            let bundles = match list_bundles(&root.path).await {
                Ok(bundles) => bundles,
                Err(e) => {
                    warn!(root = %root.path.display(), error = %e, "skipping unreadable plugin root");
                    continue;
                }
            };

            for bundle in bundles {
                match self.load_bundle(&bundle, root.kind).await {
                    Ok(descriptor) => {
                        if let Some(existing) = report.descriptors.get(descriptor.id()) {
                            let err = RuntimeError::DuplicateManifest {
                                id: descriptor.id().to_string(),
                                existing: existing.bundle_root.clone(),
                                duplicate: descriptor.bundle_root.clone(),
                            };
                            warn!(error = %err, "duplicate plugin bundle");
                            report.rejected.push(err);
                            continue;
                        }
                        debug!(plugin = descriptor.id(), version = %descriptor.version(), "discovered bundle");
                        report.descriptors.insert(descriptor.id().to_string(), descriptor);
                    }
                    Err(err) => {
                        warn!(bundle = %bundle.display(), error = %err, "rejected plugin bundle");
                        report.rejected.push(err);
                    }
                }
            }
        }

        info!(
            "🔍 Discovered {} plugin bundle(s), rejected {}",
            report.descriptors.len(),
            report.rejected.len()
        );
        report
    }

    /// Parses and validates a single bundle directory.
    pub async fn load_bundle(&self, bundle: &Path, kind: RootKind) -> Result<PluginDescriptor> {
        let manifest_path = bundle.join(MANIFEST_FILE_NAME);
        let raw = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RuntimeError::invalid_manifest(bundle, format!("missing {MANIFEST_FILE_NAME}")))
            }
            Err(e) => return Err(RuntimeError::invalid_manifest(&manifest_path, e.to_string())),
        };

        let manifest: PluginManifest = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::invalid_manifest(&manifest_path, e.to_string()))?;
        manifest
            .validate(&self.host_version)
            .map_err(|reason| RuntimeError::invalid_manifest(&manifest_path, reason))?;

        for entry in &manifest.migrations {
            for script in std::iter::once(&entry.up).chain(entry.down.as_ref()) {
                let path = bundle_file(bundle, script)?;
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(RuntimeError::invalid_manifest(
                        &manifest_path,
                        format!("migration {} references missing file `{script}`", entry.version),
                    ));
                }
            }
        }

        Ok(PluginDescriptor {
            manifest: Arc::new(manifest),
            bundle_root: bundle.to_path_buf(),
            root_kind: kind,
            discovered_at: Utc::now(),
        })
    }

    /// Rescans the roots and returns the bundle currently providing `id`.
    pub async fn find(&self, id: &str) -> Result<PluginDescriptor> {
        self.discover()
            .await
            .descriptors
            .remove(id)
            .ok_or_else(|| RuntimeError::not_found("plugin bundle", id))
    }
}

async fn list_bundles(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut bundles = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            bundles.push(entry.path());
        }
    }
    bundles.sort();
    Ok(bundles)
}

/// Resolves a bundle-relative path, refusing anything that leaves the bundle.
fn bundle_file(bundle: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let escapes = rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(RuntimeError::invalid_manifest(
            bundle,
            format!("`{relative}` points outside the bundle"),
        ));
    }
    Ok(bundle.join(rel))
}
