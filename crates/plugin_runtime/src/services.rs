//! Process-wide collaborators shared by every project.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audit::AuditLog;
use crate::capabilities::CapabilityRegistry;
use crate::catalog::PluginCatalog;
use crate::lifecycle::HookTimeouts;
use crate::loader::PluginLoader;
use crate::project::{ProjectConfig, MEMORY_STORE};
use crate::routes::RouteMountController;
use crate::storage::StoreLocation;

pub const DEFAULT_STORE_PATTERN: &str = "{data_dir}/projects/{project}.db";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub data_dir: PathBuf,
    /// Path pattern with `{data_dir}` and `{project}` placeholders.
    pub store_pattern: String,
    pub default_timeouts: HookTimeouts,
}

impl RuntimeSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            store_pattern: DEFAULT_STORE_PATTERN.to_string(),
            default_timeouts: HookTimeouts::default(),
        }
    }

    /// Where a project's store lives. Relative explicit paths are taken from
    /// the data dir.
    pub fn store_location(&self, config: &ProjectConfig) -> StoreLocation {
        match config.store.as_deref() {
            Some(MEMORY_STORE) => StoreLocation::Memory,
            Some(path) => StoreLocation::File(self.under_data_dir(Path::new(path))),
            None => {
                let expanded = self
                    .store_pattern
                    .replace("{data_dir}", &self.data_dir.to_string_lossy())
                    .replace("{project}", &config.id);
                StoreLocation::File(PathBuf::from(expanded))
            }
        }
    }

    fn under_data_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Everything a project context borrows from the host.
#[derive(Clone)]
pub struct RuntimeServices {
    pub loader: PluginLoader,
    pub catalog: Arc<PluginCatalog>,
    pub routes: Arc<RouteMountController>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub audit: AuditLog,
    pub settings: RuntimeSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_locations() {
        let settings = RuntimeSettings::new("/var/playhost");
        let default = ProjectConfig::new("alpha");
        assert_eq!(
            settings.store_location(&default),
            StoreLocation::File(PathBuf::from("/var/playhost/projects/alpha.db"))
        );
        assert_eq!(
            settings.store_location(&ProjectConfig::new("beta").in_memory()),
            StoreLocation::Memory
        );
        assert_eq!(
            settings.store_location(&ProjectConfig::new("gamma").with_store("custom/g.db")),
            StoreLocation::File(PathBuf::from("/var/playhost/custom/g.db"))
        );
    }
}
