//! Plugin manifest model and validation.
//!
//! A bundle is a directory holding a `plugin.json` manifest and the SQL files
//! its migrations point at. Manifests are parsed with serde (camelCase keys)
//! and validated before a descriptor is handed to the rest of the runtime.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::schema::ConfigSchema;

pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Admin sub-paths owned by the host; admin-scoped plugin routes may not use them.
pub const RESERVED_ADMIN_SEGMENTS: &[&str] = &["enable", "disable", "toggle", "reload", "config"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    pub method: HttpMethod,
    /// Path relative to the plugin namespace, starting with `/`. Project
    /// routes may also be written as `/plugin/{id}/...`, relative to the
    /// project.
    pub path: String,
    #[serde(default)]
    pub middleware: Vec<String>,
    /// Name of the handler exported by the plugin module.
    pub handler: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    pub id: String,
    #[serde(default = "any_version")]
    pub version_range: VersionReq,
}

fn any_version() -> VersionReq {
    VersionReq::STAR
}

fn zero_version() -> Version {
    Version::new(0, 0, 0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationEntry {
    pub version: u32,
    pub name: String,
    /// Bundle-relative path of the forward SQL.
    pub up: String,
    #[serde(default)]
    pub down: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleHook {
    OnLoad,
    OnActivate,
    OnDeactivate,
    OnUnload,
}

impl LifecycleHook {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnLoad => "onLoad",
            Self::OnActivate => "onActivate",
            Self::OnDeactivate => "onDeactivate",
            Self::OnUnload => "onUnload",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUiPage {
    pub path: String,
    pub label: String,
}

/// Opaque admin UI metadata surfaced to the console.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUiMeta {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub pages: Vec<AdminUiPage>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub version: Version,
    #[serde(default = "zero_version")]
    pub host_min_version: Version,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
    #[serde(default)]
    pub migrations: Vec<MigrationEntry>,
    #[serde(default)]
    pub admin_ui: Option<AdminUiMeta>,
    #[serde(default)]
    pub lifecycle_hooks: BTreeSet<LifecycleHook>,
}

impl PluginManifest {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn implements(&self, hook: LifecycleHook) -> bool {
        self.lifecycle_hooks.contains(&hook)
    }

    /// Highest migration version the bundle ships, 0 when it has none.
    pub fn max_migration_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    pub fn dependency(&self, id: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|d| d.id == id)
    }

    /// Validates the manifest against the running host version.
    ///
    /// Returns a human-readable reason on the first violation.
    pub fn validate(&self, host_version: &Version) -> Result<(), String> {
        validate_plugin_id(&self.id)?;

        if &self.host_min_version > host_version {
            return Err(format!(
                "requires host {} or newer, running {host_version}",
                self.host_min_version
            ));
        }

        let mut seen_deps = HashSet::new();
        for dep in &self.dependencies {
            validate_plugin_id(&dep.id).map_err(|e| format!("dependency: {e}"))?;
            if dep.id == self.id {
                return Err("plugin depends on itself".to_string());
            }
            if !seen_deps.insert(dep.id.as_str()) {
                return Err(format!("dependency `{}` listed twice", dep.id));
            }
        }

        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            validate_route_path(&route.path)
                .map_err(|e| format!("route {} {}: {e}", route.method, route.path))?;
            if route.handler.trim().is_empty() {
                return Err(format!("route {} {} has no handler", route.method, route.path));
            }
            if route.middleware.iter().any(|t| t.trim().is_empty()) {
                return Err(format!("route {} {} has an empty middleware tag", route.method, route.path));
            }
            if route.admin {
                let first = route.path.trim_start_matches('/').split('/').next().unwrap_or("");
                if RESERVED_ADMIN_SEGMENTS.contains(&first) {
                    return Err(format!("admin route {} uses reserved segment `{first}`", route.path));
                }
            }
            if !seen_routes.insert((route.method, route.path.as_str(), route.admin)) {
                return Err(format!("route {} {} declared twice", route.method, route.path));
            }
        }

        let mut previous = 0u32;
        for migration in &self.migrations {
            if migration.version <= previous {
                return Err(format!(
                    "migration versions must be positive and strictly increasing ({} after {previous})",
                    migration.version
                ));
            }
            if migration.name.trim().is_empty() || migration.up.trim().is_empty() {
                return Err(format!("migration {} needs a name and an up script", migration.version));
            }
            previous = migration.version;
        }

        self.config_schema
            .check_definition()
            .map_err(|errors| format!("config schema: {}", errors.join("; ")))?;

        Ok(())
    }
}

/// Plugin ids are lowercase, start alphanumeric and contain only `[a-z0-9_.-]`.
pub fn validate_plugin_id(id: &str) -> Result<(), String> {
    let mut chars = id.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(c));
    if !valid_first || !valid_rest || id.len() > 64 {
        return Err(format!("invalid plugin id `{id}`"));
    }
    Ok(())
}

/// Checks that a declared route path stays inside its namespace.
pub fn validate_route_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err("path must start with `/`".to_string());
    }
    if path.contains(['?', '#', '\\', '%']) {
        return Err("path may not contain query, fragment, backslash or escapes".to_string());
    }
    if path == "/" {
        return Ok(());
    }
    let body = path.strip_suffix('/').unwrap_or(path);
    let segments: Vec<&str> = body[1..].split('/').collect();
    for (idx, segment) in segments.iter().enumerate() {
        match *segment {
            "" => return Err("path has an empty segment".to_string()),
            "." | ".." => return Err("path escapes its namespace".to_string()),
            s if s.starts_with(':') && s.len() == 1 => {
                return Err("parameter needs a name".to_string())
            }
            s if s.starts_with('*') && idx + 1 != segments.len() => {
                return Err("wildcard must be the last segment".to_string())
            }
            _ => {}
        }
    }
    Ok(())
}
