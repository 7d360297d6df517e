use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};
use crate::lifecycle::HookTimeouts;

/// Store location that keeps a project entirely in memory.
pub const MEMORY_STORE: &str = ":memory:";

/// Persisted configuration of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Store file path, [`MEMORY_STORE`], or `None` for the host's pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSettings>,
    /// Aliases from plugin-declared middleware tags to registered capabilities.
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

/// Per-plugin entry of a project's enable map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettings {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<HookTimeouts>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            config: None,
            timeouts: None,
        }
    }
}

impl PluginSettings {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_timeouts(mut self, timeouts: HookTimeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }
}

impl ProjectConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            store: None,
            plugins: BTreeMap::new(),
            capabilities: BTreeMap::new(),
        }
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>, settings: PluginSettings) -> Self {
        self.plugins.insert(plugin_id.into(), settings);
        self
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn in_memory(self) -> Self {
        self.with_store(MEMORY_STORE)
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn enabled_set(&self) -> BTreeSet<String> {
        self.plugins
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_enabled(&self, plugin_id: &str) -> bool {
        self.plugins.get(plugin_id).is_some_and(|s| s.enabled)
    }

    pub fn is_required(&self, plugin_id: &str) -> bool {
        self.plugins.get(plugin_id).is_some_and(|s| s.enabled && s.required)
    }

    /// Sets the enabled flag, adding an entry if the plugin had none.
    pub fn set_enabled(&mut self, plugin_id: &str, enabled: bool) {
        self.plugins.entry(plugin_id.to_string()).or_default().enabled = enabled;
    }

    pub fn validate(&self) -> Result<()> {
        validate_project_id(&self.id)?;
        if let Some(store) = &self.store {
            if store.trim().is_empty() {
                return Err(RuntimeError::invalid_input(format!(
                    "project `{}` has an empty store location",
                    self.id
                )));
            }
        }
        for (tag, target) in &self.capabilities {
            if tag.is_empty() || target.is_empty() {
                return Err(RuntimeError::invalid_input(format!(
                    "project `{}` has an empty capability alias",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Project ids appear in URLs and file names: `[a-z0-9_-]`, 1..=64 chars.
pub fn validate_project_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::invalid_input(format!("invalid project id `{id}`")))
    }
}
