//! The context object handed to plugin lifecycle hooks.

use std::sync::{Arc, Mutex, PoisonError};

use semver::Version;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capabilities::{Middleware, ProjectCapabilities};
use crate::error::PluginError;
use crate::lifecycle::resources::ResourceScope;
use crate::routes::ConfigCell;
use crate::storage::StorageHandle;

/// Log levels available to plugin code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Critical errors that may affect the plugin's operation
    Error,
    /// Conditions worth investigating
    Warn,
    /// General informational messages
    Info,
    /// Detailed information for debugging
    Debug,
    /// Very detailed trace information
    Trace,
}

/// Everything a plugin may touch from its hooks.
///
/// Cloning is cheap; clones share the same resource scope, stash and
/// cancellation token.
#[derive(Clone)]
pub struct PluginContext {
    project_id: Arc<str>,
    plugin_id: Arc<str>,
    version: Version,
    storage: StorageHandle,
    config: ConfigCell,
    capabilities: ProjectCapabilities,
    resources: ResourceScope,
    cancel: CancellationToken,
    previous_state: Option<Arc<Value>>,
    stash: Arc<Mutex<Option<Value>>>,
}

impl PluginContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        project_id: &str,
        plugin_id: &str,
        version: Version,
        storage: StorageHandle,
        config: ConfigCell,
        capabilities: ProjectCapabilities,
        resources: ResourceScope,
        cancel: CancellationToken,
        previous_state: Option<Value>,
    ) -> Self {
        Self {
            project_id: Arc::from(project_id),
            plugin_id: Arc::from(plugin_id),
            version,
            storage,
            config,
            capabilities,
            resources,
            cancel,
            previous_state: previous_state.map(Arc::new),
            stash: Arc::new(Mutex::new(None)),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// The project's store, scoped to this plugin's lifetime.
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// Current validated configuration, defaults applied.
    pub fn config(&self) -> Arc<Value> {
        self.config.load_full()
    }

    /// Deserializes the current configuration into `T`.
    pub fn typed_config<T: DeserializeOwned>(&self) -> Result<T, PluginError> {
        serde_json::from_value(Value::clone(&self.config.load()))
            .map_err(|e| PluginError::Config(e.to_string()))
    }

    /// Looks up a capability by tag, honouring project aliases.
    pub fn capability(&self, tag: &str) -> Option<Arc<dyn Middleware>> {
        self.capabilities.lookup(tag)
    }

    pub fn capability_tags(&self) -> Vec<String> {
        self.capabilities.tags()
    }

    pub fn resources(&self) -> &ResourceScope {
        &self.resources
    }

    /// Cancelled once `on_deactivate` has returned, or as soon as the project
    /// starts closing. Long-running work should watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// State stashed by the instance this one replaced during a same-version
    /// reload.
    pub fn previous_state(&self) -> Option<&Value> {
        self.previous_state.as_deref()
    }

    /// Stores state for a future same-version replacement to pick up.
    pub fn stash_state(&self, state: Value) {
        *self.stash.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
    }

    pub(crate) fn stashed_state(&self) -> Option<Value> {
        self.stash
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Writes a log line attributed to this plugin.
    pub fn log(&self, level: LogLevel, message: &str) {
        let project = &*self.project_id;
        let plugin = &*self.plugin_id;
        match level {
            LogLevel::Error => error!(project, plugin, "{message}"),
            LogLevel::Warn => warn!(project, plugin, "{message}"),
            LogLevel::Info => info!(project, plugin, "{message}"),
            LogLevel::Debug => debug!(project, plugin, "{message}"),
            LogLevel::Trace => trace!(project, plugin, "{message}"),
        }
    }
}
