//! Per-project aggregate: store, plugin instances, enable map and state.
//!
//! A [`ProjectContext`] is only ever driven by one task at a time; the
//! registry wraps it in a mutex. Request handlers never touch it, they go
//! through the route controller's snapshot instead.

mod config;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::{validate_project_id, PluginSettings, ProjectConfig, MEMORY_STORE};

use crate::audit::{AuditAction, AuditEntry, SYSTEM_ACTOR};
use crate::capabilities::ProjectCapabilities;
use crate::catalog::DeactivationReason;
use crate::core_tables::project_migrations;
use crate::error::{Result, RuntimeError};
use crate::lifecycle::{
    roll_back_migrations, DeactivationReport, LifecycleEnv, PluginInstance, PluginInstanceInfo, PluginState,
};
use crate::loader::PluginDescriptor;
use crate::migration::{plugin_owner, MigrationRunner, CORE_OWNER};
use crate::resolver::resolve;
use crate::services::RuntimeServices;
use crate::storage::{row_str, text, StorageHandle, StoreLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Initializing,
    Ready,
    Degraded,
    Closing,
    Closed,
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// An enabled plugin that could not be activated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedPlugin {
    pub plugin_id: String,
    pub error: String,
    pub message: String,
    pub details: Value,
}

impl BlockedPlugin {
    fn new(plugin_id: &str, err: &RuntimeError) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            error: err.tag().to_string(),
            message: err.to_string(),
            details: err.details(),
        }
    }

    fn is_dependency_failure(&self) -> bool {
        self.error.starts_with("Dependency")
    }
}

/// Read-only view published after every lifecycle operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub id: String,
    pub display_name: String,
    pub description: Option<String>,
    pub state: ProjectState,
    pub store: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub activation_order: Vec<String>,
    pub plugins: Vec<PluginInstanceInfo>,
    pub blocked: Vec<BlockedPlugin>,
    pub degraded_reasons: Vec<String>,
}

impl ProjectSnapshot {
    /// Snapshot of a project that has not been opened.
    pub fn closed(config: &ProjectConfig) -> Self {
        let now = Utc::now();
        Self {
            id: config.id.clone(),
            display_name: config.display_name().to_string(),
            description: config.description.clone(),
            state: ProjectState::Closed,
            store: String::new(),
            created_at: now,
            last_accessed_at: now,
            activation_order: Vec::new(),
            plugins: Vec::new(),
            blocked: Vec::new(),
            degraded_reasons: Vec::new(),
        }
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<&PluginInstanceInfo> {
        self.plugins.iter().find(|p| p.id == plugin_id)
    }

    pub fn active_plugins(&self) -> impl Iterator<Item = &PluginInstanceInfo> {
        self.plugins.iter().filter(|p| p.state == PluginState::Active)
    }
}

/// Outcome of disabling a plugin and its active dependents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableOutcome {
    pub plugin_id: String,
    /// Deactivations in the order they happened; dependents come first.
    pub reports: Vec<DeactivationReport>,
}

pub struct ProjectContext {
    config: ProjectConfig,
    services: RuntimeServices,
    storage: Option<StorageHandle>,
    capabilities: ProjectCapabilities,
    descriptors: BTreeMap<String, PluginDescriptor>,
    plugins: BTreeMap<String, PluginInstance>,
    order: Vec<String>,
    blocked: BTreeMap<String, BlockedPlugin>,
    state: ProjectState,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl ProjectContext {
    pub fn new(config: ProjectConfig, services: RuntimeServices) -> Self {
        let capabilities = ProjectCapabilities::new(services.capabilities.clone(), config.capabilities.clone());
        let now = Utc::now();
        Self {
            config,
            services,
            storage: None,
            capabilities,
            descriptors: BTreeMap::new(),
            plugins: BTreeMap::new(),
            order: Vec::new(),
            blocked: BTreeMap::new(),
            state: ProjectState::Initializing,
            created_at: now,
            last_accessed_at: now,
            cancel: CancellationToken::new(),
        }
    }

    /// Shares an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn state(&self) -> ProjectState {
        self.state
    }

    pub fn storage(&self) -> Option<&StorageHandle> {
        self.storage.as_ref()
    }

    /// Cancels lifecycle work in progress on this project.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn plugin(&self, plugin_id: &str) -> Option<&PluginInstance> {
        self.plugins.get(plugin_id)
    }

    /// Plugin ids in the order they were activated.
    pub fn activation_order(&self) -> &[String] {
        &self.order
    }

    pub fn active_set(&self) -> BTreeSet<String> {
        self.plugins
            .iter()
            .filter(|(_, p)| p.is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    fn env(&self, actor: &str) -> Result<LifecycleEnv> {
        let storage = self
            .storage
            .clone()
            .ok_or_else(|| RuntimeError::Conflict {
                resource: "closed project",
                id: self.config.id.clone(),
            })?;
        Ok(LifecycleEnv {
            project_id: self.config.id.clone(),
            storage,
            routes: self.services.routes.clone(),
            capabilities: self.capabilities.clone(),
            catalog: self.services.catalog.clone(),
            audit: self.services.audit.clone(),
            actor: actor.to_string(),
            cancel: self.cancel.clone(),
        })
    }

    fn audit(&self, action: AuditAction, actor: &str) -> AuditEntry {
        AuditEntry::new(self.config.id.as_str(), action).actor(actor)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ProjectState::Ready | ProjectState::Degraded => Ok(()),
            _ => Err(RuntimeError::Conflict {
                resource: "project in state",
                id: format!("{} ({})", self.config.id, self.state),
            }),
        }
    }

    // ========================================================================
    // Initialize / close
    // ========================================================================

    /// Opens the store, runs core migrations, discovers bundles and brings
    /// every enabled plugin up in dependency order.
    ///
    /// Returns once the project is `Ready` or `Degraded`. Only store failures
    /// are returned as errors; plugin failures degrade the project instead.
    pub async fn initialize(&mut self) -> Result<ProjectState> {
        info!(project = %self.config.id, "🚀 Initializing project");
        self.state = ProjectState::Initializing;

        let storage = match self.services.settings.store_location(&self.config) {
            StoreLocation::Memory => StorageHandle::open_in_memory()?,
            StoreLocation::File(path) => StorageHandle::open(path)?,
        };
        MigrationRunner::new(storage.clone()).migrate(CORE_OWNER, &project_migrations())?;
        self.created_at = seed_defaults(&storage, &self.config)?;
        self.storage = Some(storage);
        self.services.routes.attach_project(&self.config.id);

        let report = self.services.loader.discover().await;
        for rejected in &report.rejected {
            warn!(project = %self.config.id, error = %rejected, "⚠️ Skipping plugin bundle");
            self.services
                .audit
                .record(self.audit(AuditAction::Discovered, SYSTEM_ACTOR).error(rejected));
        }
        self.descriptors = report.descriptors;

        self.converge(SYSTEM_ACTOR).await?;
        self.refresh_state();
        self.touch();

        match self.state {
            ProjectState::Ready => info!(
                project = %self.config.id,
                active = self.order.len(),
                "✅ Project ready"
            ),
            _ => warn!(
                project = %self.config.id,
                reasons = ?self.degraded_reasons(),
                "⚠️ Project degraded"
            ),
        }
        Ok(self.state)
    }

    /// Deactivates every plugin in reverse activation order and returns the
    /// ids in the order they were visited.
    pub async fn deactivate_all(&mut self, actor: &str, reason: DeactivationReason) -> Vec<String> {
        let Ok(env) = self.env(actor) else {
            return Vec::new();
        };
        let mut visited = Vec::new();
        for id in self.order.clone().into_iter().rev() {
            if let Some(instance) = self.plugins.get_mut(&id) {
                if let Err(err) = instance.deactivate(&env, reason).await {
                    warn!(project = %env.project_id, plugin = %id, error = %err, "deactivate skipped");
                }
                visited.push(id);
            }
        }
        self.order.clear();
        visited
    }

    /// Tears the project down. Safe on degraded or half-initialized contexts.
    pub async fn close(&mut self, actor: &str) -> Result<()> {
        if self.state == ProjectState::Closed {
            return Ok(());
        }
        info!(project = %self.config.id, "🛑 Closing project");
        self.state = ProjectState::Closing;

        self.deactivate_all(actor, DeactivationReason::ProjectClosing).await;
        if let Ok(env) = self.env(actor) {
            for (id, instance) in self.plugins.iter_mut() {
                if instance.state() != PluginState::Unloaded {
                    if let Err(err) = instance.unload(&env).await {
                        debug!(project = %env.project_id, plugin = %id, error = %err, "unload skipped");
                    }
                }
            }
        }
        self.plugins.clear();
        self.blocked.clear();

        self.services.routes.detach_project(&self.config.id);
        if let Some(storage) = self.storage.take() {
            storage.close();
        }
        self.state = ProjectState::Closed;
        self.services
            .audit
            .record(self.audit(AuditAction::ProjectClosed, actor));
        Ok(())
    }

    // ========================================================================
    // Convergence
    // ========================================================================

    fn resolution_view(&self) -> BTreeMap<String, PluginDescriptor> {
        let mut view = self.descriptors.clone();
        for (id, instance) in &self.plugins {
            if instance.is_active() {
                view.insert(id.clone(), instance.descriptor().clone());
            }
        }
        view
    }

    /// Activates every enabled plugin that can be, in dependency order.
    /// Returns the per-plugin errors of this pass.
    async fn converge(&mut self, actor: &str) -> Result<BTreeMap<String, RuntimeError>> {
        let env = self.env(actor)?;
        let previous = std::mem::take(&mut self.blocked);
        let mut errors = BTreeMap::new();

        let resolution = resolve(&self.resolution_view(), &self.config.enabled_set());

        for id in &resolution.missing {
            let err = RuntimeError::not_found("plugin bundle", id);
            self.block(&env, &previous, id, &err);
            errors.insert(id.clone(), err);
        }

        for (id, err) in resolution.failures {
            if !self.plugins.get(&id).is_some_and(PluginInstance::is_active) {
                if let Err(load_err) = self.ensure_loaded(&env, &id).await {
                    errors.insert(id, load_err);
                    continue;
                }
            }
            self.block(&env, &previous, &id, &err);
            errors.insert(id, err);
        }

        for id in resolution.order {
            match self.plugins.get(&id).map(PluginInstance::state) {
                Some(PluginState::Active) | Some(PluginState::Failed) => continue,
                _ => {}
            }
            if let Some(err) = self.unmet_dependency(&id) {
                self.block(&env, &previous, &id, &err);
                errors.insert(id, err);
                continue;
            }
            if let Err(err) = self.ensure_loaded(&env, &id).await {
                errors.insert(id, err);
                continue;
            }
            let Some(instance) = self.plugins.get_mut(&id) else {
                continue;
            };
            match instance.activate(&env).await {
                Ok(()) => self.order.push(id),
                Err(err) => {
                    warn!(project = %env.project_id, plugin = %id, error = %err, "activation failed");
                    errors.insert(id, err);
                }
            }
        }
        Ok(errors)
    }

    fn block(&mut self, env: &LifecycleEnv, previous: &BTreeMap<String, BlockedPlugin>, id: &str, err: &RuntimeError) {
        let blocked = BlockedPlugin::new(id, err);
        let already_reported = previous
            .get(id)
            .is_some_and(|p| p.error == blocked.error && p.message == blocked.message);
        if !already_reported {
            warn!(project = %env.project_id, plugin = id, error = %err, "plugin blocked");
            env.audit.record(
                self.audit(AuditAction::Failed, &env.actor)
                    .plugin(id)
                    .details(json!({ "stage": "resolve" }))
                    .error(err),
            );
        }
        self.blocked.insert(id.to_string(), blocked);
    }

    fn unmet_dependency(&self, id: &str) -> Option<RuntimeError> {
        let descriptor = self.descriptors.get(id)?;
        descriptor
            .manifest
            .dependencies
            .iter()
            .find(|dep| !self.plugins.get(&dep.id).is_some_and(PluginInstance::is_active))
            .map(|dep| RuntimeError::DependencyMissing {
                plugin: id.to_string(),
                dependency: dep.id.clone(),
                reason: "not active".to_string(),
            })
    }

    fn instantiate(&self, env: &LifecycleEnv, descriptor: PluginDescriptor) -> Result<PluginInstance> {
        let id = descriptor.id().to_string();
        let settings = self.config.plugins.get(&id).cloned().unwrap_or_default();
        let config = descriptor
            .manifest
            .config_schema
            .apply(settings.config.as_ref())
            .map_err(|errors| RuntimeError::ConfigInvalid {
                plugin: id.clone(),
                errors,
            });
        let config = match config {
            Ok(config) => config,
            Err(err) => {
                env.audit.record(
                    self.audit(AuditAction::Failed, &env.actor)
                        .plugin(id.as_str())
                        .details(json!({ "stage": "config" }))
                        .error(&err),
                );
                return Err(err);
            }
        };

        env.audit.record(
            self.audit(AuditAction::Discovered, &env.actor)
                .plugin(id.as_str())
                .details(json!({
                    "version": descriptor.version().to_string(),
                    "bundleRoot": descriptor.bundle_root.display().to_string(),
                    "rootKind": descriptor.root_kind,
                })),
        );
        let timeouts = settings
            .timeouts
            .unwrap_or(self.services.settings.default_timeouts);
        Ok(PluginInstance::new(descriptor, config, settings.required, timeouts))
    }

    /// Makes sure `id` has an instance in `Loaded` (or later) state.
    async fn ensure_loaded(&mut self, env: &LifecycleEnv, id: &str) -> Result<()> {
        let fresh = match self.plugins.get_mut(id) {
            None => true,
            Some(instance) => match instance.state() {
                PluginState::Unloaded => true,
                PluginState::Deactivated => {
                    instance.unload(env).await?;
                    true
                }
                _ => false,
            },
        };
        if fresh {
            let descriptor = self
                .descriptors
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::not_found("plugin bundle", id))?;
            let instance = self.instantiate(env, descriptor)?;
            self.plugins.insert(id.to_string(), instance);
        }
        let instance = self
            .plugins
            .get_mut(id)
            .ok_or_else(|| RuntimeError::not_found("plugin", id))?;
        if instance.state() == PluginState::Discovered {
            instance.load(env).await?;
        }
        Ok(())
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Why the project is not `Ready`; empty when it is.
    pub fn degraded_reasons(&self) -> Vec<String> {
        let mut reasons: Vec<String> = self
            .blocked
            .values()
            .filter(|b| b.is_dependency_failure() || self.config.is_required(&b.plugin_id))
            .map(|b| format!("{}: {}", b.plugin_id, b.message))
            .collect();
        for (id, settings) in &self.config.plugins {
            if !settings.enabled || !settings.required || self.blocked.contains_key(id) {
                continue;
            }
            match self.plugins.get(id) {
                Some(instance) if instance.is_active() => {}
                Some(instance) => reasons.push(format!("{id}: required plugin is {}", instance.state())),
                None => reasons.push(format!("{id}: required plugin is not installed")),
            }
        }
        reasons
    }

    fn refresh_state(&mut self) {
        if matches!(self.state, ProjectState::Closing | ProjectState::Closed) {
            return;
        }
        self.state = if self.degraded_reasons().is_empty() {
            ProjectState::Ready
        } else {
            ProjectState::Degraded
        };
    }

    /// Every known plugin: live instances plus installed bundles that have
    /// none.
    pub fn plugin_listing(&self) -> Vec<PluginInstanceInfo> {
        let mut listing: Vec<PluginInstanceInfo> = self.plugins.values().map(PluginInstance::info).collect();
        for (id, descriptor) in &self.descriptors {
            if !self.plugins.contains_key(id) {
                let settings = self.config.plugins.get(id).cloned().unwrap_or_default();
                let config = settings.config.unwrap_or_else(|| json!({}));
                let idle = PluginInstance::new(
                    descriptor.clone(),
                    config,
                    settings.required,
                    self.services.settings.default_timeouts,
                );
                listing.push(idle.info());
            }
        }
        listing.sort_by(|a, b| a.id.cmp(&b.id));
        listing
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            id: self.config.id.clone(),
            display_name: self.config.display_name().to_string(),
            description: self.config.description.clone(),
            state: self.state,
            store: self
                .storage
                .as_ref()
                .map(|s| s.location().to_string())
                .unwrap_or_default(),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            activation_order: self.order.clone(),
            plugins: self.plugin_listing(),
            blocked: self.blocked.values().cloned().collect(),
            degraded_reasons: self.degraded_reasons(),
        }
    }

    // ========================================================================
    // Admin operations
    // ========================================================================

    fn knows(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
            || self.descriptors.contains_key(plugin_id)
            || self.config.plugins.contains_key(plugin_id)
    }

    /// Enables and activates a plugin, rescanning the roots if its bundle is
    /// new.
    pub async fn enable(&mut self, plugin_id: &str, actor: &str) -> Result<PluginInstanceInfo> {
        self.ensure_open()?;
        self.touch();
        if self.plugins.get(plugin_id).is_some_and(PluginInstance::is_active) {
            return Err(RuntimeError::conflict("active plugin", plugin_id));
        }
        if !self.descriptors.contains_key(plugin_id) {
            let report = self.services.loader.discover().await;
            for (id, descriptor) in report.descriptors {
                self.descriptors.entry(id).or_insert(descriptor);
            }
            if !self.descriptors.contains_key(plugin_id) {
                return Err(RuntimeError::not_found("plugin", plugin_id));
            }
        }

        let env = self.env(actor)?;
        if let Some(mut stale) = self.plugins.remove(plugin_id) {
            if stale.state() != PluginState::Unloaded {
                if let Err(err) = stale.unload(&env).await {
                    debug!(project = %env.project_id, plugin = plugin_id, error = %err, "stale instance not unloaded");
                }
            }
        }

        self.config.set_enabled(plugin_id, true);
        let mut errors = self.converge(actor).await?;
        self.refresh_state();

        if let Some(err) = errors.remove(plugin_id) {
            return Err(err);
        }
        self.plugins
            .get(plugin_id)
            .map(PluginInstance::info)
            .ok_or_else(|| RuntimeError::not_found("plugin", plugin_id))
    }

    /// Disables a plugin. Active dependents are deactivated first, in reverse
    /// activation order, and stay enabled but blocked.
    pub async fn disable(&mut self, plugin_id: &str, actor: &str) -> Result<DisableOutcome> {
        self.ensure_open()?;
        self.touch();
        if !self.knows(plugin_id) {
            return Err(RuntimeError::not_found("plugin", plugin_id));
        }
        let active = self.plugins.get(plugin_id).is_some_and(PluginInstance::is_active);
        if !active && !self.config.is_enabled(plugin_id) {
            return Err(RuntimeError::conflict("disabled plugin", plugin_id));
        }

        let env = self.env(actor)?;
        let mut targets = self.active_dependents(plugin_id);
        targets.insert(plugin_id.to_string());

        let mut reports = Vec::new();
        for id in self.order.clone().into_iter().rev() {
            if !targets.contains(&id) {
                continue;
            }
            if let Some(instance) = self.plugins.get_mut(&id) {
                match instance.deactivate(&env, DeactivationReason::Disabled).await {
                    Ok(report) => reports.push(report),
                    Err(err) => warn!(project = %env.project_id, plugin = %id, error = %err, "deactivate skipped"),
                }
            }
            self.order.retain(|o| o != &id);
        }

        if let Some(instance) = self.plugins.get_mut(plugin_id) {
            if matches!(instance.state(), PluginState::Loaded | PluginState::Failed) {
                if let Err(err) = instance.unload(&env).await {
                    debug!(project = %env.project_id, plugin = plugin_id, error = %err, "unload skipped");
                }
            }
        }
        self.config.set_enabled(plugin_id, false);
        self.blocked.remove(plugin_id);

        // Dependents left behind now report their missing dependency.
        self.converge(actor).await?;
        self.refresh_state();

        Ok(DisableOutcome {
            plugin_id: plugin_id.to_string(),
            reports,
        })
    }

    fn active_dependents(&self, plugin_id: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::from([plugin_id.to_string()]);
        loop {
            let before = closure.len();
            for (id, instance) in &self.plugins {
                if instance.is_active()
                    && instance
                        .manifest()
                        .dependencies
                        .iter()
                        .any(|dep| closure.contains(&dep.id))
                {
                    closure.insert(id.clone());
                }
            }
            if closure.len() == before {
                break;
            }
        }
        closure.remove(plugin_id);
        closure
    }

    /// Disables an active or enabled plugin, enables anything else.
    pub async fn toggle(&mut self, plugin_id: &str, actor: &str) -> Result<PluginState> {
        let on = self.plugins.get(plugin_id).is_some_and(PluginInstance::is_active)
            || self.config.is_enabled(plugin_id);
        if on {
            self.disable(plugin_id, actor).await?;
        } else {
            self.enable(plugin_id, actor).await?;
        }
        Ok(self
            .plugins
            .get(plugin_id)
            .map(PluginInstance::state)
            .unwrap_or(PluginState::Unloaded))
    }

    /// Re-reads an active plugin's bundle and swaps the new version in.
    ///
    /// The old instance keeps serving until the new one has loaded, migrated,
    /// activated and had its routes swapped in. Any failure before the swap
    /// leaves the old instance active and reverts the migrations the attempt
    /// applied.
    pub async fn reload_plugin(&mut self, plugin_id: &str, actor: &str) -> Result<PluginInstanceInfo> {
        self.ensure_open()?;
        self.touch();
        let env = self.env(actor)?;
        match self.swap_in_reload(&env, plugin_id).await {
            Ok(info) => Ok(info),
            Err(err) => {
                warn!(project = %env.project_id, plugin = plugin_id, error = %err, "reload aborted");
                env.audit.record(
                    self.audit(AuditAction::Reloaded, actor)
                        .plugin(plugin_id)
                        .error(&err),
                );
                self.refresh_state();
                Err(err)
            }
        }
    }

    async fn swap_in_reload(&mut self, env: &LifecycleEnv, plugin_id: &str) -> Result<PluginInstanceInfo> {
        let (old_descriptor, required, stashed) = {
            let old = self
                .plugins
                .get(plugin_id)
                .ok_or_else(|| RuntimeError::not_found("plugin", plugin_id))?;
            if !old.is_active() {
                return Err(RuntimeError::InvalidTransition {
                    plugin: plugin_id.to_string(),
                    action: "reload",
                    state: old.state(),
                });
            }
            (old.descriptor().clone(), old.is_required(), old.stashed_state())
        };
        let old_version = old_descriptor.version().clone();

        let descriptor = self
            .services
            .loader
            .load_bundle(&old_descriptor.bundle_root, old_descriptor.root_kind)
            .await?;
        if descriptor.id() != plugin_id {
            return Err(RuntimeError::invalid_manifest(
                &descriptor.bundle_root,
                format!("bundle of `{plugin_id}` now declares `{}`", descriptor.id()),
            ));
        }
        if descriptor.version() < &old_version {
            return Err(RuntimeError::DowngradeRefused {
                plugin: plugin_id.to_string(),
                reason: format!("version {} is older than active {old_version}", descriptor.version()),
            });
        }
        let high_water = MigrationRunner::new(env.storage.clone()).high_water(&plugin_owner(plugin_id))?;
        let declared = descriptor.manifest.max_migration_version();
        if declared < high_water {
            return Err(RuntimeError::DowngradeRefused {
                plugin: plugin_id.to_string(),
                reason: format!("bundle declares migrations up to {declared}, store is at {high_water}"),
            });
        }
        for (id, dependent) in &self.plugins {
            if !dependent.is_active() {
                continue;
            }
            if let Some(dep) = dependent.manifest().dependency(plugin_id) {
                if !dep.version_range.matches(descriptor.version()) {
                    return Err(RuntimeError::DependencyVersionMismatch {
                        plugin: id.clone(),
                        dependency: plugin_id.to_string(),
                        required: dep.version_range.to_string(),
                        found: descriptor.version().to_string(),
                    });
                }
            }
        }

        let settings = self.config.plugins.get(plugin_id).cloned().unwrap_or_default();
        let current = self.plugins.get(plugin_id).map(PluginInstance::config);
        let config = descriptor
            .manifest
            .config_schema
            .apply(current.as_deref().or(settings.config.as_ref()))
            .map_err(|errors| RuntimeError::ConfigInvalid {
                plugin: plugin_id.to_string(),
                errors,
            })?;
        let previous_state = if descriptor.version() == &old_version {
            stashed
        } else {
            None
        };
        let timeouts = settings
            .timeouts
            .unwrap_or(self.services.settings.default_timeouts);

        let mut fresh = PluginInstance::new(descriptor.clone(), config, required, timeouts)
            .with_previous_state(previous_state);
        fresh.load(env).await?;
        if let Err(err) = fresh.stage_activation(env).await {
            return Err(abandon_reload(env, &mut fresh, high_water, err).await);
        }
        let swapped = env.routes.swap(
            &env.project_id,
            plugin_id,
            fresh.resolved_routes(),
            &env.capabilities,
            fresh.binding(env),
        );
        let mounted = match swapped {
            Ok(mounted) => mounted,
            Err(err) => return Err(abandon_reload(env, &mut fresh, high_water, err).await),
        };
        fresh.adopt_routes(env, mounted);

        if let Some(mut old) = self.plugins.remove(plugin_id) {
            old.surrender_routes();
            if let Err(err) = old.deactivate(env, DeactivationReason::Reload).await {
                warn!(project = %env.project_id, plugin = plugin_id, error = %err, "old instance not deactivated");
            }
            if let Err(err) = old.unload(env).await {
                warn!(project = %env.project_id, plugin = plugin_id, error = %err, "old instance not unloaded");
            }
        }
        fresh.commit_activation(env);
        let info = fresh.info();
        self.plugins.insert(plugin_id.to_string(), fresh);
        self.descriptors.insert(plugin_id.to_string(), descriptor);

        env.audit.record(
            self.audit(AuditAction::Reloaded, &env.actor)
                .plugin(plugin_id)
                .details(json!({
                    "from": old_version.to_string(),
                    "to": info.version,
                    "routes": info.mounted_routes.len(),
                })),
        );
        info!(project = %env.project_id, plugin = plugin_id, from = %old_version, to = %info.version, "🔄 Reloaded plugin");
        self.refresh_state();
        Ok(info)
    }

    /// Current config of a plugin, defaults applied.
    pub fn get_config(&self, plugin_id: &str) -> Result<Value> {
        if let Some(instance) = self.plugins.get(plugin_id) {
            return Ok(Value::clone(&instance.config()));
        }
        let descriptor = self
            .descriptors
            .get(plugin_id)
            .ok_or_else(|| RuntimeError::not_found("plugin", plugin_id))?;
        let stored = self.config.plugins.get(plugin_id).and_then(|s| s.config.as_ref());
        descriptor
            .manifest
            .config_schema
            .apply(stored)
            .map_err(|errors| RuntimeError::ConfigInvalid {
                plugin: plugin_id.to_string(),
                errors,
            })
    }

    /// Validates and stores a new plugin config. On `ConfigInvalid` the prior
    /// config stays in effect.
    pub fn update_config(&mut self, plugin_id: &str, value: Value, actor: &str) -> Result<Value> {
        self.touch();
        let schema = match self.plugins.get(plugin_id) {
            Some(instance) => instance.manifest().config_schema.clone(),
            None => self
                .descriptors
                .get(plugin_id)
                .map(|d| d.manifest.config_schema.clone())
                .ok_or_else(|| RuntimeError::not_found("plugin", plugin_id))?,
        };
        let validated = schema
            .apply(Some(&value))
            .map_err(|errors| RuntimeError::ConfigInvalid {
                plugin: plugin_id.to_string(),
                errors,
            })?;

        if let Some(instance) = self.plugins.get(plugin_id) {
            instance.set_config(validated.clone());
        }
        self.config
            .plugins
            .entry(plugin_id.to_string())
            .or_default()
            .config = Some(value);
        self.services.audit.record(
            self.audit(AuditAction::ConfigChanged, actor)
                .plugin(plugin_id)
                .details(json!({ "config": validated })),
        );
        Ok(validated)
    }
}

/// Fails a half-staged reload and reverts the migrations it applied, so the
/// instance still serving keeps the schema it was activated against.
async fn abandon_reload(
    env: &LifecycleEnv,
    fresh: &mut PluginInstance,
    baseline: u32,
    err: RuntimeError,
) -> RuntimeError {
    let plugin_id = fresh.id().to_string();
    let migrations = fresh.migrations().to_vec();
    let err = fresh.abort_activation(env, err).await;
    match roll_back_migrations(env, &plugin_id, &migrations, baseline) {
        Ok(reverted) if !reverted.is_empty() => {
            info!(project = %env.project_id, plugin = %plugin_id, ?reverted, "↩️ Rolled back reload migrations");
        }
        Ok(_) => {}
        Err(rollback_err) => {
            warn!(project = %env.project_id, plugin = %plugin_id, error = %rollback_err, "reload migrations left applied");
        }
    }
    err
}

/// Seeds the project's own settings and returns its persisted creation time.
fn seed_defaults(storage: &StorageHandle, config: &ProjectConfig) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    storage.with_transaction::<_, RuntimeError, _>(|tx| {
        tx.exec(
            "INSERT OR IGNORE INTO project_settings (key, value) VALUES ('created_at', ?1)",
            &[text(now.to_rfc3339())],
        )?;
        tx.exec(
            "INSERT INTO project_settings (key, value) VALUES ('display_name', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            &[text(config.display_name())],
        )?;
        Ok(())
    })?;
    let created = storage
        .query_one("SELECT value FROM project_settings WHERE key = 'created_at'", &[])?
        .and_then(|row| row_str(&row, "value").and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(now);
    Ok(created)
}
