//! Per-plugin lifecycle state machine.
//!
//! ```text
//! Discovered --load--> Loaded --activate--> Active --deactivate--> Deactivated
//!      |                 |         |                                   |
//!      +-----fault-------+---------+--> Failed                        unload
//!                        |                                              v
//!                        +-------------------unload---------------> Unloaded
//! ```
//!
//! Every transition writes an audit record. `Active` implies the instance's
//! route group is mounted; any path out of `Active` unmounts it first.

mod context;
mod hooks;
mod resources;

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use context::{LogLevel, PluginContext};
pub use hooks::HookTimeouts;
pub use resources::{ReleaseReport, ResourceScope};

pub(crate) use hooks::run_hook;

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::capabilities::ProjectCapabilities;
use crate::catalog::{DeactivationReason, PluginCatalog, PluginHooks};
use crate::error::{Result, RuntimeError};
use crate::loader::{PluginDescriptor, RootKind};
use crate::manifest::{AdminUiMeta, DependencySpec, LifecycleHook, PluginManifest};
use crate::migration::{plugin_owner, Migration, MigrationRunner};
use crate::routes::{ConfigCell, MountedRouteInfo, ResolvedRoute, RouteBinding, RouteMountController};
use crate::storage::StorageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Loaded,
    Active,
    Deactivated,
    Failed,
    Unloaded,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Active => "active",
            Self::Deactivated => "deactivated",
            Self::Failed => "failed",
            Self::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// Project services a lifecycle transition needs.
#[derive(Clone)]
pub struct LifecycleEnv {
    pub project_id: String,
    pub storage: StorageHandle,
    pub routes: Arc<RouteMountController>,
    pub capabilities: ProjectCapabilities,
    pub catalog: Arc<PluginCatalog>,
    pub audit: AuditLog,
    pub actor: String,
    pub cancel: CancellationToken,
}

impl LifecycleEnv {
    fn entry(&self, plugin_id: &str, action: AuditAction) -> AuditEntry {
        AuditEntry::new(self.project_id.as_str(), action)
            .plugin(plugin_id)
            .actor(self.actor.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceError {
    pub error: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Serializable view of an instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInstanceInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub state: PluginState,
    pub required: bool,
    pub root_kind: RootKind,
    pub bundle_root: String,
    pub dependencies: Vec<DependencySpec>,
    pub config: Value,
    pub mounted_routes: Vec<MountedRouteInfo>,
    pub open_resources: usize,
    pub last_error: Option<InstanceError>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub admin_ui: Option<AdminUiMeta>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivationReport {
    pub plugin_id: String,
    pub reason: DeactivationReason,
    pub unmounted: Vec<MountedRouteInfo>,
    pub hook_error: Option<String>,
    pub released: Vec<ReleaseReport>,
}

impl DeactivationReport {
    pub fn unreleased(&self) -> impl Iterator<Item = &ReleaseReport> {
        self.released.iter().filter(|r| !r.released)
    }
}

/// One plugin inside one project.
pub struct PluginInstance {
    descriptor: PluginDescriptor,
    state: PluginState,
    config: ConfigCell,
    required: bool,
    timeouts: HookTimeouts,
    previous_state: Option<Value>,
    hooks: Option<Arc<dyn PluginHooks>>,
    context: Option<PluginContext>,
    routes: Vec<ResolvedRoute>,
    migrations: Vec<Migration>,
    resources: ResourceScope,
    mounted: bool,
    mounted_routes: Vec<MountedRouteInfo>,
    last_error: Option<InstanceError>,
    activated_at: Option<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
}

impl PluginInstance {
    /// Creates a `Discovered` instance with an already validated config.
    pub fn new(descriptor: PluginDescriptor, config: Value, required: bool, timeouts: HookTimeouts) -> Self {
        Self {
            descriptor,
            state: PluginState::Discovered,
            config: Arc::new(ArcSwap::from_pointee(config)),
            required,
            timeouts,
            previous_state: None,
            hooks: None,
            context: None,
            routes: Vec::new(),
            migrations: Vec::new(),
            resources: ResourceScope::new(),
            mounted: false,
            mounted_routes: Vec::new(),
            last_error: None,
            activated_at: None,
            last_transition_at: Utc::now(),
        }
    }

    /// Hands state from a same-version predecessor to the next `on_load`.
    pub fn with_previous_state(mut self, state: Option<Value>) -> Self {
        self.previous_state = state;
        self
    }

    pub fn id(&self) -> &str {
        &self.descriptor.manifest.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.descriptor.manifest
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == PluginState::Active
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn set_required(&mut self, required: bool) {
        self.required = required;
    }

    pub fn config(&self) -> Arc<Value> {
        self.config.load_full()
    }

    /// Publishes a new validated config to hooks and handlers.
    pub fn set_config(&self, config: Value) {
        self.config.store(Arc::new(config));
    }

    pub fn mounted_routes(&self) -> &[MountedRouteInfo] {
        &self.mounted_routes
    }

    pub fn last_error(&self) -> Option<&InstanceError> {
        self.last_error.as_ref()
    }

    /// State the live instance stashed for a same-version successor.
    pub fn stashed_state(&self) -> Option<Value> {
        self.context.as_ref().and_then(PluginContext::stashed_state)
    }

    pub fn info(&self) -> PluginInstanceInfo {
        let manifest = self.manifest();
        PluginInstanceInfo {
            id: manifest.id.clone(),
            name: manifest.display_name().to_string(),
            version: manifest.version.to_string(),
            state: self.state,
            required: self.required,
            root_kind: self.descriptor.root_kind,
            bundle_root: self.descriptor.bundle_root.display().to_string(),
            dependencies: manifest.dependencies.clone(),
            config: Value::clone(&self.config()),
            mounted_routes: self.mounted_routes.clone(),
            open_resources: self.resources.len(),
            last_error: self.last_error.clone(),
            activated_at: self.activated_at,
            last_transition_at: self.last_transition_at,
            admin_ui: manifest.admin_ui.clone(),
        }
    }

    fn transition(&mut self, to: PluginState) {
        debug!(plugin = self.id(), from = %self.state, to = %to, "plugin transition");
        self.state = to;
        self.last_transition_at = Utc::now();
    }

    fn expect_state(&self, action: &'static str, allowed: &[PluginState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidTransition {
                plugin: self.id().to_string(),
                action,
                state: self.state,
            })
        }
    }

    fn implements(&self, hook: LifecycleHook) -> bool {
        self.descriptor.manifest.implements(hook)
    }

    fn live(&self) -> Result<(Arc<dyn PluginHooks>, PluginContext)> {
        match (&self.hooks, &self.context) {
            (Some(hooks), Some(ctx)) => Ok((hooks.clone(), ctx.clone())),
            _ => Err(RuntimeError::InvalidTransition {
                plugin: self.id().to_string(),
                action: "call hooks of",
                state: self.state,
            }),
        }
    }

    pub(crate) fn binding(&self, env: &LifecycleEnv) -> RouteBinding {
        RouteBinding {
            storage: env.storage.clone(),
            config: self.config.clone(),
        }
    }

    pub(crate) fn resolved_routes(&self) -> &[ResolvedRoute] {
        &self.routes
    }

    pub(crate) fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// `Discovered -> Loaded`: resolves handlers, reads migrations and runs
    /// `on_load`.
    pub async fn load(&mut self, env: &LifecycleEnv) -> Result<()> {
        self.expect_state("load", &[PluginState::Discovered])?;
        match self.prepare(env).await {
            Ok(()) => {
                self.transition(PluginState::Loaded);
                env.audit.record(env.entry(self.id(), AuditAction::Loaded).details(json!({
                    "version": self.manifest().version.to_string(),
                    "routes": self.routes.len(),
                    "migrations": self.migrations.len(),
                })));
                Ok(())
            }
            Err(err) => Err(self.fail(env, err)),
        }
    }

    async fn prepare(&mut self, env: &LifecycleEnv) -> Result<()> {
        let manifest = self.descriptor.manifest.clone();
        let bundle_root = self.descriptor.bundle_root.clone();

        let module = env.catalog.get(&manifest.id).ok_or_else(|| {
            RuntimeError::invalid_manifest(&bundle_root, format!("no plugin module linked for `{}`", manifest.id))
        })?;
        let routes = manifest
            .routes
            .iter()
            .map(|route| {
                module
                    .handler(&route.handler)
                    .map(|handler| ResolvedRoute {
                        descriptor: route.clone(),
                        handler,
                    })
                    .ok_or_else(|| {
                        RuntimeError::invalid_manifest(
                            &bundle_root,
                            format!(
                                "route {} {} references unknown handler `{}`",
                                route.method, route.path, route.handler
                            ),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let migrations = self.descriptor.read_migrations().await?;

        let hooks = module.instantiate();
        let ctx = PluginContext::new(
            &env.project_id,
            &manifest.id,
            manifest.version.clone(),
            env.storage.clone(),
            self.config.clone(),
            env.capabilities.clone(),
            self.resources.clone(),
            env.cancel.child_token(),
            self.previous_state.take(),
        );
        self.routes = routes;
        self.migrations = migrations;
        self.hooks = Some(hooks.clone());
        self.context = Some(ctx.clone());

        if manifest.implements(LifecycleHook::OnLoad) {
            run_hook(
                &manifest.id,
                LifecycleHook::OnLoad,
                &self.timeouts,
                Some(&env.cancel),
                hooks.on_load(&ctx),
            )
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Activate
    // ========================================================================

    /// `Loaded -> Active`: migrations, `on_activate`, then route mount.
    ///
    /// Activating an active instance is a no-op. Any failure unmounts what was
    /// mounted, calls `on_deactivate` with [`DeactivationReason::AbortedActivation`],
    /// releases resources and leaves the instance `Failed`. Cancellation
    /// before the mount rolls back to `Loaded`.
    pub async fn activate(&mut self, env: &LifecycleEnv) -> Result<()> {
        if self.state == PluginState::Active {
            return Ok(());
        }
        self.expect_state("activate", &[PluginState::Loaded])?;
        if env.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled(format!("activation of `{}`", self.id())));
        }

        if let Err(err) = self.stage_activation(env).await {
            if matches!(err, RuntimeError::Cancelled(_)) {
                self.roll_back_to_loaded(env).await;
                return Err(err);
            }
            return Err(self.abort_activation(env, err).await);
        }

        if env.cancel.is_cancelled() {
            self.roll_back_to_loaded(env).await;
            return Err(RuntimeError::Cancelled(format!("activation of `{}`", self.id())));
        }

        let mounted = env.routes.mount(
            &env.project_id,
            self.id(),
            &self.routes,
            &env.capabilities,
            self.binding(env),
        );
        match mounted {
            Ok(mounted) => self.adopt_routes(env, mounted),
            Err(err) => return Err(self.abort_activation(env, err).await),
        }

        self.commit_activation(env);
        Ok(())
    }

    /// Runs pending plugin migrations and `on_activate`, without mounting.
    pub(crate) async fn stage_activation(&mut self, env: &LifecycleEnv) -> Result<()> {
        let plugin_id = self.id().to_string();
        MigrationRunner::new(env.storage.clone()).migrate_with(
            &plugin_owner(&plugin_id),
            &self.migrations,
            |migration| {
                env.audit.record(env.entry(&plugin_id, AuditAction::MigrationApplied).details(json!({
                    "version": migration.version,
                    "name": migration.name,
                })));
            },
        )?;

        if self.implements(LifecycleHook::OnActivate) {
            let (hooks, ctx) = self.live()?;
            run_hook(
                &plugin_id,
                LifecycleHook::OnActivate,
                &self.timeouts,
                Some(&env.cancel),
                hooks.on_activate(&ctx),
            )
            .await?;
        }
        Ok(())
    }

    /// Records a freshly mounted (or swapped-in) route group as ours.
    pub(crate) fn adopt_routes(&mut self, env: &LifecycleEnv, mounted: Vec<MountedRouteInfo>) {
        for route in &mounted {
            env.audit.record(env.entry(self.id(), AuditAction::RouteMounted).details(json!({
                "method": route.method,
                "path": route.path,
                "fullPath": route.full_path,
            })));
        }
        self.mounted = true;
        self.mounted_routes = mounted;
    }

    /// Forgets the mounted group after it was swapped out for a successor.
    pub(crate) fn surrender_routes(&mut self) {
        self.mounted = false;
        self.mounted_routes.clear();
    }

    pub(crate) fn commit_activation(&mut self, env: &LifecycleEnv) {
        self.transition(PluginState::Active);
        self.activated_at = Some(Utc::now());
        self.last_error = None;
        env.audit.record(env.entry(self.id(), AuditAction::Activated).details(json!({
            "version": self.manifest().version.to_string(),
            "routes": self.mounted_routes.len(),
        })));
        info!(
            project = %env.project_id,
            plugin = self.id(),
            version = %self.manifest().version,
            "✅ Activated plugin"
        );
    }

    pub(crate) async fn abort_activation(&mut self, env: &LifecycleEnv, err: RuntimeError) -> RuntimeError {
        self.unmount_routes(env);
        self.call_deactivate_hook(DeactivationReason::AbortedActivation).await;
        self.fail(env, err)
    }

    async fn roll_back_to_loaded(&mut self, env: &LifecycleEnv) {
        self.unmount_routes(env);
        self.call_deactivate_hook(DeactivationReason::AbortedActivation).await;
        let err = RuntimeError::Cancelled(format!("activation of `{}`", self.id()));
        env.audit.record(
            env.entry(self.id(), AuditAction::Deactivated)
                .details(json!({ "reason": DeactivationReason::AbortedActivation }))
                .error(&err),
        );
        warn!(project = %env.project_id, plugin = self.id(), "activation cancelled, instance left loaded");
    }

    // ========================================================================
    // Deactivate / unload / fail
    // ========================================================================

    fn unmount_routes(&mut self, env: &LifecycleEnv) -> Vec<MountedRouteInfo> {
        if !self.mounted {
            return Vec::new();
        }
        let removed = env.routes.unmount(&env.project_id, self.id());
        for route in &removed {
            env.audit.record(env.entry(self.id(), AuditAction::RouteUnmounted).details(json!({
                "method": route.method,
                "path": route.path,
                "fullPath": route.full_path,
            })));
        }
        self.mounted = false;
        self.mounted_routes.clear();
        removed
    }

    async fn call_deactivate_hook(&self, reason: DeactivationReason) -> Option<String> {
        if !self.implements(LifecycleHook::OnDeactivate) {
            return None;
        }
        let (hooks, ctx) = self.live().ok()?;
        let outcome = run_hook(
            self.id(),
            LifecycleHook::OnDeactivate,
            &self.timeouts,
            None,
            hooks.on_deactivate(&ctx, reason),
        )
        .await;
        match outcome {
            Ok(()) => None,
            Err(err) => {
                warn!(plugin = self.id(), reason = %reason, error = %err, "on_deactivate failed");
                Some(err.to_string())
            }
        }
    }

    /// `Active -> Deactivated`. Never fails once the precondition holds:
    /// routes come down first, then `on_deactivate` (errors logged), then the
    /// context token is cancelled and resources are released.
    pub async fn deactivate(&mut self, env: &LifecycleEnv, reason: DeactivationReason) -> Result<DeactivationReport> {
        self.expect_state("deactivate", &[PluginState::Active])?;

        let unmounted = self.unmount_routes(env);
        let hook_error = self.call_deactivate_hook(reason).await;
        if let Some(ctx) = &self.context {
            ctx.cancel();
        }
        let released = self.resources.release_all();

        self.transition(PluginState::Deactivated);
        self.activated_at = None;

        let report = DeactivationReport {
            plugin_id: self.id().to_string(),
            reason,
            unmounted,
            hook_error,
            released,
        };
        let unreleased: Vec<&ReleaseReport> = report.unreleased().collect();
        env.audit.record(env.entry(self.id(), AuditAction::Deactivated).details(json!({
            "reason": reason,
            "unmounted": report.unmounted.len(),
            "hookError": report.hook_error,
            "released": report.released.len(),
            "unreleased": unreleased,
        })));
        info!(project = %env.project_id, plugin = self.id(), reason = %reason, "⏸️ Deactivated plugin");
        Ok(report)
    }

    /// `Discovered | Loaded | Deactivated | Failed -> Unloaded`.
    pub async fn unload(&mut self, env: &LifecycleEnv) -> Result<()> {
        self.expect_state(
            "unload",
            &[
                PluginState::Discovered,
                PluginState::Loaded,
                PluginState::Deactivated,
                PluginState::Failed,
            ],
        )?;

        let mut hook_error = None;
        if self.implements(LifecycleHook::OnUnload) {
            if let Ok((hooks, ctx)) = self.live() {
                if let Err(err) = run_hook(self.id(), LifecycleHook::OnUnload, &self.timeouts, None, hooks.on_unload(&ctx)).await {
                    warn!(plugin = self.id(), error = %err, "on_unload failed");
                    hook_error = Some(err.to_string());
                }
            }
        }
        if let Some(ctx) = &self.context {
            ctx.cancel();
        }
        let released = self.resources.release_all();
        self.drop_handles();
        self.transition(PluginState::Unloaded);

        env.audit.record(env.entry(self.id(), AuditAction::Unloaded).details(json!({
            "hookError": hook_error,
            "released": released,
        })));
        Ok(())
    }

    fn drop_handles(&mut self) {
        self.hooks = None;
        self.context = None;
        self.routes.clear();
        self.migrations.clear();
    }

    /// Moves to `Failed`, releasing everything the instance holds.
    fn fail(&mut self, env: &LifecycleEnv, err: RuntimeError) -> RuntimeError {
        let from = self.state;
        self.unmount_routes(env);
        if let Some(ctx) = &self.context {
            ctx.cancel();
        }
        let released = self.resources.release_all();
        self.drop_handles();
        self.last_error = Some(InstanceError {
            error: err.tag().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        });
        self.activated_at = None;
        self.transition(PluginState::Failed);

        env.audit.record(
            env.entry(self.id(), AuditAction::Failed)
                .details(json!({ "from": from, "released": released }))
                .error(&err),
        );
        error!(project = %env.project_id, plugin = self.id(), error = %err, "❌ Plugin failed");
        err
    }
}

/// Reverts `plugin_id`'s migrations above `to_version`, newest first, writing
/// a `migration-rolled-back` record for each one.
pub(crate) fn roll_back_migrations(
    env: &LifecycleEnv,
    plugin_id: &str,
    migrations: &[Migration],
    to_version: u32,
) -> Result<Vec<u32>> {
    MigrationRunner::new(env.storage.clone()).rollback(&plugin_owner(plugin_id), to_version, migrations, |migration| {
        env.audit.record(env.entry(plugin_id, AuditAction::MigrationRolledBack).details(json!({
            "version": migration.version,
            "name": migration.name,
            "toVersion": to_version,
        })));
    })
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id())
            .field("version", &self.manifest().version)
            .field("state", &self.state)
            .field("mounted", &self.mounted)
            .finish()
    }
}
