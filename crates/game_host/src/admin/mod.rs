//! Admin control surface.
//!
//! Each command resolves its project, takes that project's lifecycle lock,
//! runs the matching operation and answers with the resulting state plus the
//! id of the audit record that captured it. Failures always carry an audit
//! id too: either the record the lifecycle wrote, or one written here.

pub mod preferences;

use std::sync::Arc;

use plugin_runtime::project::ProjectContext;
use plugin_runtime::{
    AuditAction, AuditEntry, AuditLog, AuditQuery, AuditRecord, PluginInstanceInfo, PluginState, ProjectConfig,
    ProjectRegistry, ProjectSnapshot, ProjectState, RuntimeError,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

pub use preferences::PreferenceStore;

/// A failed command and the audit record describing it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CommandError {
    pub error: RuntimeError,
    pub audit_id: Option<i64>,
}

impl From<RuntimeError> for CommandError {
    fn from(error: RuntimeError) -> Self {
        Self { error, audit_id: None }
    }
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCommand {
    Enable,
    Disable,
    Toggle,
    Reload,
}

impl PluginCommand {
    /// Audit action recorded when the command fails before the lifecycle
    /// wrote anything itself.
    fn failure_action(self, was_on: bool) -> AuditAction {
        match self {
            Self::Enable => AuditAction::Activated,
            Self::Disable => AuditAction::Deactivated,
            Self::Toggle if was_on => AuditAction::Deactivated,
            Self::Toggle => AuditAction::Activated,
            Self::Reload => AuditAction::Reloaded,
        }
    }
}

/// Result of a plugin command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub project_id: String,
    pub plugin_id: String,
    pub state: Option<PluginState>,
    pub project_state: ProjectState,
    pub audit_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginInstanceInfo>,
    /// Other plugins the command deactivated, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub affected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// Result of a project command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOutcome {
    pub project: ProjectSnapshot,
    pub audit_id: Option<i64>,
}

/// One plugin as seen from one project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginListing {
    pub project_id: String,
    #[serde(flatten)]
    pub plugin: PluginInstanceInfo,
}

#[derive(Clone)]
pub struct AdminService {
    registry: Arc<ProjectRegistry>,
    preferences: PreferenceStore,
}

impl AdminService {
    pub fn new(registry: Arc<ProjectRegistry>, preferences: PreferenceStore) -> Self {
        Self { registry, preferences }
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    fn audit(&self) -> &AuditLog {
        &self.registry.services().audit
    }

    /// Picks the target project. Without an explicit id, the only open
    /// project is used.
    pub async fn resolve_project(&self, project: Option<&str>) -> Result<String, RuntimeError> {
        if let Some(id) = project.filter(|p| !p.is_empty()) {
            return Ok(id.to_string());
        }
        let open: Vec<String> = self
            .registry
            .list()
            .await?
            .iter()
            .filter(|p| p.state != ProjectState::Closed)
            .map(|p| p.id.clone())
            .collect();
        match open.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(RuntimeError::invalid_input("query parameter `project` is required")),
        }
    }

    fn failed(
        &self,
        project_id: &str,
        plugin_id: Option<&str>,
        action: AuditAction,
        actor: &str,
        before: Option<i64>,
        err: RuntimeError,
    ) -> CommandError {
        let unknown_project = plugin_id.is_none()
            && matches!(
                err,
                RuntimeError::NotFound { resource: "project", .. } | RuntimeError::InvalidInput(_)
            );
        if unknown_project {
            return err.into();
        }

        let latest = self.audit().last_id(project_id);
        let audit_id = if latest.is_some() && latest != before {
            latest
        } else {
            let mut entry = AuditEntry::new(project_id, action).actor(actor).error(&err);
            if let Some(plugin_id) = plugin_id {
                entry = entry.plugin(plugin_id);
            }
            self.audit().record(entry)
        };
        CommandError { error: err, audit_id }
    }

    fn persist_if_changed(&self, project: &ProjectContext, before: &ProjectConfig) {
        if project.config() != before {
            if let Err(err) = self.registry.persist(project.config()) {
                error!(project = project.id(), error = %err, "❌ Failed to persist project config");
            }
        }
    }

    fn outcome(&self, project: &ProjectContext, plugin_id: &str, affected: Vec<String>) -> CommandOutcome {
        let plugin = project.plugin_listing().into_iter().find(|p| p.id == plugin_id);
        CommandOutcome {
            project_id: project.id().to_string(),
            plugin_id: plugin_id.to_string(),
            state: plugin.as_ref().map(|p| p.state),
            project_state: project.state(),
            audit_id: self.audit().last_id(project.id()),
            plugin,
            affected,
            config: None,
        }
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Plugins of one project, or of every open project.
    pub async fn list_plugins(&self, project: Option<&str>) -> CommandResult<Vec<PluginListing>> {
        let snapshots = match project {
            Some(id) => vec![self.registry.require(id).await?.snapshot()],
            None => self.open_snapshots().await?,
        };
        Ok(snapshots
            .iter()
            .flat_map(|snapshot| {
                snapshot.plugins.iter().map(|plugin| PluginListing {
                    project_id: snapshot.id.clone(),
                    plugin: plugin.clone(),
                })
            })
            .collect())
    }

    async fn open_snapshots(&self) -> Result<Vec<Arc<ProjectSnapshot>>, RuntimeError> {
        Ok(self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|p| p.state != ProjectState::Closed)
            .collect())
    }

    /// One plugin in every project that knows it, or in just `project`.
    pub async fn get_plugin(&self, project: Option<&str>, plugin_id: &str) -> CommandResult<Vec<PluginListing>> {
        let found: Vec<PluginListing> = self
            .list_plugins(project)
            .await?
            .into_iter()
            .filter(|listing| listing.plugin.id == plugin_id)
            .collect();
        if found.is_empty() {
            return Err(RuntimeError::not_found("plugin", plugin_id).into());
        }
        Ok(found)
    }

    pub async fn plugin_command(
        &self,
        project: Option<&str>,
        plugin_id: &str,
        command: PluginCommand,
        actor: &str,
    ) -> CommandResult<CommandOutcome> {
        let project_id = self.resolve_project(project).await?;
        let entry = self.registry.require(&project_id).await?;
        let mut project = entry.lock().await;
        let before = self.audit().last_id(&project_id);
        let config_before = project.config().clone();
        let was_on = project.plugin(plugin_id).is_some_and(|p| p.is_active()) || project.config().is_enabled(plugin_id);

        let result = match command {
            PluginCommand::Enable => project.enable(plugin_id, actor).await.map(|_| Vec::new()),
            PluginCommand::Disable => project.disable(plugin_id, actor).await.map(|outcome| {
                outcome
                    .reports
                    .into_iter()
                    .map(|r| r.plugin_id)
                    .filter(|id| id != plugin_id)
                    .collect()
            }),
            PluginCommand::Toggle => project.toggle(plugin_id, actor).await.map(|_| Vec::new()),
            PluginCommand::Reload => project.reload_plugin(plugin_id, actor).await.map(|_| Vec::new()),
        };
        self.persist_if_changed(&project, &config_before);

        match result {
            Ok(affected) => {
                info!(project = %project_id, plugin = plugin_id, command = ?command, "🔧 Admin command applied");
                Ok(self.outcome(&project, plugin_id, affected))
            }
            Err(err) => Err(self.failed(
                &project_id,
                Some(plugin_id),
                command.failure_action(was_on),
                actor,
                before,
                err,
            )),
        }
    }

    pub async fn get_config(&self, project: Option<&str>, plugin_id: &str) -> CommandResult<Value> {
        let project_id = self.resolve_project(project).await?;
        let entry = self.registry.require(&project_id).await?;
        let project = entry.lock().await;
        Ok(project.get_config(plugin_id)?)
    }

    /// Validates and applies a new config. On `ConfigInvalid` the previous
    /// config stays in effect.
    pub async fn update_config(
        &self,
        project: Option<&str>,
        plugin_id: &str,
        value: Value,
        actor: &str,
    ) -> CommandResult<CommandOutcome> {
        let project_id = self.resolve_project(project).await?;
        let entry = self.registry.require(&project_id).await?;
        let mut project = entry.lock().await;
        let before = self.audit().last_id(&project_id);
        let config_before = project.config().clone();

        match project.update_config(plugin_id, value, actor) {
            Ok(validated) => {
                self.persist_if_changed(&project, &config_before);
                let mut outcome = self.outcome(&project, plugin_id, Vec::new());
                outcome.config = Some(validated);
                Ok(outcome)
            }
            Err(err) => Err(self.failed(
                &project_id,
                Some(plugin_id),
                AuditAction::ConfigChanged,
                actor,
                before,
                err,
            )),
        }
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub async fn list_projects(&self) -> CommandResult<Vec<ProjectSnapshot>> {
        Ok(self
            .registry
            .list()
            .await?
            .iter()
            .map(|snapshot| ProjectSnapshot::clone(snapshot))
            .collect())
    }

    pub async fn get_project(&self, id: &str) -> CommandResult<ProjectSnapshot> {
        if let Some(entry) = self.registry.get(id).await {
            return Ok(ProjectSnapshot::clone(&entry.snapshot()));
        }
        let config = self
            .registry
            .configs()
            .get(id)?
            .ok_or_else(|| RuntimeError::not_found("project", id))?;
        Ok(ProjectSnapshot::closed(&config))
    }

    pub async fn create_project(&self, config: ProjectConfig, actor: &str) -> CommandResult<ProjectOutcome> {
        let id = config.id.clone();
        let before = self.audit().last_id(&id);
        match self.registry.create(config, actor).await {
            Ok(snapshot) => Ok(ProjectOutcome {
                project: ProjectSnapshot::clone(&snapshot),
                audit_id: self.audit().last_id(&id),
            }),
            Err(err) => Err(self.failed(&id, None, AuditAction::ProjectCreated, actor, before, err)),
        }
    }

    /// Deletes a project; its store file is kept unless `purge` is set.
    pub async fn delete_project(&self, id: &str, purge: bool, actor: &str) -> CommandResult<Option<i64>> {
        let before = self.audit().last_id(id);
        match self.registry.delete(id, purge, actor).await {
            Ok(()) => Ok(self.audit().last_id(id)),
            Err(err) => Err(self.failed(id, None, AuditAction::ProjectDeleted, actor, before, err)),
        }
    }

    /// Closes and re-opens a project from its persisted config.
    pub async fn reload_project(&self, id: &str, actor: &str) -> CommandResult<ProjectOutcome> {
        let before = self.audit().last_id(id);
        match self.registry.reload(id, actor).await {
            Ok(snapshot) => Ok(ProjectOutcome {
                project: ProjectSnapshot::clone(&snapshot),
                audit_id: self.audit().last_id(id),
            }),
            Err(err) => Err(self.failed(id, None, AuditAction::Reloaded, actor, before, err)),
        }
    }

    /// Durable audit records, newest first.
    pub fn audit_records(&self, query: &AuditQuery) -> CommandResult<Vec<AuditRecord>> {
        Ok(self.audit().query(query)?)
    }
}
