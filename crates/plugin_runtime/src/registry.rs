//! Process-wide registry of project contexts.
//!
//! The map itself sits behind a reader-writer lock that is only written when
//! projects are created, opened, closed or deleted. Each project carries its
//! own mutex serializing lifecycle work, plus an atomically swapped snapshot
//! so read-only lookups never wait on a running lifecycle operation.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditEntry};
use crate::error::{Result, RuntimeError};
use crate::project::{ProjectConfig, ProjectContext, ProjectSnapshot, ProjectState};
use crate::services::RuntimeServices;
use crate::storage::{row_str, text, StorageHandle, StoreLocation};

/// Durable project configurations in the system store.
#[derive(Clone)]
pub struct ProjectConfigStore {
    storage: StorageHandle,
}

impl ProjectConfigStore {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    pub fn list(&self) -> Result<Vec<ProjectConfig>> {
        self.storage
            .query("SELECT config_json FROM projects ORDER BY id", &[])?
            .iter()
            .map(|row| parse_config(row_str(row, "config_json")))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<ProjectConfig>> {
        self.storage
            .query_one("SELECT config_json FROM projects WHERE id = ?1", &[text(id)])?
            .map(|row| parse_config(row_str(&row, "config_json")))
            .transpose()
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self
            .storage
            .query_one("SELECT 1 AS present FROM projects WHERE id = ?1", &[text(id)])?
            .is_some())
    }

    /// Inserts a new project; `Conflict` if the id is taken.
    pub fn insert(&self, config: &ProjectConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let now = Utc::now().to_rfc3339();
        let inserted = self.storage.exec(
            "INSERT OR IGNORE INTO projects (id, config_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            &[text(config.id.as_str()), text(json), text(now)],
        )?;
        if inserted == 0 {
            return Err(RuntimeError::conflict("project", config.id.as_str()));
        }
        Ok(())
    }

    pub fn save(&self, config: &ProjectConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let now = Utc::now().to_rfc3339();
        self.storage.exec(
            "INSERT INTO projects (id, config_json, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json, updated_at = excluded.updated_at",
            &[text(config.id.as_str()), text(json), text(now)],
        )?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.storage.exec("DELETE FROM projects WHERE id = ?1", &[text(id)])? > 0)
    }
}

fn parse_config(raw: Option<&str>) -> Result<ProjectConfig> {
    let raw = raw.ok_or_else(|| RuntimeError::invalid_input("project row without config"))?;
    Ok(serde_json::from_str(raw)?)
}

/// One registered project.
pub struct ProjectEntry {
    id: String,
    context: Mutex<ProjectContext>,
    snapshot: ArcSwap<ProjectSnapshot>,
    cancel: CancellationToken,
}

impl ProjectEntry {
    fn new(context: ProjectContext) -> Self {
        Self {
            id: context.id().to_string(),
            snapshot: ArcSwap::from_pointee(context.snapshot()),
            cancel: context.cancellation(),
            context: Mutex::new(context),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Takes the project's lifecycle lock. The snapshot is republished when
    /// the guard drops.
    pub async fn lock(&self) -> ProjectGuard<'_> {
        ProjectGuard {
            entry: self,
            context: self.context.lock().await,
        }
    }

    /// Last published state, without waiting for the lifecycle lock.
    pub fn snapshot(&self) -> Arc<ProjectSnapshot> {
        self.snapshot.load_full()
    }

    /// Signals in-progress activations to stop at the next safe point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct ProjectGuard<'a> {
    entry: &'a ProjectEntry,
    context: MutexGuard<'a, ProjectContext>,
}

impl Deref for ProjectGuard<'_> {
    type Target = ProjectContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

impl DerefMut for ProjectGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.context
    }
}

impl Drop for ProjectGuard<'_> {
    fn drop(&mut self) {
        self.entry.snapshot.store(Arc::new(self.context.snapshot()));
    }
}

pub struct ProjectRegistry {
    services: RuntimeServices,
    configs: ProjectConfigStore,
    projects: RwLock<HashMap<String, Arc<ProjectEntry>>>,
}

impl ProjectRegistry {
    pub fn new(services: RuntimeServices, system_store: StorageHandle) -> Self {
        Self {
            services,
            configs: ProjectConfigStore::new(system_store),
            projects: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn configs(&self) -> &ProjectConfigStore {
        &self.configs
    }

    fn audit(&self, id: &str, action: AuditAction, actor: &str) -> AuditEntry {
        AuditEntry::new(id, action).actor(actor)
    }

    /// Looks up an open project.
    pub async fn get(&self, id: &str) -> Option<Arc<ProjectEntry>> {
        self.projects.read().await.get(id).cloned()
    }

    /// Like [`get`](Self::get) but `NotFound` for unknown or closed ids.
    pub async fn require(&self, id: &str) -> Result<Arc<ProjectEntry>> {
        self.get(id)
            .await
            .ok_or_else(|| RuntimeError::not_found("project", id))
    }

    pub async fn open_count(&self) -> usize {
        self.projects.read().await.len()
    }

    /// Every persisted project, with live state for the open ones.
    pub async fn list(&self) -> Result<Vec<Arc<ProjectSnapshot>>> {
        let configs = self.configs.list()?;
        let open = self.projects.read().await;
        Ok(configs
            .iter()
            .map(|config| match open.get(&config.id) {
                Some(entry) => entry.snapshot(),
                None => Arc::new(ProjectSnapshot::closed(config)),
            })
            .collect())
    }

    /// Persists `config`, then builds and initializes its context.
    pub async fn create(&self, config: ProjectConfig, actor: &str) -> Result<Arc<ProjectSnapshot>> {
        config.validate()?;
        let entry = {
            let mut projects = self.projects.write().await;
            if projects.contains_key(&config.id) {
                return Err(RuntimeError::conflict("project", config.id.as_str()));
            }
            self.configs.insert(&config)?;
            self.services.audit.record(
                self.audit(&config.id, AuditAction::ProjectCreated, actor)
                    .details(json!({ "displayName": config.display_name() })),
            );
            let entry = Arc::new(ProjectEntry::new(ProjectContext::new(config, self.services.clone())));
            projects.insert(entry.id().to_string(), entry.clone());
            entry
        };

        match self.initialize(&entry, actor).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                self.projects.write().await.remove(entry.id());
                if let Err(remove_err) = self.configs.remove(entry.id()) {
                    warn!(project = entry.id(), error = %remove_err, "config of failed project not removed");
                }
                Err(err)
            }
        }
    }

    async fn initialize(&self, entry: &ProjectEntry, actor: &str) -> Result<Arc<ProjectSnapshot>> {
        let mut guard = entry.lock().await;
        if let Err(err) = guard.initialize().await {
            error!(project = entry.id(), error = %err, "❌ Project failed to initialize");
            if let Err(close_err) = guard.close(actor).await {
                warn!(project = entry.id(), error = %close_err, "close after failed init");
            }
            return Err(err);
        }
        drop(guard);
        Ok(entry.snapshot())
    }

    /// Opens a persisted project. Opening an open project returns its state.
    pub async fn open(&self, id: &str, actor: &str) -> Result<Arc<ProjectSnapshot>> {
        let entry = {
            let mut projects = self.projects.write().await;
            if let Some(entry) = projects.get(id) {
                return Ok(entry.snapshot());
            }
            let config = self
                .configs
                .get(id)?
                .ok_or_else(|| RuntimeError::not_found("project", id))?;
            let entry = Arc::new(ProjectEntry::new(ProjectContext::new(config, self.services.clone())));
            projects.insert(id.to_string(), entry.clone());
            entry
        };

        match self.initialize(&entry, actor).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                self.projects.write().await.remove(id);
                Err(err)
            }
        }
    }

    /// Closes an open project. Its config stays persisted.
    pub async fn close(&self, id: &str, actor: &str) -> Result<()> {
        let entry = self
            .projects
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RuntimeError::not_found("project", id))?;
        entry.cancel();
        let mut guard = entry.lock().await;
        guard.close(actor).await
    }

    /// Removes a project. The store file is kept unless `purge` is set.
    pub async fn delete(&self, id: &str, purge: bool, actor: &str) -> Result<()> {
        let open = self.projects.write().await.remove(id);
        let config = match &open {
            Some(entry) => {
                entry.cancel();
                let mut guard = entry.lock().await;
                guard.close(actor).await?;
                Some(guard.config().clone())
            }
            None => self.configs.get(id)?,
        };
        let config = config.ok_or_else(|| RuntimeError::not_found("project", id))?;
        self.configs.remove(id)?;

        let mut purged = Vec::new();
        if purge {
            if let StoreLocation::File(path) = self.services.settings.store_location(&config) {
                purged = purge_store(path).await?;
            }
        }
        self.services.audit.record(
            self.audit(id, AuditAction::ProjectDeleted, actor)
                .details(json!({ "purge": purge, "removedFiles": purged })),
        );
        info!(project = id, purge, "🗑️ Deleted project");
        Ok(())
    }

    /// Closes and re-opens a project from its persisted config.
    pub async fn reload(&self, id: &str, actor: &str) -> Result<Arc<ProjectSnapshot>> {
        let entry = self.require(id).await?;
        let config = self
            .configs
            .get(id)?
            .ok_or_else(|| RuntimeError::not_found("project", id))?;
        {
            let mut guard = entry.lock().await;
            guard.close(actor).await?;
            *guard = ProjectContext::new(config, self.services.clone()).with_cancellation(entry.cancel.clone());
            if let Err(err) = guard.initialize().await {
                error!(project = id, error = %err, "❌ Project failed to re-open");
                if let Err(close_err) = guard.close(actor).await {
                    warn!(project = id, error = %close_err, "close after failed re-open");
                }
                drop(guard);
                self.projects.write().await.remove(id);
                return Err(err);
            }
        }
        Ok(entry.snapshot())
    }

    /// Writes the context's current config back to the system store.
    pub fn persist(&self, config: &ProjectConfig) -> Result<()> {
        self.configs.save(config)
    }

    /// Creates any of `seeds` that is not yet persisted.
    pub async fn seed(&self, seeds: &[ProjectConfig], actor: &str) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for seed in seeds {
            if self.configs.contains(&seed.id)? {
                continue;
            }
            self.create(seed.clone(), actor).await?;
            created.push(seed.id.clone());
        }
        Ok(created)
    }

    /// Opens every persisted project concurrently. Failures are logged and
    /// returned; the rest of the fleet still opens.
    pub async fn open_all(&self, actor: &str) -> Result<Vec<(String, RuntimeError)>> {
        let configs = self.configs.list()?;
        let outcomes = join_all(configs.iter().map(|c| async move { (c.id.clone(), self.open(&c.id, actor).await) })).await;

        let mut failures = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(snapshot) if snapshot.state == ProjectState::Ready => {}
                Ok(snapshot) => warn!(project = %id, state = %snapshot.state, "project opened degraded"),
                Err(err) => {
                    error!(project = %id, error = %err, "project failed to open");
                    failures.push((id, err));
                }
            }
        }
        info!("📦 Opened {} project(s)", self.open_count().await);
        Ok(failures)
    }

    /// Closes every open project; used on shutdown.
    pub async fn close_all(&self, actor: &str) {
        let entries: Vec<Arc<ProjectEntry>> = self.projects.write().await.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.cancel();
        }
        for entry in entries {
            let mut guard = entry.lock().await;
            if let Err(err) = guard.close(actor).await {
                warn!(project = entry.id(), error = %err, "project did not close cleanly");
            }
        }
    }
}

async fn purge_store(path: PathBuf) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.clone().into_os_string();
        candidate.push(suffix);
        let candidate = PathBuf::from(candidate);
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => removed.push(candidate.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}
