#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use plugin_runtime::core_tables::system_migrations;
use plugin_runtime::migration::{MigrationRunner, CORE_OWNER};
use plugin_runtime::{
    host_version, AuditRecord, AuditLog, BuiltinCapabilities, CapabilityRegistry, EventBus, HttpMethod,
    IncomingRequest, PluginCatalog, PluginLoader, PluginResponse, PluginRoot, ProjectRegistry, RootKind,
    RouteMountController, RouteScope, RuntimeServices, RuntimeSettings, StaticModule, StorageHandle, TokenTable,
};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const ACTOR: &str = "tester";

/// Scratch plugin root, system store and data dir for one test.
pub struct Harness {
    pub dir: TempDir,
    pub plugin_root: PathBuf,
    pub catalog: Arc<PluginCatalog>,
    pub services: RuntimeServices,
    pub system: StorageHandle,
}

impl Harness {
    pub fn new(catalog: PluginCatalog) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let plugin_root = dir.path().join("plugins");
        std::fs::create_dir_all(&plugin_root).unwrap();
        let catalog = Arc::new(catalog);
        let (services, system) = build_services(dir.path(), &plugin_root, catalog.clone());
        Self {
            dir,
            plugin_root,
            catalog,
            services,
            system,
        }
    }

    pub fn registry(&self) -> ProjectRegistry {
        ProjectRegistry::new(self.services.clone(), self.system.clone())
    }

    /// Fresh services over the same directories, as after a process restart.
    pub fn restart(&mut self) {
        self.system.close();
        let (services, system) = build_services(self.dir.path(), &self.plugin_root, self.catalog.clone());
        self.services = services;
        self.system = system;
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    /// Writes `plugins/<id>/plugin.json` plus the given migration files.
    pub fn write_bundle(&self, manifest: Value, files: &[(&str, &str)]) -> PathBuf {
        let id = manifest["id"].as_str().unwrap().to_string();
        let bundle = self.plugin_root.join(id);
        std::fs::create_dir_all(bundle.join("migrations")).unwrap();
        std::fs::write(
            bundle.join("plugin.json"),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();
        for (name, body) in files {
            std::fs::write(bundle.join(name), body).unwrap();
        }
        bundle
    }

    pub fn history(&self, project: &str) -> Vec<AuditRecord> {
        self.services.audit.project_history(project).unwrap()
    }

    pub async fn get(&self, project: &str, plugin: &str, path: &str) -> PluginResponse {
        self.services
            .routes
            .dispatch(RouteScope::Project, project, plugin, IncomingRequest::new(HttpMethod::Get, path))
            .await
    }
}

fn build_services(dir: &Path, plugin_root: &Path, catalog: Arc<PluginCatalog>) -> (RuntimeServices, StorageHandle) {
    let system = StorageHandle::open(dir.join("system.db")).unwrap();
    MigrationRunner::new(system.clone())
        .migrate(CORE_OWNER, &system_migrations())
        .unwrap();
    let capabilities = CapabilityRegistry::with_builtins(&BuiltinCapabilities {
        tokens: Arc::new(TokenTable::new(
            vec!["admin-token".to_string()],
            vec!["user-token".to_string()],
        )),
        cli_bypass: true,
        rate_limit_capacity: 100,
        rate_limit_refill_per_sec: 50.0,
    });
    let services = RuntimeServices {
        loader: PluginLoader::new(vec![PluginRoot::new(RootKind::Bundled, plugin_root)], host_version()),
        catalog,
        routes: Arc::new(RouteMountController::new()),
        capabilities: Arc::new(capabilities),
        audit: AuditLog::new(system.clone(), EventBus::default()),
        settings: RuntimeSettings::new(dir.join("data")),
    };
    (services, system)
}

/// Manifest with one `GET /<id>/info` route served by handler `info`.
pub fn manifest(id: &str, version: &str) -> Value {
    json!({
        "id": id,
        "version": version,
        "routes": [
            { "method": "GET", "path": format!("/{id}/info"), "handler": "info" }
        ]
    })
}

/// Module answering `info` with its plugin id and version tag.
pub fn info_module(id: &str) -> StaticModule {
    StaticModule::new(id).handler("info", |req| async move {
        Ok(PluginResponse::ok(json!({ "plugin": req.plugin_id })))
    })
}

/// `migrations/NNN.sql` entries for versions `1..=count`, each creating `t_<prefix>_<n>`.
pub fn migration_set(prefix: &str, count: u32) -> (Value, Vec<(String, String)>) {
    let entries: Vec<Value> = (1..=count)
        .map(|v| {
            json!({
                "version": v,
                "name": format!("create t_{prefix}_{v}"),
                "up": format!("migrations/{v:03}.sql"),
                "down": format!("migrations/{v:03}.down.sql"),
            })
        })
        .collect();
    let mut files = Vec::new();
    for v in 1..=count {
        files.push((
            format!("migrations/{v:03}.sql"),
            format!("CREATE TABLE t_{prefix}_{v} (id INTEGER PRIMARY KEY);"),
        ));
        files.push((
            format!("migrations/{v:03}.down.sql"),
            format!("DROP TABLE t_{prefix}_{v};"),
        ));
    }
    (Value::Array(entries), files)
}

pub fn file_refs(files: &[(String, String)]) -> Vec<(&str, &str)> {
    files.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect()
}
