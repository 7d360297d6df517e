//! # Game Host - Multi-Tenant Game Backend
//!
//! Wires the plugin runtime into a running process: configuration, logging,
//! the system store, the admin control surface and the HTTP server.
//!
//! ## Startup
//!
//! 1. [`HostConfig`] is loaded and validated
//! 2. The system store is opened and migrated (audit log, project configs,
//!    admin preferences)
//! 3. Seed projects from the config are created if they were never persisted
//! 4. Every persisted project is opened; one failing project never blocks the
//!    others
//! 5. The HTTP surface starts accepting requests
//!
//! ## Shutdown
//!
//! The server stops accepting, in-flight requests drain, then every project
//! closes and its plugins are deactivated in reverse activation order.
//!
//! ```rust,no_run
//! use game_host::{Host, HostConfig};
//! use plugin_runtime::PluginCatalog;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let host = Host::build(HostConfig::default(), PluginCatalog::new()).await?;
//! host.start().await?;
//! host.serve(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod http;
pub mod logging;
pub mod shutdown;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use plugin_runtime::core_tables::system_migrations;
use plugin_runtime::migration::{MigrationRunner, CORE_OWNER};
use plugin_runtime::{
    host_version, AuditLog, CapabilityRegistry, EventBus, PluginCatalog, PluginLoader, ProjectRegistry,
    RouteMountController, RuntimeError, RuntimeServices, StorageError, StorageHandle, SYSTEM_ACTOR,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub use admin::{AdminService, PreferenceStore};
pub use config::{ConfigError, HostConfig};
pub use http::AppState;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("system store: {0}")]
    Storage(#[from] StorageError),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

/// The assembled host process.
pub struct Host {
    config: HostConfig,
    registry: Arc<ProjectRegistry>,
    admin: AdminService,
    system: StorageHandle,
}

impl Host {
    /// Validates `config`, opens the system store and assembles the runtime.
    /// No project is opened yet; see [`start`](Self::start).
    pub async fn build(config: HostConfig, catalog: PluginCatalog) -> Result<Self, HostError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.storage.data_dir).await?;

        let system_path = config.system_store_path();
        if let Some(parent) = system_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let system = StorageHandle::open(&system_path)?;
        MigrationRunner::new(system.clone()).migrate(CORE_OWNER, &system_migrations())?;
        info!("🗄️ System store ready at {}", system_path.display());

        let capabilities = CapabilityRegistry::with_builtins(&config.builtin_capabilities());
        if config.is_production() {
            info!("🔒 Production mode: CLI bypass disabled");
        } else {
            warn!("⚠️ CLI bypass enabled for loopback admin requests (node_env = {})", config.server.node_env);
        }

        let services = RuntimeServices {
            loader: PluginLoader::new(config.plugins.roots.clone(), host_version()),
            catalog: Arc::new(catalog),
            routes: Arc::new(RouteMountController::new()),
            capabilities: Arc::new(capabilities),
            audit: AuditLog::new(system.clone(), EventBus::default()),
            settings: config.runtime_settings(),
        };
        for root in services.loader.roots() {
            info!("📦 Plugin root ({:?}): {}", root.kind, root.path.display());
        }

        let registry = Arc::new(ProjectRegistry::new(services, system.clone()));
        let admin = AdminService::new(registry.clone(), PreferenceStore::new(system.clone()));
        Ok(Self {
            config,
            registry,
            admin,
            system,
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    pub fn router(&self) -> axum::Router {
        http::router(AppState::new(self.admin.clone()))
    }

    /// Creates missing seed projects, then opens the whole fleet.
    pub async fn start(&self) -> Result<(), HostError> {
        let created = self.registry.seed(&self.config.projects, SYSTEM_ACTOR).await?;
        if !created.is_empty() {
            info!("🌱 Created seed project(s): {}", created.join(", "));
        }
        let failures = self.registry.open_all(SYSTEM_ACTOR).await?;
        for (project, err) in &failures {
            error!(project = %project, error = %err, "❌ Project failed to open");
        }
        Ok(())
    }

    /// Serves HTTP until `signal` completes, then closes every project.
    pub async fn serve<F>(&self, signal: F) -> Result<(), HostError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.server.bind_address).await?;
        info!("🚀 Listening on http://{}", listener.local_addr()?);

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                signal.await;
                info!("🛑 Shutdown requested, draining requests");
            })
            .await;

        self.shutdown().await;
        result?;
        Ok(())
    }

    /// Closes every project and the system store.
    pub async fn shutdown(&self) {
        shutdown::close_projects(&self.registry, shutdown::DEFAULT_DRAIN_TIMEOUT).await;
        self.system.close();
        info!("✅ Host stopped");
    }
}
