//! # Plugin Runtime - Multi-Tenant Plugin Core
//!
//! The runtime behind the game-backend host. It serves many isolated projects
//! from one process; each project has its own store, its own enabled plugin
//! set and its own slice of the HTTP surface.
//!
//! ## Architecture Overview
//!
//! Leaves first:
//!
//! * **Storage** ([`storage`]) - SQLite handle per project with a single
//!   writer and transactional scopes
//! * **Migrations** ([`migration`]) - per-owner versioned schema ledger with
//!   rollback
//! * **Manifests** ([`manifest`], [`schema`]) - the declarative contract of a
//!   bundle, including its config schema
//! * **Loader** ([`loader`]) - scans plugin roots into validated descriptors
//!   without running plugin code
//! * **Resolver** ([`resolver`]) - activation order, cycles, missing and
//!   mismatched dependencies
//! * **Lifecycle** ([`lifecycle`]) - the per-instance state machine with hook
//!   timeouts and resource cleanup
//! * **Routes** ([`routes`], [`capabilities`]) - lock-free per-project route
//!   tables with atomic swap, and the middleware capability set
//! * **Projects** ([`project`], [`registry`]) - per-project aggregate and the
//!   process-wide registry that serializes lifecycle work per project
//! * **Audit** ([`audit`], [`events`]) - durable per-project sequenced records
//!   plus a broadcast bus
//!
//! ## Plugin Code
//!
//! Plugin code is linked in at build time and registered in a
//! [`PluginCatalog`]. Manifests on disk reference handlers by name; the
//! catalog resolves them when an instance loads:
//!
//! ```rust,no_run
//! use plugin_runtime::{PluginCatalog, PluginResponse, StaticModule};
//! use serde_json::json;
//!
//! let catalog = PluginCatalog::new().with(
//!     StaticModule::new("greeter").handler("hello", |_req| async move {
//!         Ok(PluginResponse::ok(json!({ "hello": "world" })))
//!     }),
//! );
//! ```
//!
//! ## Concurrency
//!
//! Lifecycle operations on one project are serialized by the registry's
//! per-project lock; different projects proceed in parallel. Requests never
//! take that lock: they resolve the current route table snapshot once and
//! run to completion against it, even if a reload swaps the group meanwhile.

pub mod audit;
pub mod capabilities;
pub mod catalog;
pub mod core_tables;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod migration;
pub mod project;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod routes;
pub mod schema;
pub mod services;
pub mod storage;

pub use audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome, AuditQuery, AuditRecord, SYSTEM_ACTOR};
pub use capabilities::{BuiltinCapabilities, CapabilityRegistry, Middleware, ProjectCapabilities, Rejection, TokenTable};
pub use catalog::{DeactivationReason, NoHooks, PluginCatalog, PluginHooks, PluginModule, RouteHandler, StaticModule};
pub use error::{PluginError, Result, RuntimeError};
pub use events::{EventBus, LifecycleEvent};
pub use lifecycle::{HookTimeouts, LogLevel, PluginContext, PluginInstanceInfo, PluginState};
pub use loader::{PluginLoader, PluginRoot, RootKind};
pub use manifest::{HttpMethod, PluginManifest};
pub use project::{PluginSettings, ProjectConfig, ProjectSnapshot, ProjectState};
pub use registry::{ProjectEntry, ProjectRegistry};
pub use request::{IncomingRequest, PluginRequest, PluginResponse, Principal, RequestMeta, Role};
pub use routes::{RouteMountController, RouteScope};
pub use services::{RuntimeServices, RuntimeSettings};
pub use storage::{StorageError, StorageHandle};

/// Version of this runtime, checked against `hostMinVersion` in manifests.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// [`HOST_VERSION`] parsed.
pub fn host_version() -> semver::Version {
    semver::Version::parse(HOST_VERSION).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}
