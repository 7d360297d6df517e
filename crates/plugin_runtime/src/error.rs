//! Error types for the plugin runtime.
//!
//! [`RuntimeError`] is the single error surface of the runtime. Every variant
//! maps to a stable tag (used in audit records and admin responses) and an
//! HTTP-style status code.

use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::PluginState;
use crate::storage::StorageError;

/// Convenience alias used across the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors produced by discovery, resolution, lifecycle and project management.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid manifest at `{}`: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    #[error("duplicate plugin id `{id}`: `{}` already provides it, `{}` skipped", .existing.display(), .duplicate.display())]
    DuplicateManifest {
        id: String,
        existing: PathBuf,
        duplicate: PathBuf,
    },

    #[error("plugin `{plugin}` depends on `{dependency}` which is {reason}")]
    DependencyMissing {
        plugin: String,
        dependency: String,
        reason: String,
    },

    #[error("plugin `{plugin}` requires `{dependency}` {required}, found {found}")]
    DependencyVersionMismatch {
        plugin: String,
        dependency: String,
        required: String,
        found: String,
    },

    #[error("dependency cycle between {}", .members.join(" -> "))]
    DependencyCycle { members: Vec<String> },

    #[error("migration {version} of `{owner}` failed: {cause}")]
    MigrationFailure {
        owner: String,
        version: u32,
        cause: String,
    },

    #[error("reload of `{plugin}` refused: {reason}")]
    DowngradeRefused { plugin: String, reason: String },

    #[error("route {method} {path} of `{plugin}` conflicts with `{owner}`")]
    RouteConflict {
        plugin: String,
        method: String,
        path: String,
        owner: String,
    },

    #[error("unknown middleware tag `{tag}` on route of `{plugin}`")]
    UnknownMiddleware { plugin: String, tag: String },

    #[error("{hook} hook of `{plugin}` did not finish within {timeout_ms}ms")]
    HookTimeout {
        plugin: String,
        hook: &'static str,
        timeout_ms: u64,
    },

    #[error("{hook} hook of `{plugin}` failed: {message}")]
    HookFault {
        plugin: String,
        hook: &'static str,
        message: String,
    },

    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    #[error("invalid configuration for `{plugin}`: {}", .errors.join("; "))]
    ConfigInvalid { plugin: String, errors: Vec<String> },

    #[error("{resource} `{id}` not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{resource} `{id}` already exists")]
    Conflict { resource: &'static str, id: String },

    #[error("cannot {action} plugin `{plugin}` while {state}")]
    InvalidTransition {
        plugin: String,
        action: &'static str,
        state: PluginState,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(resource: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            resource,
            id: id.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn invalid_manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable tag for this error.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::InvalidManifest { .. } => "InvalidManifest",
            Self::DuplicateManifest { .. } => "DuplicateManifest",
            Self::DependencyMissing { .. } => "DependencyMissing",
            Self::DependencyVersionMismatch { .. } => "DependencyVersionMismatch",
            Self::DependencyCycle { .. } => "DependencyCycle",
            Self::MigrationFailure { .. } => "MigrationFailure",
            Self::DowngradeRefused { .. } => "DowngradeRefused",
            Self::RouteConflict { .. } => "RouteConflict",
            Self::UnknownMiddleware { .. } => "UnknownMiddleware",
            Self::HookTimeout { .. } => "HookTimeout",
            Self::HookFault { .. } => "HookFault",
            Self::StorageFailure(_) => "StorageFailure",
            Self::ConfigInvalid { .. } => "ConfigInvalid",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::InvalidInput(_) => "InvalidInput",
            Self::Cancelled(_) => "Cancelled",
            Self::Io(_) => "Io",
            Self::Json(_) => "InvalidInput",
        }
    }

    /// HTTP status used when this error crosses the admin surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidManifest { .. }
            | Self::ConfigInvalid { .. }
            | Self::UnknownMiddleware { .. }
            | Self::InvalidInput(_)
            | Self::Json(_) => 400,
            Self::NotFound { .. } => 404,
            Self::DuplicateManifest { .. }
            | Self::DependencyMissing { .. }
            | Self::DependencyVersionMismatch { .. }
            | Self::DependencyCycle { .. }
            | Self::DowngradeRefused { .. }
            | Self::RouteConflict { .. }
            | Self::Conflict { .. }
            | Self::InvalidTransition { .. }
            | Self::Cancelled(_) => 409,
            Self::MigrationFailure { .. }
            | Self::HookTimeout { .. }
            | Self::HookFault { .. }
            | Self::StorageFailure(_)
            | Self::Io(_) => 500,
        }
    }

    /// Structured details recorded alongside the tag in audit entries.
    pub fn details(&self) -> serde_json::Value {
        let mut details = serde_json::json!({
            "error": self.tag(),
            "message": self.to_string(),
        });
        let extra = match self {
            Self::DependencyCycle { members } => Some(("members", serde_json::json!(members))),
            Self::MigrationFailure { version, .. } => Some(("version", serde_json::json!(version))),
            Self::ConfigInvalid { errors, .. } => Some(("errors", serde_json::json!(errors))),
            Self::DependencyMissing { dependency, .. }
            | Self::DependencyVersionMismatch { dependency, .. } => {
                Some(("dependency", serde_json::json!(dependency)))
            }
            _ => None,
        };
        if let (Some((key, value)), Some(map)) = (extra, details.as_object_mut()) {
            map.insert(key.to_string(), value);
        }
        details
    }
}

/// Errors raised by plugin code: hooks and route handlers.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl PluginError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) | Self::Config(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Failed(_) | Self::Storage(_) => 500,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::Config(_) => "ConfigInvalid",
            Self::Failed(_) => "PluginFailed",
            Self::Storage(_) => "StorageFailure",
        }
    }
}
