//! # Built-in Plugins
//!
//! Code for the bundles shipped under `plugins/` at the repository root.
//! Each module exports its route handlers by the names the bundle manifest
//! uses, plus the lifecycle hooks the manifest declares.
//!
//! * **economy** - soft-currency wallets and a transaction ledger
//! * **achievements** - definitions and per-player unlocks
//! * **leaderboards** - score boards and an achievement-points ranking;
//!   depends on `achievements ^1`
//!
//! Tables are prefixed with the plugin id since every plugin of a project
//! shares the project's store.

pub mod achievements;
pub mod economy;
pub mod leaderboards;

use plugin_runtime::{PluginCatalog, PluginError, PluginRequest};
use serde::de::DeserializeOwned;

/// Every built-in module.
pub fn catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with(economy::module())
        .with(achievements::module())
        .with(leaderboards::module())
}

/// Deserializes the validated config a request was served with.
pub(crate) fn request_config<T: DeserializeOwned>(req: &PluginRequest) -> Result<T, PluginError> {
    serde_json::from_value(serde_json::Value::clone(&req.config)).map_err(|e| PluginError::Config(e.to_string()))
}

/// `?limit=` clamped to `1..=max`.
pub(crate) fn limit(req: &PluginRequest, default: i64, max: i64) -> Result<i64, PluginError> {
    match req.query("limit") {
        None => Ok(default.min(max)),
        Some(raw) => raw
            .parse::<i64>()
            .map(|n| n.clamp(1, max))
            .map_err(|_| PluginError::bad_request(format!("limit `{raw}` is not a number"))),
    }
}

/// Player ids are opaque but bounded.
pub(crate) fn player_id(raw: &str) -> Result<&str, PluginError> {
    if raw.is_empty() || raw.len() > 64 || raw.chars().any(char::is_control) {
        return Err(PluginError::bad_request("player id must be 1 to 64 printable characters"));
    }
    Ok(raw)
}
