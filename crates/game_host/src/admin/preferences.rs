//! Per-session admin console preferences, stored in `admin_preferences`.

use std::collections::BTreeMap;

use chrono::Utc;
use plugin_runtime::storage::{row_str, text};
use plugin_runtime::{Result, RuntimeError, StorageHandle};
use serde_json::Value;

const MAX_KEY_LEN: usize = 128;

#[derive(Clone)]
pub struct PreferenceStore {
    storage: StorageHandle,
}

impl PreferenceStore {
    /// Wraps the migrated system store.
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    pub fn list(&self, session: &str) -> Result<BTreeMap<String, Value>> {
        let rows = self.storage.query(
            "SELECT key, value_json FROM admin_preferences WHERE session = ?1 ORDER BY key",
            &[text(session)],
        )?;
        let mut prefs = BTreeMap::new();
        for row in &rows {
            if let (Some(key), Some(raw)) = (row_str(row, "key"), row_str(row, "value_json")) {
                prefs.insert(key.to_string(), serde_json::from_str(raw)?);
            }
        }
        Ok(prefs)
    }

    pub fn get(&self, session: &str, key: &str) -> Result<Option<Value>> {
        self.storage
            .query_one(
                "SELECT value_json FROM admin_preferences WHERE session = ?1 AND key = ?2",
                &[text(session), text(key)],
            )?
            .and_then(|row| row_str(&row, "value_json").map(serde_json::from_str))
            .transpose()
            .map_err(RuntimeError::from)
    }

    /// Inserts or replaces one preference.
    pub fn set(&self, session: &str, key: &str, value: &Value) -> Result<()> {
        validate(session, key)?;
        self.storage.exec(
            "INSERT INTO admin_preferences (session, key, value_json, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session, key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            &[
                text(session),
                text(key),
                text(serde_json::to_string(value)?),
                text(Utc::now().to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, session: &str, key: &str) -> Result<bool> {
        Ok(self.storage.exec(
            "DELETE FROM admin_preferences WHERE session = ?1 AND key = ?2",
            &[text(session), text(key)],
        )? > 0)
    }
}

fn validate(session: &str, key: &str) -> Result<()> {
    if session.trim().is_empty() {
        return Err(RuntimeError::invalid_input("admin session id is empty"));
    }
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(RuntimeError::invalid_input(format!(
            "preference key must be 1 to {MAX_KEY_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugin_runtime::core_tables::system_migrations;
    use plugin_runtime::migration::{MigrationRunner, CORE_OWNER};
    use serde_json::json;

    fn store() -> PreferenceStore {
        let storage = StorageHandle::open_in_memory().unwrap();
        MigrationRunner::new(storage.clone())
            .migrate(CORE_OWNER, &system_migrations())
            .unwrap();
        PreferenceStore::new(storage)
    }

    #[test]
    fn preferences_are_scoped_per_session() {
        let prefs = store();
        prefs.set("s1", "theme", &json!("dark")).unwrap();
        prefs.set("s1", "theme", &json!("light")).unwrap();
        prefs.set("s2", "columns", &json!(["id", "state"])).unwrap();

        assert_eq!(prefs.get("s1", "theme").unwrap(), Some(json!("light")));
        assert_eq!(prefs.list("s1").unwrap().len(), 1);
        assert_eq!(prefs.list("s2").unwrap()["columns"], json!(["id", "state"]));
        assert!(prefs.get("s2", "theme").unwrap().is_none());

        assert!(prefs.remove("s1", "theme").unwrap());
        assert!(!prefs.remove("s1", "theme").unwrap());
    }

    #[test]
    fn empty_keys_are_rejected() {
        let prefs = store();
        let err = prefs.set("s1", "", &json!(1)).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
