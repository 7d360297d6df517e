//! Host-owned tables, migrated under the `core` ledger owner.

use crate::migration::Migration;

/// Tables of the process-wide system store.
pub fn system_migrations() -> Vec<Migration> {
    vec![
        Migration::sql(
            1,
            "plugin_audit_log",
            "CREATE TABLE plugin_audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                project_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                plugin_id TEXT,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                details_json TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_tag TEXT,
                UNIQUE (project_id, seq)
            );
            CREATE INDEX idx_plugin_audit_log_plugin ON plugin_audit_log (plugin_id);
            CREATE INDEX idx_plugin_audit_log_ts ON plugin_audit_log (ts DESC);",
            Some("DROP TABLE plugin_audit_log;"),
        ),
        Migration::sql(
            2,
            "admin_preferences",
            "CREATE TABLE admin_preferences (
                session TEXT NOT NULL,
                key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (session, key)
            );",
            Some("DROP TABLE admin_preferences;"),
        ),
        Migration::sql(
            3,
            "projects",
            "CREATE TABLE projects (
                id TEXT PRIMARY KEY,
                config_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
            Some("DROP TABLE projects;"),
        ),
    ]
}

/// Tables every project store carries before plugins migrate.
pub fn project_migrations() -> Vec<Migration> {
    vec![Migration::sql(
        1,
        "project_settings",
        "CREATE TABLE project_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
        Some("DROP TABLE project_settings;"),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationRunner, CORE_OWNER};
    use crate::storage::StorageHandle;

    #[test]
    fn system_schema_migrates_and_reverts() {
        let store = StorageHandle::open_in_memory().unwrap();
        let runner = MigrationRunner::new(store.clone());
        let report = runner.migrate(CORE_OWNER, &system_migrations()).unwrap();
        assert_eq!(report.high_water, 3);
        runner
            .rollback(CORE_OWNER, 0, &system_migrations(), |_| {})
            .unwrap();
        assert!(store
            .query("SELECT name FROM sqlite_master WHERE name = 'projects'", &[])
            .unwrap()
            .is_empty());
    }
}
