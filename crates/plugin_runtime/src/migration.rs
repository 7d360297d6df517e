//! Versioned schema migrations.
//!
//! Every owner (the core schema, or one plugin) has an independent sequence of
//! migrations tracked in the `schema_migrations` ledger of the store it runs
//! against. Each migration and its ledger row are written in one transaction,
//! so a failure at version N leaves the ledger at N-1 with no partial schema.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, RuntimeError};
use crate::storage::{row_i64, row_str, text, SqlValue, StorageError, StorageHandle, Tx};

pub const LEDGER_TABLE: &str = "schema_migrations";

/// Ledger key for the host's own tables.
pub const CORE_OWNER: &str = "core";

/// Ledger key for a plugin's migrations.
pub fn plugin_owner(plugin_id: &str) -> String {
    format!("plugin:{plugin_id}")
}

pub type NativeStep = Arc<dyn Fn(&Tx<'_>) -> std::result::Result<(), StorageError> + Send + Sync>;

/// The body of one migration direction.
#[derive(Clone)]
pub enum MigrationStep {
    Sql(Arc<str>),
    Native(NativeStep),
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(&sql.len()).finish(),
            Self::Native(_) => f.write_str("Native"),
        }
    }
}

impl MigrationStep {
    fn run(&self, tx: &Tx<'_>) -> std::result::Result<(), StorageError> {
        match self {
            Self::Sql(sql) => tx.exec_batch(sql),
            Self::Native(step) => step(tx),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub up: MigrationStep,
    pub down: Option<MigrationStep>,
}

impl Migration {
    pub fn sql(version: u32, name: impl Into<String>, up: &str, down: Option<&str>) -> Self {
        Self {
            version,
            name: name.into(),
            up: MigrationStep::Sql(Arc::from(up)),
            down: down.map(|sql| MigrationStep::Sql(Arc::from(sql))),
        }
    }

    pub fn native<F>(version: u32, name: impl Into<String>, up: F) -> Self
    where
        F: Fn(&Tx<'_>) -> std::result::Result<(), StorageError> + Send + Sync + 'static,
    {
        Self {
            version,
            name: name.into(),
            up: MigrationStep::Native(Arc::new(up)),
            down: None,
        }
    }
}

/// What a migration run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub owner: String,
    pub applied: Vec<u32>,
    pub high_water: u32,
}

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub applied_at: String,
}

/// Applies and reverts migrations against one store.
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    storage: StorageHandle,
}

impl MigrationRunner {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    fn ensure_ledger(&self) -> Result<()> {
        self.storage.exec_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                owner TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (owner, version)
            );"
        ))?;
        Ok(())
    }

    /// Highest applied version for `owner`, 0 when nothing has run.
    pub fn high_water(&self, owner: &str) -> Result<u32> {
        self.ensure_ledger()?;
        let row = self.storage.query_one(
            &format!("SELECT COALESCE(MAX(version), 0) AS v FROM {LEDGER_TABLE} WHERE owner = ?1"),
            &[text(owner)],
        )?;
        Ok(row
            .as_ref()
            .and_then(|r| row_i64(r, "v"))
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0))
    }

    pub fn applied(&self, owner: &str) -> Result<Vec<AppliedMigration>> {
        self.ensure_ledger()?;
        let rows = self.storage.query(
            &format!(
                "SELECT version, name, applied_at FROM {LEDGER_TABLE} WHERE owner = ?1 ORDER BY version"
            ),
            &[text(owner)],
        )?;
        Ok(rows
            .iter()
            .map(|row| AppliedMigration {
                version: row_i64(row, "version")
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0),
                name: row_str(row, "name").unwrap_or_default().to_string(),
                applied_at: row_str(row, "applied_at").unwrap_or_default().to_string(),
            })
            .collect())
    }

    pub fn migrate(&self, owner: &str, migrations: &[Migration]) -> Result<MigrationReport> {
        self.migrate_with(owner, migrations, |_| {})
    }

    /// Applies every migration above the current high-water, in order.
    ///
    /// `on_applied` runs after each migration commits. Stops at the first
    /// failure and reports it as [`RuntimeError::MigrationFailure`]; versions
    /// committed before the failure stay applied.
    pub fn migrate_with<F>(
        &self,
        owner: &str,
        migrations: &[Migration],
        mut on_applied: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&Migration),
    {
        check_sequence(owner, migrations)?;
        let start = self.high_water(owner)?;
        let mut high_water = start;
        let mut applied = Vec::new();

        for migration in migrations.iter().filter(|m| m.version > start) {
            self.storage
                .with_transaction(|tx| {
                    migration.up.run(tx)?;
                    tx.exec(
                        &format!(
                            "INSERT INTO {LEDGER_TABLE} (owner, version, name, applied_at) VALUES (?1, ?2, ?3, ?4)"
                        ),
                        &[
                            text(owner),
                            SqlValue::Integer(i64::from(migration.version)),
                            text(migration.name.as_str()),
                            text(Utc::now().to_rfc3339()),
                        ],
                    )?;
                    Ok::<_, StorageError>(())
                })
                .map_err(|err| RuntimeError::MigrationFailure {
                    owner: owner.to_string(),
                    version: migration.version,
                    cause: err.to_string(),
                })?;

            info!(owner, version = migration.version, name = %migration.name, "applied migration");
            high_water = migration.version;
            applied.push(migration.version);
            on_applied(migration);
        }

        if applied.is_empty() {
            debug!(owner, high_water, "schema up to date");
        }
        Ok(MigrationReport {
            owner: owner.to_string(),
            applied,
            high_water,
        })
    }

    /// Reverts applied migrations above `to_version`, newest first.
    ///
    /// Already at or below the target is a no-op. Each revert deletes its
    /// ledger row in the same transaction as the down step.
    pub fn rollback<F>(
        &self,
        owner: &str,
        to_version: u32,
        migrations: &[Migration],
        mut on_reverted: F,
    ) -> Result<Vec<u32>>
    where
        F: FnMut(&Migration),
    {
        let mut pending: Vec<u32> = self
            .applied(owner)?
            .into_iter()
            .map(|m| m.version)
            .filter(|v| *v > to_version)
            .collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));

        let mut reverted = Vec::new();
        for version in pending {
            let migration = migrations
                .iter()
                .find(|m| m.version == version)
                .ok_or_else(|| RuntimeError::MigrationFailure {
                    owner: owner.to_string(),
                    version,
                    cause: "no descriptor for applied version".to_string(),
                })?;
            let down = migration
                .down
                .as_ref()
                .ok_or_else(|| RuntimeError::MigrationFailure {
                    owner: owner.to_string(),
                    version,
                    cause: "migration has no down step".to_string(),
                })?;

            self.storage
                .with_transaction(|tx| {
                    down.run(tx)?;
                    tx.exec(
                        &format!("DELETE FROM {LEDGER_TABLE} WHERE owner = ?1 AND version = ?2"),
                        &[text(owner), SqlValue::Integer(i64::from(version))],
                    )?;
                    Ok::<_, StorageError>(())
                })
                .map_err(|err| RuntimeError::MigrationFailure {
                    owner: owner.to_string(),
                    version,
                    cause: err.to_string(),
                })?;

            info!(owner, version, "reverted migration");
            reverted.push(version);
            on_reverted(migration);
        }
        Ok(reverted)
    }
}

fn check_sequence(owner: &str, migrations: &[Migration]) -> Result<()> {
    let mut previous = 0u32;
    for migration in migrations {
        if migration.version <= previous {
            return Err(RuntimeError::MigrationFailure {
                owner: owner.to_string(),
                version: migration.version,
                cause: format!(
                    "versions must be positive and strictly increasing (after {previous})"
                ),
            });
        }
        previous = migration.version;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StorageHandle {
        StorageHandle::open_in_memory().unwrap()
    }

    fn wallet_migrations() -> Vec<Migration> {
        vec![
            Migration::sql(
                1,
                "wallets",
                "CREATE TABLE wallets (player TEXT PRIMARY KEY, balance INTEGER NOT NULL DEFAULT 0);",
                Some("DROP TABLE wallets;"),
            ),
            Migration::sql(
                2,
                "ledger",
                "CREATE TABLE ledger (id INTEGER PRIMARY KEY, player TEXT NOT NULL, delta INTEGER NOT NULL);",
                Some("DROP TABLE ledger;"),
            ),
        ]
    }

    fn schema(store: &StorageHandle) -> Vec<String> {
        store
            .query(
                "SELECT sql FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' AND name != ?1 ORDER BY name",
                &[text(LEDGER_TABLE)],
            )
            .unwrap()
            .iter()
            .filter_map(|r| row_str(r, "sql").map(String::from))
            .collect()
    }

    #[test]
    fn migrate_is_idempotent() {
        let runner = MigrationRunner::new(store());
        let first = runner.migrate("plugin:economy", &wallet_migrations()).unwrap();
        assert_eq!(first.applied, vec![1, 2]);
        assert_eq!(first.high_water, 2);

        let second = runner.migrate("plugin:economy", &wallet_migrations()).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.high_water, 2);
        assert_eq!(runner.applied("plugin:economy").unwrap().len(), 2);
    }

    #[test]
    fn rollback_then_migrate_restores_schema() {
        let store = store();
        let runner = MigrationRunner::new(store.clone());
        runner.migrate("plugin:economy", &wallet_migrations()).unwrap();
        let before = schema(&store);

        let reverted = runner
            .rollback("plugin:economy", 0, &wallet_migrations(), |_| {})
            .unwrap();
        assert_eq!(reverted, vec![2, 1]);
        assert!(schema(&store).is_empty());
        assert_eq!(runner.high_water("plugin:economy").unwrap(), 0);

        runner.migrate("plugin:economy", &wallet_migrations()).unwrap();
        assert_eq!(schema(&store), before);
    }

    #[test]
    fn rollback_below_high_water_is_noop_when_already_there() {
        let runner = MigrationRunner::new(store());
        runner.migrate("core", &wallet_migrations()[..1]).unwrap();
        let reverted = runner.rollback("core", 3, &wallet_migrations(), |_| {}).unwrap();
        assert!(reverted.is_empty());
    }

    #[test]
    fn failure_leaves_previous_version_and_retry_succeeds() {
        let store = store();
        let runner = MigrationRunner::new(store.clone());
        let mut migrations = wallet_migrations();
        migrations.push(Migration::sql(
            3,
            "broken",
            "CREATE TABLE badges (id INTEGER); INSERT INTO nowhere VALUES (1);",
            None,
        ));

        let err = runner.migrate("plugin:economy", &migrations).unwrap_err();
        match err {
            RuntimeError::MigrationFailure { version, .. } => assert_eq!(version, 3),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(runner.high_water("plugin:economy").unwrap(), 2);
        assert!(!schema(&store).iter().any(|sql| sql.contains("badges")));

        migrations[2] = Migration::sql(3, "badges", "CREATE TABLE badges (id INTEGER);", None);
        let report = runner.migrate("plugin:economy", &migrations).unwrap();
        assert_eq!(report.applied, vec![3]);
    }

    #[test]
    fn non_increasing_versions_are_rejected() {
        let runner = MigrationRunner::new(store());
        let migrations = vec![
            Migration::sql(2, "b", "SELECT 1;", None),
            Migration::sql(1, "a", "SELECT 1;", None),
        ];
        assert!(matches!(
            runner.migrate("core", &migrations),
            Err(RuntimeError::MigrationFailure { version: 1, .. })
        ));
        assert_eq!(runner.high_water("core").unwrap(), 0);
    }

    #[test]
    fn later_run_applies_only_new_versions() {
        let runner = MigrationRunner::new(store());
        runner.migrate("plugin:economy", &wallet_migrations()[..1]).unwrap();

        let mut migrations = wallet_migrations();
        migrations.push(Migration::sql(3, "badges", "CREATE TABLE badges (id INTEGER);", None));
        let report = runner.migrate("plugin:economy", &migrations).unwrap();
        assert_eq!(report.applied, vec![2, 3]);
        assert_eq!(report.high_water, 3);
    }

    #[test]
    fn owners_are_independent() {
        let runner = MigrationRunner::new(store());
        runner.migrate("plugin:a", &wallet_migrations()[..1]).unwrap();
        assert_eq!(runner.high_water("plugin:a").unwrap(), 1);
        assert_eq!(runner.high_water("plugin:b").unwrap(), 0);
    }

    #[test]
    fn missing_down_step_fails_rollback() {
        let runner = MigrationRunner::new(store());
        let migrations = vec![Migration::native(1, "seed", |tx| {
            tx.exec_batch("CREATE TABLE seeded (id INTEGER);")
        })];
        runner.migrate("core", &migrations).unwrap();
        let err = runner.rollback("core", 0, &migrations, |_| {}).unwrap_err();
        assert_eq!(err.tag(), "MigrationFailure");
        assert_eq!(runner.high_water("core").unwrap(), 1);
    }
}
