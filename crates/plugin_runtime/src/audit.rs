//! Append-only plugin audit log.
//!
//! Records live in the system store's `plugin_audit_log` table. Each record
//! gets a per-project sequence number allocated inside the inserting
//! transaction, so sequences are gap-free and strictly increasing per project
//! across restarts. Committed records are then published on the [`EventBus`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, RuntimeError};
use crate::events::EventBus;
use crate::storage::{row_i64, row_str, text, Row, SqlValue, StorageError, StorageHandle};

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    Discovered,
    Loaded,
    Activated,
    Deactivated,
    Reloaded,
    Failed,
    Unloaded,
    RouteMounted,
    RouteUnmounted,
    MigrationApplied,
    MigrationRolledBack,
    ConfigChanged,
    ProjectCreated,
    ProjectClosed,
    ProjectDeleted,
}

impl AuditAction {
    pub const ALL: [AuditAction; 15] = [
        Self::Discovered,
        Self::Loaded,
        Self::Activated,
        Self::Deactivated,
        Self::Reloaded,
        Self::Failed,
        Self::Unloaded,
        Self::RouteMounted,
        Self::RouteUnmounted,
        Self::MigrationApplied,
        Self::MigrationRolledBack,
        Self::ConfigChanged,
        Self::ProjectCreated,
        Self::ProjectClosed,
        Self::ProjectDeleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
            Self::Reloaded => "reloaded",
            Self::Failed => "failed",
            Self::Unloaded => "unloaded",
            Self::RouteMounted => "route-mounted",
            Self::RouteUnmounted => "route-unmounted",
            Self::MigrationApplied => "migration-applied",
            Self::MigrationRolledBack => "migration-rolled-back",
            Self::ConfigChanged => "config-changed",
            Self::ProjectCreated => "project-created",
            Self::ProjectClosed => "project-closed",
            Self::ProjectDeleted => "project-deleted",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| RuntimeError::invalid_input(format!("unknown audit action `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub project_id: String,
    pub plugin_id: Option<String>,
    pub action: AuditAction,
    pub actor: String,
    pub details: Value,
    pub outcome: AuditOutcome,
    pub error_tag: Option<String>,
}

/// A record about to be written.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub project_id: String,
    pub plugin_id: Option<String>,
    pub action: AuditAction,
    pub actor: String,
    pub details: Value,
    pub outcome: AuditOutcome,
    pub error_tag: Option<String>,
}

impl AuditEntry {
    pub fn new(project_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            project_id: project_id.into(),
            plugin_id: None,
            action,
            actor: SYSTEM_ACTOR.to_string(),
            details: Value::Object(serde_json::Map::new()),
            outcome: AuditOutcome::Ok,
            error_tag: None,
        }
    }

    pub fn plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Marks the entry failed and merges the error's structured details.
    pub fn error(mut self, err: &RuntimeError) -> Self {
        self.outcome = AuditOutcome::Error;
        self.error_tag = Some(err.tag().to_string());
        let extra = err.details();
        match (&mut self.details, extra) {
            (Value::Object(details), Value::Object(extra)) => details.extend(extra),
            (details, extra) => *details = extra,
        }
        self
    }
}

/// Filters for [`AuditLog::query`]; empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub project: Option<String>,
    pub plugin: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

const DEFAULT_QUERY_LIMIT: u32 = 200;
const MAX_QUERY_LIMIT: u32 = 5000;

#[derive(Clone)]
pub struct AuditLog {
    storage: StorageHandle,
    bus: EventBus,
    last_ids: Arc<DashMap<String, i64>>,
}

impl AuditLog {
    /// Wraps an already-migrated system store.
    pub fn new(storage: StorageHandle, bus: EventBus) -> Self {
        Self {
            storage,
            bus,
            last_ids: Arc::new(DashMap::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Writes a record and publishes it.
    pub fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let ts = Utc::now();
        let details_json = serde_json::to_string(&entry.details)?;
        let outcome = match entry.outcome {
            AuditOutcome::Ok => "ok",
            AuditOutcome::Error => "error",
        };

        let (id, seq) = self.storage.with_transaction(|tx| {
            let next = tx
                .query_one(
                    "SELECT COALESCE(MAX(seq), 0) + 1 AS next FROM plugin_audit_log WHERE project_id = ?1",
                    &[text(entry.project_id.as_str())],
                )?
                .and_then(|row| row_i64(&row, "next"))
                .unwrap_or(1);
            tx.exec(
                "INSERT INTO plugin_audit_log
                    (ts, project_id, seq, plugin_id, action, actor, details_json, outcome, error_tag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                &[
                    text(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
                    text(entry.project_id.as_str()),
                    SqlValue::Integer(next),
                    optional_text(entry.plugin_id.as_deref()),
                    text(entry.action.as_str()),
                    text(entry.actor.as_str()),
                    text(details_json.as_str()),
                    text(outcome),
                    optional_text(entry.error_tag.as_deref()),
                ],
            )?;
            Ok::<_, StorageError>((tx.last_insert_rowid(), next))
        })?;

        let record = AuditRecord {
            id,
            seq,
            ts,
            project_id: entry.project_id,
            plugin_id: entry.plugin_id,
            action: entry.action,
            actor: entry.actor,
            details: entry.details,
            outcome: entry.outcome,
            error_tag: entry.error_tag,
        };
        self.last_ids.insert(record.project_id.clone(), id);
        self.bus.publish(Arc::new(record.clone()));
        Ok(record)
    }

    /// Like [`append`](Self::append) but logs instead of failing; lifecycle
    /// paths use it so a broken audit store never blocks a transition.
    pub fn record(&self, entry: AuditEntry) -> Option<i64> {
        let action = entry.action;
        match self.append(entry) {
            Ok(record) => Some(record.id),
            Err(err) => {
                warn!(action = %action, error = %err, "failed to write audit record");
                None
            }
        }
    }

    /// Id of the last record written for `project_id` by this process.
    pub fn last_id(&self, project_id: &str) -> Option<i64> {
        self.last_ids.get(project_id).map(|id| *id)
    }

    /// Records matching `filter`, newest first.
    pub fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut sql = String::from(
            "SELECT id, ts, project_id, seq, plugin_id, action, actor, details_json, outcome, error_tag
             FROM plugin_audit_log WHERE 1 = 1",
        );
        let mut params = Vec::new();
        if let Some(project) = &filter.project {
            params.push(text(project.as_str()));
            sql.push_str(&format!(" AND project_id = ?{}", params.len()));
        }
        if let Some(plugin) = &filter.plugin {
            params.push(text(plugin.as_str()));
            sql.push_str(&format!(" AND plugin_id = ?{}", params.len()));
        }
        if let Some(action) = filter.action {
            params.push(text(action.as_str()));
            sql.push_str(&format!(" AND action = ?{}", params.len()));
        }
        if let Some(since) = filter.since {
            params.push(text(since.to_rfc3339_opts(SecondsFormat::Micros, true)));
            sql.push_str(&format!(" AND ts >= ?{}", params.len()));
        }
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));

        self.storage
            .query(&sql, &params)?
            .iter()
            .map(record_from_row)
            .collect()
    }

    /// Records of one project in sequence order.
    pub fn project_history(&self, project_id: &str) -> Result<Vec<AuditRecord>> {
        let mut records = self.query(&AuditQuery {
            project: Some(project_id.to_string()),
            limit: Some(MAX_QUERY_LIMIT),
            ..AuditQuery::default()
        })?;
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}

fn optional_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| text(v))
}

fn record_from_row(row: &Row) -> Result<AuditRecord> {
    let corrupt = |column: &str| RuntimeError::invalid_input(format!("audit row has bad `{column}`"));
    let ts = row_str(row, "ts")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| corrupt("ts"))?;
    let outcome = match row_str(row, "outcome") {
        Some("ok") => AuditOutcome::Ok,
        Some("error") => AuditOutcome::Error,
        _ => return Err(corrupt("outcome")),
    };
    Ok(AuditRecord {
        id: row_i64(row, "id").ok_or_else(|| corrupt("id"))?,
        seq: row_i64(row, "seq").ok_or_else(|| corrupt("seq"))?,
        ts,
        project_id: row_str(row, "project_id").ok_or_else(|| corrupt("project_id"))?.to_string(),
        plugin_id: row_str(row, "plugin_id").map(String::from),
        action: row_str(row, "action").ok_or_else(|| corrupt("action"))?.parse()?,
        actor: row_str(row, "actor").unwrap_or(SYSTEM_ACTOR).to_string(),
        details: serde_json::from_str(row_str(row, "details_json").unwrap_or("{}"))?,
        outcome,
        error_tag: row_str(row, "error_tag").map(String::from),
    })
}
