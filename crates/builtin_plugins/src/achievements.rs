//! Achievement definitions and per-player unlocks.

use async_trait::async_trait;
use chrono::Utc;
use plugin_runtime::storage::{row_i64, row_str, text, Row, SqlValue};
use plugin_runtime::{LogLevel, PluginContext, PluginError, PluginHooks, PluginRequest, PluginResponse, StaticModule};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{player_id, request_config};

pub const ID: &str = "achievements";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchievementsConfig {
    pub default_points: i64,
    pub allow_hidden: bool,
}

pub fn module() -> StaticModule {
    StaticModule::new(ID)
        .handler("listDefinitions", list_definitions)
        .handler("putDefinition", put_definition)
        .handler("deleteDefinition", delete_definition)
        .handler("playerAchievements", player_achievements)
        .handler("unlock", unlock)
        .hooks(|| AchievementsHooks)
}

#[derive(Debug, Deserialize)]
struct DefinitionBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    points: Option<i64>,
    #[serde(default)]
    hidden: bool,
}

fn definition_json(row: &Row) -> Value {
    json!({
        "id": row_str(row, "id"),
        "name": row_str(row, "name"),
        "description": row_str(row, "description"),
        "points": row_i64(row, "points"),
        "hidden": row_i64(row, "hidden") == Some(1),
    })
}

async fn list_definitions(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let include_hidden = matches!(req.query("includeHidden"), Some("true" | "1"));
    let rows = req.storage.query(
        "SELECT id, name, description, points, hidden FROM achievements_definitions
         WHERE hidden = 0 OR ?1 ORDER BY id",
        &[SqlValue::Integer(i64::from(include_hidden))],
    )?;
    Ok(PluginResponse::ok(Value::Array(rows.iter().map(definition_json).collect())))
}

async fn put_definition(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: AchievementsConfig = request_config(&req)?;
    let id = req.param("id")?.to_string();
    let body: DefinitionBody = req.json()?;
    if body.name.trim().is_empty() {
        return Err(PluginError::bad_request("name is required"));
    }
    if body.hidden && !config.allow_hidden {
        return Err(PluginError::bad_request("hidden achievements are disabled for this project"));
    }
    let points = body.points.unwrap_or(config.default_points);
    if points < 0 {
        return Err(PluginError::bad_request("points cannot be negative"));
    }

    req.storage.exec(
        "INSERT INTO achievements_definitions (id, name, description, points, hidden, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description,
             points = excluded.points, hidden = excluded.hidden, updated_at = excluded.updated_at",
        &[
            text(id.as_str()),
            text(body.name.as_str()),
            text(body.description.as_str()),
            SqlValue::Integer(points),
            SqlValue::Integer(i64::from(body.hidden)),
            text(Utc::now().to_rfc3339()),
        ],
    )?;
    Ok(PluginResponse::ok(json!({
        "id": id,
        "name": body.name,
        "description": body.description,
        "points": points,
        "hidden": body.hidden,
    })))
}

async fn delete_definition(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let id = req.param("id")?;
    let removed = req.storage.with_transaction(|tx| -> Result<usize, PluginError> {
        tx.exec("DELETE FROM achievements_unlocks WHERE achievement_id = ?1", &[text(id)])?;
        Ok(tx.exec("DELETE FROM achievements_definitions WHERE id = ?1", &[text(id)])?)
    })?;
    if removed == 0 {
        return Err(PluginError::NotFound(format!("achievement `{id}`")));
    }
    Ok(PluginResponse::no_content())
}

async fn player_achievements(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let player = player_id(req.param("player")?)?;
    let rows = req.storage.query(
        "SELECT d.id, d.name, d.points, u.unlocked_at FROM achievements_unlocks u
         JOIN achievements_definitions d ON d.id = u.achievement_id
         WHERE u.player = ?1 ORDER BY u.unlocked_at, d.id",
        &[text(player)],
    )?;
    let points: i64 = rows.iter().filter_map(|row| row_i64(row, "points")).sum();
    let unlocked: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row_str(row, "id"),
                "name": row_str(row, "name"),
                "points": row_i64(row, "points"),
                "unlockedAt": row_str(row, "unlocked_at"),
            })
        })
        .collect();
    Ok(PluginResponse::ok(json!({
        "player": player,
        "points": points,
        "unlocked": unlocked,
    })))
}

/// 201 on first unlock, 200 when the player already had it.
async fn unlock(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let player = player_id(req.param("player")?)?;
    let id = req.param("id")?;
    let now = Utc::now().to_rfc3339();

    let inserted = req.storage.with_transaction(|tx| -> Result<bool, PluginError> {
        let definition = tx.query_one("SELECT points FROM achievements_definitions WHERE id = ?1", &[text(id)])?;
        if definition.is_none() {
            return Err(PluginError::NotFound(format!("achievement `{id}`")));
        }
        Ok(tx.exec(
            "INSERT OR IGNORE INTO achievements_unlocks (player, achievement_id, unlocked_at) VALUES (?1, ?2, ?3)",
            &[text(player), text(id), text(now.as_str())],
        )? > 0)
    })?;

    let body = json!({ "player": player, "achievement": id, "newlyUnlocked": inserted });
    Ok(if inserted {
        PluginResponse::created(body)
    } else {
        PluginResponse::ok(body)
    })
}

struct AchievementsHooks;

#[async_trait]
impl PluginHooks for AchievementsHooks {
    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let definitions = ctx
            .storage()
            .query_one("SELECT COUNT(*) AS n FROM achievements_definitions", &[])?
            .and_then(|row| row_i64(&row, "n"))
            .unwrap_or(0);
        ctx.log(LogLevel::Info, &format!("🏆 Achievements active with {definitions} definition(s)"));
        Ok(())
    }
}
