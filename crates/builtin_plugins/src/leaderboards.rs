//! Score boards plus a ranking by achievement points.
//!
//! Reads `achievements_*` tables directly; the manifest's dependency on
//! `achievements ^1` guarantees they are migrated before this plugin loads.
//!
//! A background task keeps a per-board summary in the stashed state, so a
//! same-version reload starts with the previous instance's view and can log
//! what changed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use plugin_runtime::storage::{row_i64, row_str, text, SqlValue};
use plugin_runtime::{
    DeactivationReason, LogLevel, PluginContext, PluginError, PluginHooks, PluginRequest, PluginResponse,
    StaticModule, StorageHandle,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{limit, player_id, request_config};

pub const ID: &str = "leaderboards";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardsConfig {
    pub max_entries: i64,
    pub keep_best: bool,
    pub refresh_secs: u64,
}

pub fn module() -> StaticModule {
    StaticModule::new(ID)
        .handler("topScores", top_scores)
        .handler("submitScore", submit_score)
        .handler("resetBoard", reset_board)
        .handler("achievementRanking", achievement_ranking)
        .hooks(|| LeaderboardsHooks)
}

fn board_name(raw: &str) -> Result<&str, PluginError> {
    if raw.is_empty() || raw.len() > 48 || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(PluginError::bad_request(format!("invalid board name `{raw}`")));
    }
    Ok(raw)
}

/// Competition ranking: equal scores share a rank, the next rank skips.
fn ranked(rows: &[plugin_runtime::storage::Row], score_column: &str) -> Vec<(i64, i64)> {
    let mut out = Vec::with_capacity(rows.len());
    let mut previous: Option<(i64, i64)> = None;
    for (idx, row) in rows.iter().enumerate() {
        let score = row_i64(row, score_column).unwrap_or(0);
        let rank = match previous {
            Some((prev_score, prev_rank)) if prev_score == score => prev_rank,
            _ => idx as i64 + 1,
        };
        previous = Some((score, rank));
        out.push((rank, score));
    }
    out
}

/// Entries per board, keyed by board name.
pub fn board_summary(storage: &StorageHandle) -> Result<Map<String, Value>, PluginError> {
    let rows = storage.query(
        "SELECT board, COUNT(*) AS entries FROM leaderboards_scores GROUP BY board ORDER BY board",
        &[],
    )?;
    Ok(rows
        .iter()
        .filter_map(|row| Some((row_str(row, "board")?.to_string(), json!(row_i64(row, "entries")?))))
        .collect())
}

// ============================================================================
// Handlers
// ============================================================================

async fn top_scores(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: LeaderboardsConfig = request_config(&req)?;
    let board = board_name(req.param("board")?)?;
    let limit = limit(&req, config.max_entries, config.max_entries)?;
    let rows = req.storage.query(
        "SELECT player, score, submitted_at FROM leaderboards_scores
         WHERE board = ?1 ORDER BY score DESC, submitted_at ASC LIMIT ?2",
        &[text(board), SqlValue::Integer(limit)],
    )?;
    let entries: Vec<Value> = rows
        .iter()
        .zip(ranked(&rows, "score"))
        .map(|(row, (rank, score))| {
            json!({
                "rank": rank,
                "player": row_str(row, "player"),
                "score": score,
                "submittedAt": row_str(row, "submitted_at"),
            })
        })
        .collect();
    Ok(PluginResponse::ok(json!({ "board": board, "entries": entries })))
}

#[derive(Debug, Deserialize)]
struct ScoreBody {
    player: String,
    score: i64,
}

async fn submit_score(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: LeaderboardsConfig = request_config(&req)?;
    let board = board_name(req.param("board")?)?;
    let body: ScoreBody = req.json()?;
    let player = player_id(&body.player)?;

    let upsert = if config.keep_best {
        "INSERT INTO leaderboards_scores (board, player, score, submitted_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(board, player) DO UPDATE SET score = excluded.score, submitted_at = excluded.submitted_at
         WHERE excluded.score > leaderboards_scores.score"
    } else {
        "INSERT INTO leaderboards_scores (board, player, score, submitted_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(board, player) DO UPDATE SET score = excluded.score, submitted_at = excluded.submitted_at"
    };

    let (best, rank) = req.storage.with_transaction(|tx| -> Result<(i64, i64), PluginError> {
        tx.exec(
            upsert,
            &[
                text(board),
                text(player),
                SqlValue::Integer(body.score),
                text(Utc::now().to_rfc3339()),
            ],
        )?;
        let best = tx
            .query_one(
                "SELECT score FROM leaderboards_scores WHERE board = ?1 AND player = ?2",
                &[text(board), text(player)],
            )?
            .and_then(|row| row_i64(&row, "score"))
            .unwrap_or(body.score);
        let above = tx
            .query_one(
                "SELECT COUNT(*) AS n FROM leaderboards_scores WHERE board = ?1 AND score > ?2",
                &[text(board), SqlValue::Integer(best)],
            )?
            .and_then(|row| row_i64(&row, "n"))
            .unwrap_or(0);
        Ok((best, above + 1))
    })?;

    Ok(PluginResponse::ok(json!({
        "board": board,
        "player": player,
        "submitted": body.score,
        "score": best,
        "rank": rank,
    })))
}

async fn reset_board(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let board = board_name(req.param("board")?)?;
    let removed = req
        .storage
        .exec("DELETE FROM leaderboards_scores WHERE board = ?1", &[text(board)])?;
    Ok(PluginResponse::ok(json!({ "board": board, "removed": removed })))
}

async fn achievement_ranking(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: LeaderboardsConfig = request_config(&req)?;
    let limit = limit(&req, config.max_entries, config.max_entries)?;
    let rows = req.storage.query(
        "SELECT u.player AS player, SUM(d.points) AS points, COUNT(*) AS unlocked
         FROM achievements_unlocks u JOIN achievements_definitions d ON d.id = u.achievement_id
         GROUP BY u.player ORDER BY points DESC, u.player ASC LIMIT ?1",
        &[SqlValue::Integer(limit)],
    )?;
    let entries: Vec<Value> = rows
        .iter()
        .zip(ranked(&rows, "points"))
        .map(|(row, (rank, points))| {
            json!({
                "rank": rank,
                "player": row_str(row, "player"),
                "points": points,
                "unlocked": row_i64(row, "unlocked"),
            })
        })
        .collect();
    Ok(PluginResponse::ok(json!({ "entries": entries })))
}

// ============================================================================
// Hooks
// ============================================================================

struct LeaderboardsHooks;

#[async_trait]
impl PluginHooks for LeaderboardsHooks {
    async fn on_load(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        if let Some(previous) = ctx.previous_state().and_then(|s| s.get("boards")).and_then(Value::as_object) {
            ctx.log(
                LogLevel::Info,
                &format!("🔄 Leaderboards reloaded; previous instance tracked {} board(s)", previous.len()),
            );
        }
        Ok(())
    }

    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let config: LeaderboardsConfig = ctx.typed_config()?;
        // Fails loudly if the achievements tables are missing.
        ctx.storage()
            .query_one("SELECT COUNT(*) AS n FROM achievements_definitions", &[])?;

        stash_summary(ctx)?;
        let task_ctx = ctx.clone();
        let cancel = ctx.cancellation();
        let period = Duration::from_secs(config.refresh_secs.max(1));
        ctx.resources().spawn("board summary refresh", async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = stash_summary(&task_ctx) {
                            task_ctx.log(LogLevel::Warn, &format!("⚠️ Board summary refresh failed: {err}"));
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn on_deactivate(&self, ctx: &PluginContext, reason: DeactivationReason) -> Result<(), PluginError> {
        if reason == DeactivationReason::Reload {
            stash_summary(ctx)?;
        }
        Ok(())
    }
}

fn stash_summary(ctx: &PluginContext) -> Result<(), PluginError> {
    let boards = board_summary(ctx.storage())?;
    ctx.stash_state(json!({ "boards": boards, "refreshedAt": Utc::now().to_rfc3339() }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{request, store};
    use plugin_runtime::HttpMethod;

    const MIGRATIONS: [&str; 2] = [
        include_str!("../../../plugins/achievements/migrations/001_achievements.sql"),
        include_str!("../../../plugins/leaderboards/migrations/001_scores.sql"),
    ];

    fn config(keep_best: bool) -> Value {
        json!({ "maxEntries": 3, "keepBest": keep_best, "refreshSecs": 60 })
    }

    async fn submit(store: &StorageHandle, player: &str, score: i64, keep_best: bool) -> Value {
        let req = request(
            store,
            HttpMethod::Post,
            &[("board", "arena")],
            json!({ "player": player, "score": score }),
            config(keep_best),
        );
        submit_score(req).await.unwrap().body
    }

    #[tokio::test]
    async fn keep_best_ignores_lower_scores() {
        let store = store(&MIGRATIONS);
        assert_eq!(submit(&store, "ana", 50, true).await["score"], 50);
        let lower = submit(&store, "ana", 20, true).await;
        assert_eq!(lower["score"], 50);
        assert_eq!(lower["submitted"], 20);

        assert_eq!(submit(&store, "ana", 20, false).await["score"], 20);
    }

    #[tokio::test]
    async fn ties_share_a_rank_and_limit_caps_entries() {
        let store = store(&MIGRATIONS);
        for (player, score) in [("ana", 90), ("ben", 70), ("cy", 90), ("dee", 10)] {
            submit(&store, player, score, true).await;
        }
        let top = top_scores(request(&store, HttpMethod::Get, &[("board", "arena")], Value::Null, config(true)))
            .await
            .unwrap();
        let ranks: Vec<(i64, &str)> = top.body["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| (e["rank"].as_i64().unwrap(), e["player"].as_str().unwrap()))
            .collect();
        assert_eq!(ranks, vec![(1, "ana"), (1, "cy"), (3, "ben")]);

        assert_eq!(board_summary(&store).unwrap()["arena"], 4);
    }

    #[tokio::test]
    async fn achievement_points_rank_players() {
        let store = store(&MIGRATIONS);
        store
            .exec_batch(
                "INSERT INTO achievements_definitions (id, name, points, updated_at) VALUES
                    ('a', 'A', 10, 'now'), ('b', 'B', 30, 'now');
                 INSERT INTO achievements_unlocks (player, achievement_id, unlocked_at) VALUES
                    ('ana', 'a', 'now'), ('ben', 'a', 'now'), ('ben', 'b', 'now');",
            )
            .unwrap();
        let ranking = achievement_ranking(request(&store, HttpMethod::Get, &[], Value::Null, config(true)))
            .await
            .unwrap();
        assert_eq!(ranking.body["entries"][0]["player"], "ben");
        assert_eq!(ranking.body["entries"][0]["points"], 40);
        assert_eq!(ranking.body["entries"][1]["rank"], 2);
    }

    #[test]
    fn board_names_are_restricted() {
        assert!(board_name("arena-1").is_ok());
        assert!(board_name("../etc").is_err());
        assert!(board_name("").is_err());
    }
}
