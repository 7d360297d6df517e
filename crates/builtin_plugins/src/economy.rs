//! Soft-currency wallets.
//!
//! A wallet springs into existence on its first write with the configured
//! starting balance. Every balance change appends a ledger row in the same
//! transaction, so `economy_wallets` always equals the sum of the ledger.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use plugin_runtime::storage::{row_i64, row_str, text, SqlValue, Tx};
use plugin_runtime::{
    DeactivationReason, LogLevel, PluginContext, PluginError, PluginHooks, PluginRequest, PluginResponse,
    StaticModule, StorageHandle,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{limit, player_id, request_config};

pub const ID: &str = "economy";

/// How often old ledger rows are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomyConfig {
    pub currency: String,
    pub starting_balance: i64,
    pub max_balance: i64,
    pub retention_days: i64,
}

pub fn module() -> StaticModule {
    StaticModule::new(ID)
        .handler("getWallet", get_wallet)
        .handler("credit", credit)
        .handler("debit", debit)
        .handler("transactions", transactions)
        .handler("transfer", transfer)
        .handler("stats", stats)
        .hooks(|| EconomyHooks)
}

// ============================================================================
// Ledger
// ============================================================================

fn balance_in(tx: &Tx<'_>, config: &EconomyConfig, player: &str) -> Result<i64, PluginError> {
    Ok(tx
        .query_one("SELECT balance FROM economy_wallets WHERE player = ?1", &[text(player)])?
        .and_then(|row| row_i64(&row, "balance"))
        .unwrap_or(config.starting_balance))
}

/// Applies `delta` to a wallet and records it. Returns the new balance.
fn apply(tx: &Tx<'_>, config: &EconomyConfig, player: &str, delta: i64, reason: &str) -> Result<i64, PluginError> {
    let current = balance_in(tx, config, player)?;
    let next = current
        .checked_add(delta)
        .ok_or_else(|| PluginError::bad_request("amount out of range"))?;
    if next < 0 {
        return Err(PluginError::Conflict(format!(
            "insufficient {} for `{player}`: balance {current}, needed {}",
            config.currency, -delta
        )));
    }
    if next > config.max_balance {
        return Err(PluginError::Conflict(format!(
            "`{player}` would exceed the maximum balance of {}",
            config.max_balance
        )));
    }

    let now = Utc::now().to_rfc3339();
    tx.exec(
        "INSERT INTO economy_wallets (player, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(player) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
        &[text(player), SqlValue::Integer(next), text(now.as_str())],
    )?;
    tx.exec(
        "INSERT INTO economy_transactions (player, delta, balance, reason, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        &[
            text(player),
            SqlValue::Integer(delta),
            SqlValue::Integer(next),
            text(reason),
            text(now),
        ],
    )?;
    Ok(next)
}

/// Deletes ledger rows older than `retention_days`.
pub fn prune_ledger(storage: &StorageHandle, retention_days: i64) -> Result<usize, PluginError> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    Ok(storage.exec(
        "DELETE FROM economy_transactions WHERE created_at < ?1",
        &[text(cutoff.to_rfc3339())],
    )?)
}

#[derive(Debug, Deserialize)]
struct AmountBody {
    amount: i64,
    #[serde(default)]
    reason: Option<String>,
}

impl AmountBody {
    fn parse(req: &PluginRequest) -> Result<Self, PluginError> {
        let body: Self = req.json()?;
        if body.amount <= 0 {
            return Err(PluginError::bad_request("amount must be positive"));
        }
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct TransferBody {
    from: String,
    to: String,
    amount: i64,
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_wallet(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: EconomyConfig = request_config(&req)?;
    let player = player_id(req.param("player")?)?;
    let balance = req
        .storage
        .query_one("SELECT balance FROM economy_wallets WHERE player = ?1", &[text(player)])?
        .and_then(|row| row_i64(&row, "balance"))
        .unwrap_or(config.starting_balance);
    Ok(PluginResponse::ok(json!({
        "player": player,
        "balance": balance,
        "currency": config.currency,
    })))
}

async fn credit(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    change(req, 1).await
}

async fn debit(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    change(req, -1).await
}

async fn change(req: PluginRequest, sign: i64) -> Result<PluginResponse, PluginError> {
    let config: EconomyConfig = request_config(&req)?;
    let player = player_id(req.param("player")?)?;
    let body = AmountBody::parse(&req)?;
    let reason = body
        .reason
        .unwrap_or_else(|| if sign > 0 { "credit" } else { "debit" }.to_string());
    let balance = req
        .storage
        .with_transaction(|tx| apply(tx, &config, player, sign * body.amount, &reason))?;
    debug!(project = %req.project_id, player, delta = sign * body.amount, "wallet updated");
    Ok(PluginResponse::ok(json!({
        "player": player,
        "balance": balance,
        "currency": config.currency,
    })))
}

async fn transfer(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: EconomyConfig = request_config(&req)?;
    let body: TransferBody = req.json()?;
    let from = player_id(&body.from)?;
    let to = player_id(&body.to)?;
    if from == to {
        return Err(PluginError::bad_request("cannot transfer to the same wallet"));
    }
    if body.amount <= 0 {
        return Err(PluginError::bad_request("amount must be positive"));
    }

    let (from_balance, to_balance) = req.storage.with_transaction(|tx| -> Result<_, PluginError> {
        let from_balance = apply(tx, &config, from, -body.amount, &format!("transfer to {to}"))?;
        let to_balance = apply(tx, &config, to, body.amount, &format!("transfer from {from}"))?;
        Ok((from_balance, to_balance))
    })?;
    Ok(PluginResponse::ok(json!({
        "from": { "player": from, "balance": from_balance },
        "to": { "player": to, "balance": to_balance },
        "amount": body.amount,
        "currency": config.currency,
    })))
}

async fn transactions(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let player = player_id(req.param("player")?)?;
    let limit = limit(&req, 50, 500)?;
    let rows = req.storage.query(
        "SELECT id, delta, balance, reason, created_at FROM economy_transactions
         WHERE player = ?1 ORDER BY id DESC LIMIT ?2",
        &[text(player), SqlValue::Integer(limit)],
    )?;
    let entries: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row_i64(row, "id"),
                "delta": row_i64(row, "delta"),
                "balance": row_i64(row, "balance"),
                "reason": row_str(row, "reason"),
                "createdAt": row_str(row, "created_at"),
            })
        })
        .collect();
    Ok(PluginResponse::ok(json!({ "player": player, "transactions": entries })))
}

async fn stats(req: PluginRequest) -> Result<PluginResponse, PluginError> {
    let config: EconomyConfig = request_config(&req)?;
    let wallets = req
        .storage
        .query_one("SELECT COUNT(*) AS wallets, COALESCE(SUM(balance), 0) AS supply FROM economy_wallets", &[])?
        .unwrap_or_default();
    let ledger = req
        .storage
        .query_one("SELECT COUNT(*) AS entries FROM economy_transactions", &[])?
        .unwrap_or_default();
    Ok(PluginResponse::ok(json!({
        "currency": config.currency,
        "wallets": row_i64(&wallets, "wallets").unwrap_or(0),
        "supply": row_i64(&wallets, "supply").unwrap_or(0),
        "ledgerEntries": row_i64(&ledger, "entries").unwrap_or(0),
    })))
}

// ============================================================================
// Hooks
// ============================================================================

struct EconomyHooks;

#[async_trait]
impl PluginHooks for EconomyHooks {
    async fn on_load(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let config: EconomyConfig = ctx.typed_config()?;
        if config.starting_balance > config.max_balance {
            return Err(PluginError::Config(format!(
                "startingBalance {} exceeds maxBalance {}",
                config.starting_balance, config.max_balance
            )));
        }
        Ok(())
    }

    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let config: EconomyConfig = ctx.typed_config()?;
        let storage = ctx.storage().clone();
        let project = ctx.project_id().to_string();
        ctx.resources().spawn("ledger retention", async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                match prune_ledger(&storage, config.retention_days) {
                    Ok(0) => {}
                    Ok(removed) => debug!(project = %project, removed, "pruned economy ledger"),
                    Err(err) => warn!(project = %project, error = %err, "⚠️ Ledger pruning failed"),
                }
            }
        });

        let wallets = ctx
            .storage()
            .query_one("SELECT COUNT(*) AS n FROM economy_wallets", &[])?
            .and_then(|row| row_i64(&row, "n"))
            .unwrap_or(0);
        ctx.log(LogLevel::Info, &format!("💰 Economy active with {wallets} wallet(s)"));
        Ok(())
    }

    async fn on_deactivate(&self, ctx: &PluginContext, reason: DeactivationReason) -> Result<(), PluginError> {
        ctx.log(LogLevel::Info, &format!("💰 Economy stopping ({reason})"));
        Ok(())
    }
}
