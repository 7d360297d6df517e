mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{file_refs, info_module, manifest, migration_set, Harness, ACTOR};
use plugin_runtime::migration::{plugin_owner, MigrationRunner};
use plugin_runtime::{
    AuditAction, DeactivationReason, HookTimeouts, PluginCatalog, PluginContext, PluginError, PluginHooks,
    PluginSettings, PluginState, ProjectConfig, ProjectState, RuntimeError,
};
use serde_json::{json, Value};

struct Flaky {
    released: Arc<AtomicUsize>,
    aborted: Arc<AtomicBool>,
}

#[async_trait]
impl PluginHooks for Flaky {
    async fn on_load(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let released = self.released.clone();
        ctx.resources().register_cleanup("warm cache", move || {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Ok(())
    }

    async fn on_activate(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Err(PluginError::failed("cache warmup failed"))
    }

    async fn on_deactivate(&self, _ctx: &PluginContext, reason: DeactivationReason) -> Result<(), PluginError> {
        if reason.aborted_activation() {
            self.aborted.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct Sleepy;

#[async_trait]
impl PluginHooks for Sleepy {
    async fn on_activate(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

fn with_hooks(mut manifest: Value, hooks: &[&str]) -> Value {
    manifest["lifecycleHooks"] = json!(hooks);
    manifest
}

fn with_deps(mut manifest: Value, deps: &[&str]) -> Value {
    manifest["dependencies"] = deps.iter().map(|d| json!({ "id": d })).collect();
    manifest
}

fn project(plugins: &[&str]) -> ProjectConfig {
    plugins.iter().fold(ProjectConfig::new("alpha").in_memory(), |config, id| {
        config.with_plugin(*id, PluginSettings::default())
    })
}

#[tokio::test]
async fn failed_activation_cleans_up() {
    let released = Arc::new(AtomicUsize::new(0));
    let aborted = Arc::new(AtomicBool::new(false));
    let (r, a) = (released.clone(), aborted.clone());
    let harness = Harness::new(PluginCatalog::new().with(info_module("flaky").hooks(move || Flaky {
        released: r.clone(),
        aborted: a.clone(),
    })));
    harness.write_bundle(
        with_hooks(manifest("flaky", "1.0.0"), &["onLoad", "onActivate", "onDeactivate"]),
        &[],
    );

    let registry = harness.registry();
    let snapshot = registry.create(project(&["flaky"]), ACTOR).await.unwrap();

    let flaky = snapshot.plugin("flaky").unwrap();
    assert_eq!(flaky.state, PluginState::Failed);
    assert_eq!(flaky.last_error.as_ref().unwrap().error, "HookFault");
    assert_eq!(snapshot.state, ProjectState::Ready, "optional plugin failures do not degrade");
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(aborted.load(Ordering::SeqCst));
    assert!(harness.services.routes.mounted_plugins("alpha").is_empty());

    let failed = harness
        .history("alpha")
        .into_iter()
        .find(|r| r.action == AuditAction::Failed && r.plugin_id.as_deref() == Some("flaky"))
        .unwrap();
    assert_eq!(failed.error_tag.as_deref(), Some("HookFault"));
}

#[tokio::test]
async fn hook_timeout_fails_required_plugin_and_degrades() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("sleepy").hooks(|| Sleepy)));
    harness.write_bundle(with_hooks(manifest("sleepy", "1.0.0"), &["onActivate"]), &[]);

    let timeouts = HookTimeouts {
        activate_ms: 50,
        ..HookTimeouts::default()
    };
    let config = ProjectConfig::new("alpha")
        .in_memory()
        .with_plugin("sleepy", PluginSettings::required().with_timeouts(timeouts));
    let snapshot = harness.registry().create(config, ACTOR).await.unwrap();

    assert_eq!(snapshot.state, ProjectState::Degraded);
    let sleepy = snapshot.plugin("sleepy").unwrap();
    assert_eq!(sleepy.state, PluginState::Failed);
    assert_eq!(sleepy.last_error.as_ref().unwrap().error, "HookTimeout");
    assert!(snapshot.degraded_reasons[0].starts_with("sleepy"));
}

#[tokio::test]
async fn deactivation_runs_in_reverse_activation_order() {
    let catalog = ["a", "b", "c", "d"]
        .into_iter()
        .fold(PluginCatalog::new(), |catalog, id| catalog.with(info_module(id)));
    let harness = Harness::new(catalog);
    harness.write_bundle(manifest("a", "1.0.0"), &[]);
    harness.write_bundle(with_deps(manifest("b", "1.0.0"), &["a"]), &[]);
    harness.write_bundle(with_deps(manifest("c", "1.0.0"), &["b"]), &[]);
    harness.write_bundle(manifest("d", "1.0.0"), &[]);

    let registry = harness.registry();
    let snapshot = registry.create(project(&["a", "b", "c", "d"]), ACTOR).await.unwrap();
    assert_eq!(snapshot.activation_order, vec!["a", "b", "c", "d"]);

    let entry = registry.require("alpha").await.unwrap();
    let mut project = entry.lock().await;
    let visited = project
        .deactivate_all(ACTOR, DeactivationReason::ProjectClosing)
        .await;
    assert_eq!(visited, vec!["d", "c", "b", "a"]);
    assert!(harness.services.routes.mounted_plugins("alpha").is_empty());
}

#[tokio::test]
async fn active_set_tracks_mounted_groups() {
    let catalog = ["economy", "achievements", "leaderboards"]
        .into_iter()
        .fold(PluginCatalog::new(), |catalog, id| catalog.with(info_module(id)));
    let harness = Harness::new(catalog);
    harness.write_bundle(manifest("economy", "1.0.0"), &[]);
    harness.write_bundle(manifest("achievements", "1.0.0"), &[]);
    harness.write_bundle(with_deps(manifest("leaderboards", "1.0.0"), &["achievements"]), &[]);

    let registry = harness.registry();
    registry
        .create(project(&["economy", "achievements", "leaderboards"]), ACTOR)
        .await
        .unwrap();
    let entry = registry.require("alpha").await.unwrap();
    let mut project = entry.lock().await;
    let routes = harness.services.routes.clone();
    let check = |project: &plugin_runtime::project::ProjectContext| {
        assert_eq!(project.active_set(), routes.mounted_plugins("alpha"));
    };
    check(&*project);

    let outcome = project.disable("achievements", ACTOR).await.unwrap();
    let order: Vec<&str> = outcome.reports.iter().map(|r| r.plugin_id.as_str()).collect();
    assert_eq!(order, vec!["leaderboards", "achievements"]);
    check(&*project);
    assert_eq!(project.state(), ProjectState::Degraded);

    project.enable("achievements", ACTOR).await.unwrap();
    check(&*project);
    assert_eq!(project.state(), ProjectState::Ready);
    assert!(project.plugin("leaderboards").unwrap().is_active());

    project.toggle("economy", ACTOR).await.unwrap();
    check(&*project);
    project.reload_plugin("leaderboards", ACTOR).await.unwrap();
    check(&*project);
    assert!(matches!(
        project.enable("achievements", ACTOR).await,
        Err(RuntimeError::Conflict { .. })
    ));
    check(&*project);
}

#[tokio::test]
async fn reload_applies_new_migrations_and_swaps_routes() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("economy")));
    let (entries, files) = migration_set("eco", 1);
    let mut v1 = manifest("economy", "1.0.0");
    v1["migrations"] = entries;
    harness.write_bundle(v1, &file_refs(&files));

    let registry = harness.registry();
    registry.create(project(&["economy"]), ACTOR).await.unwrap();
    assert_eq!(harness.get("alpha", "economy", "/economy/info").await.status, 200);

    let (entries, files) = migration_set("eco", 2);
    let mut v2 = manifest("economy", "1.1.0");
    v2["migrations"] = entries;
    harness.write_bundle(v2, &file_refs(&files));

    let entry = registry.require("alpha").await.unwrap();
    let info = entry.lock().await.reload_plugin("economy", ACTOR).await.unwrap();
    assert_eq!(info.version, "1.1.0");
    assert_eq!(info.state, PluginState::Active);
    assert_eq!(harness.get("alpha", "economy", "/economy/info").await.status, 200);

    let store = entry.lock().await.storage().cloned().unwrap();
    assert_eq!(MigrationRunner::new(store).high_water(&plugin_owner("economy")).unwrap(), 2);

    let history = harness.history("alpha");
    let migrated = history
        .iter()
        .rposition(|r| r.action == AuditAction::MigrationApplied && r.details["version"] == 2)
        .unwrap();
    let reloaded = history
        .iter()
        .rposition(|r| r.action == AuditAction::Reloaded)
        .unwrap();
    assert!(migrated < reloaded);
    assert!(history[reloaded].error_tag.is_none());
}

#[tokio::test]
async fn reload_refuses_migration_downgrade() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("economy")));
    let (entries, files) = migration_set("eco", 5);
    let mut v1 = manifest("economy", "1.0.0");
    v1["migrations"] = entries;
    harness.write_bundle(v1, &file_refs(&files));

    let registry = harness.registry();
    registry.create(project(&["economy"]), ACTOR).await.unwrap();

    let (entries, _) = migration_set("eco", 3);
    let mut shrunk = manifest("economy", "1.2.0");
    shrunk["migrations"] = entries;
    harness.write_bundle(shrunk, &[]);

    let entry = registry.require("alpha").await.unwrap();
    let mut project = entry.lock().await;
    let err = project.reload_plugin("economy", ACTOR).await.unwrap_err();
    assert!(matches!(err, RuntimeError::DowngradeRefused { .. }));
    assert_eq!(err.status_code(), 409);

    let economy = project.plugin("economy").unwrap();
    assert!(economy.is_active());
    assert_eq!(economy.manifest().version.to_string(), "1.0.0");
    drop(project);
    assert_eq!(harness.get("alpha", "economy", "/economy/info").await.status, 200);
}

#[tokio::test]
async fn migration_failure_resumes_from_failed_version() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("ledger")));
    let mut broken = manifest("ledger", "1.0.0");
    broken["migrations"] = json!([
        { "version": 1, "name": "accounts", "up": "migrations/001.sql" },
        { "version": 2, "name": "entries", "up": "migrations/002.sql" }
    ]);
    let bundle = harness.write_bundle(
        broken,
        &[
            ("migrations/001.sql", "CREATE TABLE accounts (id INTEGER PRIMARY KEY);"),
            ("migrations/002.sql", "CREATE TABLE entries (id INTEGER PRIMARY KEY, account REFERENCES;"),
        ],
    );

    let registry = harness.registry();
    let snapshot = registry.create(project(&["ledger"]), ACTOR).await.unwrap();
    let ledger = snapshot.plugin("ledger").unwrap();
    assert_eq!(ledger.state, PluginState::Failed);
    assert_eq!(ledger.last_error.as_ref().unwrap().error, "MigrationFailure");

    let entry = registry.require("alpha").await.unwrap();
    let store = entry.lock().await.storage().cloned().unwrap();
    let runner = MigrationRunner::new(store);
    assert_eq!(runner.high_water(&plugin_owner("ledger")).unwrap(), 1);

    std::fs::write(
        bundle.join("migrations/002.sql"),
        "CREATE TABLE entries (id INTEGER PRIMARY KEY, account INTEGER REFERENCES accounts(id));",
    )
    .unwrap();
    let info = entry.lock().await.enable("ledger", ACTOR).await.unwrap();
    assert_eq!(info.state, PluginState::Active);
    let applied: Vec<u32> = runner
        .applied(&plugin_owner("ledger"))
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(applied, vec![1, 2]);
}

#[tokio::test]
async fn missing_dependency_leaves_plugin_loaded() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("leaderboards")));
    harness.write_bundle(with_deps(manifest("leaderboards", "1.0.0"), &["achievements"]), &[]);

    let snapshot = harness
        .registry()
        .create(project(&["leaderboards"]), ACTOR)
        .await
        .unwrap();
    assert_eq!(snapshot.state, ProjectState::Degraded);
    assert_eq!(snapshot.plugin("leaderboards").unwrap().state, PluginState::Loaded);
    assert!(harness.services.routes.mounted_plugins("alpha").is_empty());
    assert_eq!(snapshot.blocked[0].error, "DependencyMissing");
}

#[tokio::test]
async fn dependency_cycle_degrades_with_members() {
    let catalog = PluginCatalog::new().with(info_module("a")).with(info_module("b"));
    let harness = Harness::new(catalog);
    harness.write_bundle(with_deps(manifest("a", "1.0.0"), &["b"]), &[]);
    harness.write_bundle(with_deps(manifest("b", "1.0.0"), &["a"]), &[]);

    let snapshot = harness.registry().create(project(&["a", "b"]), ACTOR).await.unwrap();
    assert_eq!(snapshot.state, ProjectState::Degraded);
    assert!(harness.services.routes.mounted_plugins("alpha").is_empty());

    let failed: Vec<_> = harness
        .history("alpha")
        .into_iter()
        .filter(|r| r.action == AuditAction::Failed)
        .collect();
    assert_eq!(failed.len(), 2);
    for record in failed {
        assert_eq!(record.error_tag.as_deref(), Some("DependencyCycle"));
        assert_eq!(record.details["members"], json!(["a", "b"]));
    }
}

#[tokio::test]
async fn invalid_config_update_keeps_previous_config() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("economy")));
    let mut economy = manifest("economy", "1.0.0");
    economy["configSchema"] = json!({
        "type": "object",
        "properties": {
            "currency": { "type": "string", "default": "gold" },
            "startingBalance": { "type": "integer", "minimum": 0, "default": 100 }
        }
    });
    harness.write_bundle(economy, &[]);

    let registry = harness.registry();
    registry.create(project(&["economy"]), ACTOR).await.unwrap();
    let entry = registry.require("alpha").await.unwrap();
    let mut project = entry.lock().await;
    assert_eq!(
        project.get_config("economy").unwrap(),
        json!({ "currency": "gold", "startingBalance": 100 })
    );

    let err = project
        .update_config("economy", json!({ "startingBalance": -5 }), ACTOR)
        .unwrap_err();
    assert_eq!(err.tag(), "ConfigInvalid");
    assert_eq!(project.get_config("economy").unwrap()["startingBalance"], 100);

    let updated = project
        .update_config("economy", json!({ "currency": "gems" }), ACTOR)
        .unwrap();
    assert_eq!(updated["currency"], "gems");
    assert_eq!(project.get_config("economy").unwrap()["currency"], "gems");
}

struct Stateful {
    seen: Arc<Mutex<Vec<Option<Value>>>>,
}

#[async_trait]
impl PluginHooks for Stateful {
    async fn on_load(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.seen.lock().unwrap().push(ctx.previous_state().cloned());
        Ok(())
    }

    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        ctx.stash_state(json!({ "warm": true }));
        Ok(())
    }
}

#[tokio::test]
async fn same_version_reload_hands_over_stashed_state() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hooks_seen = seen.clone();
    let harness = Harness::new(PluginCatalog::new().with(info_module("economy").hooks(move || Stateful {
        seen: hooks_seen.clone(),
    })));
    harness.write_bundle(with_hooks(manifest("economy", "1.0.0"), &["onLoad", "onActivate"]), &[]);

    let registry = harness.registry();
    registry.create(project(&["economy"]), ACTOR).await.unwrap();
    let entry = registry.require("alpha").await.unwrap();
    entry.lock().await.reload_plugin("economy", ACTOR).await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![None, Some(json!({ "warm": true }))]);
}

struct PickyUpgrade;

#[async_trait]
impl PluginHooks for PickyUpgrade {
    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        if ctx.version().minor > 0 {
            return Err(PluginError::failed("upgrade refused"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn failed_reload_rolls_back_its_migrations() {
    let harness = Harness::new(PluginCatalog::new().with(info_module("economy").hooks(|| PickyUpgrade)));
    let (entries, files) = migration_set("eco", 1);
    let mut v1 = with_hooks(manifest("economy", "1.0.0"), &["onActivate"]);
    v1["migrations"] = entries;
    harness.write_bundle(v1, &file_refs(&files));

    let registry = harness.registry();
    registry.create(project(&["economy"]), ACTOR).await.unwrap();

    let (entries, files) = migration_set("eco", 2);
    let mut v2 = with_hooks(manifest("economy", "1.1.0"), &["onActivate"]);
    v2["migrations"] = entries;
    harness.write_bundle(v2, &file_refs(&files));

    let entry = registry.require("alpha").await.unwrap();
    let err = entry.lock().await.reload_plugin("economy", ACTOR).await.unwrap_err();
    assert_eq!(err.tag(), "HookFault");

    {
        let project = entry.lock().await;
        let economy = project.plugin("economy").unwrap();
        assert!(economy.is_active());
        assert_eq!(economy.manifest().version.to_string(), "1.0.0");
    }
    assert_eq!(harness.get("alpha", "economy", "/economy/info").await.status, 200);

    let store = entry.lock().await.storage().cloned().unwrap();
    assert_eq!(MigrationRunner::new(store.clone()).high_water(&plugin_owner("economy")).unwrap(), 1);
    assert!(store
        .query("SELECT name FROM sqlite_master WHERE name = 't_eco_2'", &[])
        .unwrap()
        .is_empty());

    let history = harness.history("alpha");
    let applied = history
        .iter()
        .rposition(|r| r.action == AuditAction::MigrationApplied && r.details["version"] == 2)
        .unwrap();
    let rolled_back = history
        .iter()
        .rposition(|r| r.action == AuditAction::MigrationRolledBack && r.details["version"] == 2)
        .unwrap();
    assert!(applied < rolled_back);
    assert_eq!(history[rolled_back].plugin_id.as_deref(), Some("economy"));
}

struct Patient {
    started: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl PluginHooks for Patient {
    async fn on_activate(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.started.notify_one();
        ctx.cancellation().cancelled().await;
        Ok(())
    }
}

#[tokio::test]
async fn closing_a_project_interrupts_a_running_activation() {
    let started = Arc::new(tokio::sync::Notify::new());
    let notify = started.clone();
    let harness = Harness::new(PluginCatalog::new().with(info_module("patient").hooks(move || Patient {
        started: notify.clone(),
    })));
    harness.write_bundle(with_hooks(manifest("patient", "1.0.0"), &["onActivate"]), &[]);

    let timeouts = HookTimeouts {
        activate_ms: 10_000,
        ..HookTimeouts::default()
    };
    let config = ProjectConfig::new("alpha")
        .in_memory()
        .with_plugin("patient", PluginSettings::default().with_timeouts(timeouts));
    let registry = Arc::new(harness.registry());
    let creating = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.create(config, ACTOR).await })
    };
    started.notified().await;

    let began = std::time::Instant::now();
    registry.close("alpha", ACTOR).await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(2), "close waited for the hook budget");
    creating.await.unwrap().unwrap();

    let history = harness.history("alpha");
    assert!(history.iter().any(|r| {
        r.action == AuditAction::Deactivated
            && r.plugin_id.as_deref() == Some("patient")
            && r.error_tag.as_deref() == Some("Cancelled")
    }));
    assert!(!history.iter().any(|r| r.error_tag.as_deref() == Some("HookTimeout")));
}

struct Watchful {
    live_in_hook: Arc<AtomicBool>,
    token: Arc<Mutex<Option<tokio_util::sync::CancellationToken>>>,
}

#[async_trait]
impl PluginHooks for Watchful {
    async fn on_deactivate(&self, ctx: &PluginContext, _reason: DeactivationReason) -> Result<(), PluginError> {
        let token = ctx.cancellation();
        self.live_in_hook.store(!token.is_cancelled(), Ordering::SeqCst);
        *self.token.lock().unwrap() = Some(token);
        Ok(())
    }
}

#[tokio::test]
async fn context_is_cancelled_after_on_deactivate() {
    let live_in_hook = Arc::new(AtomicBool::new(false));
    let token = Arc::new(Mutex::new(None));
    let (live, seen) = (live_in_hook.clone(), token.clone());
    let harness = Harness::new(PluginCatalog::new().with(info_module("watchful").hooks(move || Watchful {
        live_in_hook: live.clone(),
        token: seen.clone(),
    })));
    harness.write_bundle(with_hooks(manifest("watchful", "1.0.0"), &["onDeactivate"]), &[]);

    let registry = harness.registry();
    registry.create(project(&["watchful"]), ACTOR).await.unwrap();
    let entry = registry.require("alpha").await.unwrap();
    entry.lock().await.disable("watchful", ACTOR).await.unwrap();

    assert!(live_in_hook.load(Ordering::SeqCst));
    assert!(token.lock().unwrap().as_ref().unwrap().is_cancelled());
}
