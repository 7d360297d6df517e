mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{
    config, file_refs, info_module, manifest, migrations, project, send, write_bundle, TestHost,
};
use plugin_runtime::{PluginCatalog, PluginResponse};
use serde_json::{json, Value};
use tokio::sync::Notify;

fn actions(records: &Value) -> Vec<String> {
    records
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["action"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn happy_startup() {
    let catalog = PluginCatalog::new()
        .with(info_module("economy"))
        .with(info_module("achievements"));
    let seeds = vec![
        project("alpha", &["economy", "achievements"]),
        project("beta", &["economy", "achievements"]),
    ];
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    write_bundle(&root, manifest("economy", "1.0.0"), &[]);
    write_bundle(&root, manifest("achievements", "1.0.0"), &[]);
    let cfg = config(&dir, seeds);
    let host = TestHost::start(dir, cfg, catalog).await;

    let (status, projects) = host.admin_get("/admin/api/projects").await;
    assert_eq!(status, StatusCode::OK);
    let states: Vec<(&str, &str)> = projects
        .as_array()
        .unwrap()
        .iter()
        .map(|p| (p["id"].as_str().unwrap(), p["state"].as_str().unwrap()))
        .collect();
    assert_eq!(states, vec![("alpha", "ready"), ("beta", "ready")]);

    let mut activated = 0;
    for id in ["alpha", "beta"] {
        let (_, records) = host
            .admin_get(&format!("/admin/api/audit?project={id}&action=activated"))
            .await;
        activated += records.as_array().unwrap().len();
    }
    assert_eq!(activated, 4);

    let (status, plugins) = host.admin_get("/admin/api/plugins?project=alpha").await;
    assert_eq!(status, StatusCode::OK);
    let mut active: Vec<&str> = plugins
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["state"] == "active")
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    active.sort();
    assert_eq!(active, vec!["achievements", "economy"]);

    let (status, body) = host.get("/project/beta/plugin/economy/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "plugin": "economy", "project": "beta" }));

    let (status, health) = host.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["projects"], 2);
}

#[tokio::test]
async fn dependency_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    let mut a = manifest("a", "1.0.0");
    a["dependencies"] = json!([{ "id": "b" }]);
    let mut b = manifest("b", "1.0.0");
    b["dependencies"] = json!([{ "id": "a" }]);
    write_bundle(&root, a, &[]);
    write_bundle(&root, b, &[]);
    let cfg = config(&dir, vec![]);
    let host = TestHost::start(dir, cfg, PluginCatalog::new().with(info_module("a")).with(info_module("b"))).await;

    let (status, created) = host
        .admin_post("/admin/api/projects", json!({ "id": "alpha", "plugins": { "a": {}, "b": {} } }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["project"]["state"], "degraded");
    assert!(created["auditId"].is_i64());

    assert_eq!(host.get("/project/alpha/plugin/a/info").await.0, StatusCode::NOT_FOUND);
    assert_eq!(host.get("/project/alpha/plugin/b/info").await.0, StatusCode::NOT_FOUND);

    let (_, failed) = host.admin_get("/admin/api/audit?project=alpha&action=failed").await;
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 2);
    for record in failed {
        assert_eq!(record["errorTag"], "DependencyCycle");
        assert_eq!(record["details"]["members"], json!(["a", "b"]));
    }
}

#[tokio::test]
async fn hot_reload_with_schema_bump() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    let (entries, files) = migrations("eco", 1);
    let mut v1 = manifest("economy", "1.0.0");
    v1["migrations"] = entries;
    write_bundle(&root, v1, &file_refs(&files));
    let module = info_module("economy").handler("stats", |_req| async move {
        Ok(PluginResponse::ok(json!({ "wallets": 0 })))
    });
    let cfg = config(&dir, vec![project("alpha", &["economy"])]);
    let host = TestHost::start(dir, cfg, PluginCatalog::new().with(module)).await;

    assert_eq!(host.get("/project/alpha/plugin/economy/info").await.0, StatusCode::OK);
    assert_eq!(host.get("/project/alpha/plugin/economy/stats").await.0, StatusCode::NOT_FOUND);

    let (entries, files) = migrations("eco", 2);
    let mut v2 = manifest("economy", "1.1.0");
    v2["migrations"] = entries;
    v2["routes"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "method": "GET", "path": "/stats", "handler": "stats" }));
    host.write_bundle(v2, &file_refs(&files));

    let (status, outcome) = host.admin_post("/admin/api/plugins/economy/reload", Value::Null).await;
    assert_eq!(status, StatusCode::OK, "{outcome}");
    assert_eq!(outcome["state"], "active");
    assert_eq!(outcome["plugin"]["version"], "1.1.0");

    assert_eq!(host.get("/project/alpha/plugin/economy/info").await.0, StatusCode::OK);
    assert_eq!(host.get("/project/alpha/plugin/economy/stats").await.0, StatusCode::OK);

    let (_, records) = host.admin_get("/admin/api/audit?project=alpha&plugin=economy").await;
    let records = records.as_array().unwrap();
    // Newest first.
    let reloaded = records.iter().position(|r| r["action"] == "reloaded").unwrap();
    let migrated = records
        .iter()
        .position(|r| r["action"] == "migration-applied" && r["details"]["version"] == 2)
        .unwrap();
    assert!(reloaded < migrated);
    assert_eq!(outcome["auditId"], records[0]["id"]);
}

#[tokio::test]
async fn downgrade_refused() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    let (entries, files) = migrations("eco", 5);
    let mut v1 = manifest("economy", "1.0.0");
    v1["migrations"] = entries;
    write_bundle(&root, v1, &file_refs(&files));
    let cfg = config(&dir, vec![project("alpha", &["economy"])]);
    let host = TestHost::start(dir, cfg, PluginCatalog::new().with(info_module("economy"))).await;

    let (entries, _) = migrations("eco", 3);
    let mut shrunk = manifest("economy", "1.2.0");
    shrunk["migrations"] = entries;
    host.write_bundle(shrunk, &[]);

    let (status, error) = host
        .admin_post("/admin/api/plugins/economy/reload?project=alpha", Value::Null)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"], "DowngradeRefused");
    let audit_id = error["auditId"].as_i64().unwrap();

    let (_, records) = host.admin_get("/admin/api/audit?project=alpha&limit=1").await;
    assert_eq!(records[0]["id"], audit_id);
    assert_eq!(records[0]["errorTag"], "DowngradeRefused");

    let (status, plugin) = host.admin_get("/admin/api/plugins/economy?project=alpha").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plugin["state"], "active");
    assert_eq!(plugin["version"], "1.0.0");
    assert_eq!(host.get("/project/alpha/plugin/economy/info").await.0, StatusCode::OK);
}

#[tokio::test]
async fn route_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    for id in ["x", "y"] {
        write_bundle(
            &root,
            json!({
                "id": id,
                "version": "1.0.0",
                "routes": [{ "method": "GET", "path": "/plugin/x/info", "handler": "info" }]
            }),
            &[],
        );
    }
    let cfg = config(&dir, vec![project("alpha", &["x"])]);
    let host = TestHost::start(dir, cfg, PluginCatalog::new().with(info_module("x")).with(info_module("y"))).await;

    let (status, error) = host.admin_post("/admin/api/plugins/y/enable?project=alpha", Value::Null).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"], "RouteConflict");
    assert!(error["auditId"].is_i64());

    let (_, plugin) = host.admin_get("/admin/api/plugins/y?project=alpha").await;
    assert_eq!(plugin["state"], "failed");
    let (_, plugin) = host.admin_get("/admin/api/plugins/x?project=alpha").await;
    assert_eq!(plugin["state"], "active");
    assert_eq!(host.get("/project/alpha/plugin/x/info").await.0, StatusCode::OK);

    let (_, project) = host.admin_get("/admin/api/projects/alpha").await;
    assert_eq!(project["state"], "ready");

    // Required plugins that cannot mount degrade the project.
    let (status, created) = host
        .admin_post(
            "/admin/api/projects",
            json!({ "id": "beta", "plugins": { "x": { "required": true }, "y": { "required": true } } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["project"]["state"], "degraded");
}

#[tokio::test]
async fn deactivation_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    let mut economy = manifest("economy", "1.0.0");
    economy["routes"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "method": "POST", "path": "/slow", "handler": "slow" }));
    write_bundle(&root, economy, &[]);

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let module = {
        let started = started.clone();
        let release = release.clone();
        info_module("economy").handler("slow", move |_req| {
            let started = started.clone();
            let release = release.clone();
            async move {
                started.notify_one();
                release.notified().await;
                Ok(PluginResponse::ok(json!({ "done": true })))
            }
        })
    };
    let cfg = config(&dir, vec![project("alpha", &["economy"])]);
    let host = TestHost::start(dir, cfg, PluginCatalog::new().with(module)).await;

    let app = host.app.clone();
    let in_flight = tokio::spawn(async move {
        send(
            &app,
            Request::post("/project/alpha/plugin/economy/slow")
                .body(Body::empty())
                .unwrap(),
        )
        .await
    });
    started.notified().await;

    let (status, outcome) = host.admin_post("/admin/api/plugins/economy/disable?project=alpha", Value::Null).await;
    assert_eq!(status, StatusCode::OK, "{outcome}");
    assert_eq!(outcome["state"], "deactivated");

    assert_eq!(host.get("/project/alpha/plugin/economy/info").await.0, StatusCode::NOT_FOUND);

    release.notify_one();
    let (status, body) = tokio::time::timeout(Duration::from_secs(5), in_flight)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["done"], true);

    let (_, records) = host.admin_get("/admin/api/audit?project=alpha&plugin=economy").await;
    let newest = actions(&records);
    let deactivated = newest.iter().position(|a| a == "deactivated").unwrap();
    let unmounted = newest.iter().position(|a| a == "route-unmounted").unwrap();
    assert!(deactivated < unmounted);
    assert!(records[deactivated]["details"]["released"].is_u64());
}
