mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{admin, config, info_module, json_request, manifest, project, write_bundle, TestHost, USER_TOKEN};
use game_host::HostConfig;
use plugin_runtime::{PluginCatalog, PluginResponse};
use serde_json::{json, Value};
use tempfile::TempDir;

fn economy_manifest() -> Value {
    json!({
        "id": "economy",
        "version": "1.0.0",
        "configSchema": {
            "type": "object",
            "properties": {
                "startingBalance": { "type": "integer", "minimum": 0, "default": 100 }
            },
            "additionalProperties": false
        },
        "routes": [
            { "method": "GET", "path": "/info", "handler": "info" },
            { "method": "GET", "path": "/balance", "handler": "balance", "middleware": ["auth"] },
            { "method": "GET", "path": "/stats", "handler": "info", "admin": true }
        ]
    })
}

fn catalog() -> PluginCatalog {
    PluginCatalog::new().with(info_module("economy").handler("balance", |req| async move {
        let starting = req.config["startingBalance"].clone();
        Ok(PluginResponse::ok(json!({ "balance": starting, "player": req.principal().map(|p| p.id.clone()) })))
    }))
}

async fn host_with(configure: impl FnOnce(&mut HostConfig)) -> TestHost {
    let dir = TempDir::new().unwrap();
    write_bundle(&dir.path().join("plugins"), economy_manifest(), &[]);
    let mut cfg = config(&dir, vec![project("alpha", &["economy"])]);
    configure(&mut cfg);
    TestHost::start(dir, cfg, catalog()).await
}

async fn host() -> TestHost {
    host_with(|_| {}).await
}

#[tokio::test]
async fn admin_routes_require_admin_credentials() {
    let host = host().await;

    let (status, body) = host.get("/admin/api/projects").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized");

    let request = Request::get("/admin/api/projects")
        .header("authorization", format!("Bearer {USER_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = host.send(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Forbidden");

    let (status, _) = host.admin_get("/admin/api/projects").await;
    assert_eq!(status, StatusCode::OK);

    // Health stays public.
    assert_eq!(host.get("/health").await.0, StatusCode::OK);
}

#[tokio::test]
async fn cli_bypass_only_outside_production() {
    let bypass = || {
        Request::get("/admin/api/projects")
            .header("x-cli-bypass", "1")
            .body(Body::empty())
            .unwrap()
    };

    let dev = host().await;
    assert_eq!(dev.send(bypass()).await.0, StatusCode::OK);

    let prod = host_with(|cfg| cfg.server.node_env = "production".to_string()).await;
    assert_eq!(prod.send(bypass()).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn plugin_routes_run_their_middleware() {
    let host = host().await;

    assert_eq!(
        host.get("/project/alpha/plugin/economy/balance").await.0,
        StatusCode::UNAUTHORIZED
    );
    let request = Request::get("/project/alpha/plugin/economy/balance")
        .header("authorization", format!("Bearer {USER_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = host.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 100);

    assert_eq!(host.get("/project/alpha/plugin/missing/info").await.0, StatusCode::NOT_FOUND);
    assert_eq!(host.get("/project/nope/plugin/economy/info").await.0, StatusCode::NOT_FOUND);
    assert_eq!(host.get("/somewhere/else").await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn plugin_admin_routes_sit_behind_admin_auth() {
    let host = host().await;

    assert_eq!(host.get("/admin/api/plugins/economy/stats").await.0, StatusCode::UNAUTHORIZED);
    let (status, body) = host.admin_get("/admin/api/plugins/economy/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project"], "alpha");

    // Project-scoped paths never reach admin routes.
    assert_eq!(
        host.get("/project/alpha/plugin/economy/stats").await.0,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn config_updates_validate_and_persist() {
    let host = host().await;

    let (status, current) = host.admin_get("/admin/api/plugins/economy/config?project=alpha").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current, json!({ "startingBalance": 100 }));

    let (status, error) = host
        .admin_put("/admin/api/plugins/economy/config", json!({ "startingBalance": -5 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "ConfigInvalid");
    assert!(error["auditId"].is_i64());
    assert!(!error["details"]["errors"].as_array().unwrap().is_empty());

    let (status, outcome) = host
        .admin_put("/admin/api/plugins/economy/config", json!({ "startingBalance": 250 }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["config"]["startingBalance"], 250);

    let request = Request::get("/project/alpha/plugin/economy/balance")
        .header("authorization", format!("Bearer {USER_TOKEN}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(host.send(request).await.1["balance"], 250);

    let (_, reloaded) = host.admin_post("/admin/api/projects/alpha/reload", Value::Null).await;
    assert_eq!(reloaded["project"]["state"], "ready");
    let (_, current) = host.admin_get("/admin/api/plugins/economy/config?project=alpha").await;
    assert_eq!(current["startingBalance"], 250);
}

#[tokio::test]
async fn toggle_and_unknown_ids() {
    let host = host().await;

    let (status, outcome) = host.admin_post("/admin/api/plugins/economy/toggle", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["state"], "deactivated");
    assert!(outcome["auditId"].is_i64());

    let (status, outcome) = host.admin_post("/admin/api/plugins/economy/toggle", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["state"], "active");

    let (status, error) = host.admin_post("/admin/api/plugins/economy/enable", Value::Null).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["auditId"].is_i64());

    let (status, error) = host.admin_post("/admin/api/plugins/ghost/enable", Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"], "NotFound");

    let (status, _) = host.admin_get("/admin/api/projects/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn project_create_list_and_delete() {
    let host = host().await;

    let (status, error) = host.admin_post("/admin/api/projects", json!({ "id": "alpha" })).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"], "Conflict");

    let (status, error) = host.admin_post("/admin/api/projects", json!({ "id": "Bad Id!" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["auditId"].is_null());

    let (status, created) = host
        .admin_post(
            "/admin/api/projects",
            json!({ "id": "beta", "displayName": "Beta", "plugins": { "economy": {} } }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["project"]["displayName"], "Beta");

    // With two projects open the target must be named.
    let (status, _) = host.admin_post("/admin/api/plugins/economy/toggle", Value::Null).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, plugins) = host.admin_get("/admin/api/plugins").await;
    assert_eq!(plugins.as_array().unwrap().len(), 2);
    let (_, matches) = host.admin_get("/admin/api/plugins/economy").await;
    assert_eq!(matches.as_array().unwrap().len(), 2);

    let request = admin(Request::delete("/admin/api/projects/beta?purge=true"))
        .body(Body::empty())
        .unwrap();
    let (status, deleted) = host.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["purged"], true);
    assert!(deleted["auditId"].is_i64());
    assert!(!host.dir.path().join("data/projects/beta.db").exists());

    assert_eq!(host.get("/project/beta/plugin/economy/info").await.0, StatusCode::NOT_FOUND);
    let (_, projects) = host.admin_get("/admin/api/projects").await;
    assert_eq!(projects.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn preferences_are_per_session() {
    let host = host().await;
    let put = |session: &str, key: &str, value: Value| {
        json_request(
            admin(Request::put(format!("/admin/api/preferences/{key}"))).header("x-admin-session", session),
            value,
        )
    };
    let list = |session: &str| {
        admin(Request::get("/admin/api/preferences"))
            .header("x-admin-session", session)
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(host.send(put("s1", "theme", json!("dark"))).await.0, StatusCode::OK);
    assert_eq!(host.send(put("s2", "theme", json!("light"))).await.0, StatusCode::OK);

    let (status, prefs) = host.send(list("s1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(prefs, json!({ "theme": "dark" }));

    let delete = admin(Request::delete("/admin/api/preferences/theme"))
        .header("x-admin-session", "s1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(host.send(delete).await.0, StatusCode::NO_CONTENT);
    assert_eq!(host.send(list("s1")).await.1, json!({}));
    assert_eq!(host.send(list("s2")).await.1, json!({ "theme": "light" }));

    let (status, _) = host.admin_get("/admin/api/preferences").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn seeds_are_created_once_across_restarts() {
    let dir = TempDir::new().unwrap();
    write_bundle(&dir.path().join("plugins"), manifest("economy", "1.0.0"), &[]);
    let cfg = config(&dir, vec![project("alpha", &["economy"]), project("beta", &[])]);

    let first = TestHost::start(dir, cfg.clone(), PluginCatalog::new().with(info_module("economy"))).await;
    let (status, _) = first.admin_get("/admin/api/projects/beta").await;
    assert_eq!(status, StatusCode::OK);
    first.host.shutdown().await;
    let TestHost { dir, .. } = first;

    let second = TestHost::start(dir, cfg, PluginCatalog::new().with(info_module("economy"))).await;
    let (_, projects) = second.admin_get("/admin/api/projects").await;
    assert_eq!(projects.as_array().unwrap().len(), 2);
    assert_eq!(second.get("/project/alpha/plugin/economy/info").await.0, StatusCode::OK);

    let (_, created) = second
        .admin_get("/admin/api/audit?project=alpha&action=project-created")
        .await;
    assert_eq!(created.as_array().unwrap().len(), 1);
}
