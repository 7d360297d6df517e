#![allow(dead_code)]

use std::path::PathBuf;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use game_host::{Host, HostConfig};
use plugin_runtime::{PluginCatalog, PluginResponse, PluginRoot, ProjectConfig, RootKind, StaticModule};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

pub const ADMIN_TOKEN: &str = "admin-secret";
pub const USER_TOKEN: &str = "player-secret";

/// A host over a scratch data dir and plugin root.
pub struct TestHost {
    pub dir: TempDir,
    pub plugin_root: PathBuf,
    pub host: Host,
    pub app: Router,
}

pub fn config(dir: &TempDir, projects: Vec<ProjectConfig>) -> HostConfig {
    let mut config = HostConfig::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.storage.data_dir = dir.path().join("data");
    config.plugins.roots = vec![PluginRoot::new(RootKind::Bundled, dir.path().join("plugins"))];
    config.auth.admin_tokens = vec![ADMIN_TOKEN.to_string()];
    config.auth.user_tokens = vec![USER_TOKEN.to_string()];
    config.projects = projects;
    config
}

impl TestHost {
    /// Writes bundles first with [`write_bundle`] on a fresh dir, then call
    /// this. Seed projects are opened before it returns.
    pub async fn start(dir: TempDir, config: HostConfig, catalog: PluginCatalog) -> Self {
        let plugin_root = dir.path().join("plugins");
        let host = Host::build(config, catalog).await.unwrap();
        host.start().await.unwrap();
        let app = host.router();
        Self {
            dir,
            plugin_root,
            host,
            app,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        send(&self.app, request).await
    }

    pub async fn admin_get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(admin(Request::get(uri)).body(Body::empty()).unwrap()).await
    }

    pub async fn admin_post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(json_request(admin(Request::post(uri)), body)).await
    }

    pub async fn admin_put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(json_request(admin(Request::put(uri)), body)).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub fn write_bundle(&self, manifest: Value, files: &[(&str, &str)]) {
        write_bundle(&self.plugin_root, manifest, files);
    }
}

pub fn admin(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {ADMIN_TOKEN}"))
}

pub fn json_request(builder: axum::http::request::Builder, body: Value) -> Request<Body> {
    builder
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

/// Writes `<root>/<id>/plugin.json` plus the given files.
pub fn write_bundle(root: &std::path::Path, manifest: Value, files: &[(&str, &str)]) {
    let id = manifest["id"].as_str().unwrap().to_string();
    let bundle = root.join(id);
    std::fs::create_dir_all(bundle.join("migrations")).unwrap();
    std::fs::write(bundle.join("plugin.json"), serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    for (name, body) in files {
        std::fs::write(bundle.join(name), body).unwrap();
    }
}

/// Manifest with `GET /info` served by handler `info`.
pub fn manifest(id: &str, version: &str) -> Value {
    json!({
        "id": id,
        "version": version,
        "routes": [{ "method": "GET", "path": "/info", "handler": "info" }]
    })
}

pub fn info_module(id: &str) -> StaticModule {
    StaticModule::new(id).handler("info", |req| async move {
        Ok(PluginResponse::ok(json!({ "plugin": req.plugin_id, "project": req.project_id })))
    })
}

/// Migration entries and files for versions `1..=count` creating `t_<prefix>_<n>`.
pub fn migrations(prefix: &str, count: u32) -> (Value, Vec<(String, String)>) {
    let entries = (1..=count)
        .map(|v| json!({ "version": v, "name": format!("t_{prefix}_{v}"), "up": format!("migrations/{v:03}.sql") }))
        .collect();
    let files = (1..=count)
        .map(|v| {
            (
                format!("migrations/{v:03}.sql"),
                format!("CREATE TABLE t_{prefix}_{v} (id INTEGER PRIMARY KEY);"),
            )
        })
        .collect();
    (Value::Array(entries), files)
}

pub fn file_refs(files: &[(String, String)]) -> Vec<(&str, &str)> {
    files.iter().map(|(n, b)| (n.as_str(), b.as_str())).collect()
}

pub fn project(id: &str, plugins: &[&str]) -> ProjectConfig {
    plugins.iter().fold(ProjectConfig::new(id), |config, plugin| {
        config.with_plugin(*plugin, Default::default())
    })
}
