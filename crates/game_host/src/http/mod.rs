//! The host's HTTP surface.
//!
//! Core admin endpoints are ordinary axum routes behind the admin guard.
//! Everything under `/project/{p}/plugin/{id}/` and any unclaimed path under
//! `/admin/api/plugins/{id}/` falls through to the route mount controller,
//! which owns the per-project plugin route tables.

pub mod error;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use plugin_runtime::capabilities::{run_chain, ADMIN_AUTH, CLI_BYPASS};
use plugin_runtime::{
    AuditQuery, AuditRecord, HttpMethod, IncomingRequest, Middleware, Principal, PluginResponse, ProjectConfig,
    ProjectSnapshot, RequestMeta, RouteScope, HOST_VERSION,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::admin::{AdminService, CommandOutcome, PluginCommand, PluginListing, ProjectOutcome};
pub use error::ApiError;

/// Largest request body forwarded to plugin handlers.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const ADMIN_SESSION_HEADER: &str = "x-admin-session";

#[derive(Clone)]
pub struct AppState {
    admin: AdminService,
    admin_chain: Arc<[Arc<dyn Middleware>]>,
    started_at: Instant,
}

impl AppState {
    /// Admin requests pass `cliBypass` then `adminAuth`.
    pub fn new(admin: AdminService) -> Self {
        let capabilities = admin.registry().services().capabilities.clone();
        let admin_chain: Vec<Arc<dyn Middleware>> = [CLI_BYPASS, ADMIN_AUTH]
            .into_iter()
            .filter_map(|name| capabilities.get(name))
            .collect();
        Self {
            admin,
            admin_chain: admin_chain.into(),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/api/projects", get(list_projects).post(create_project))
        .route("/admin/api/projects/:id", get(get_project).delete(delete_project))
        .route("/admin/api/projects/:id/reload", post(reload_project))
        .route("/admin/api/plugins", get(list_plugins))
        .route("/admin/api/plugins/:id", get(get_plugin))
        .route("/admin/api/plugins/:id/enable", post(enable_plugin))
        .route("/admin/api/plugins/:id/disable", post(disable_plugin))
        .route("/admin/api/plugins/:id/toggle", post(toggle_plugin))
        .route("/admin/api/plugins/:id/reload", post(reload_plugin))
        .route("/admin/api/plugins/:id/config", get(get_config).put(update_config))
        .route("/admin/api/audit", get(audit_log))
        .route("/admin/api/preferences", get(list_preferences))
        .route("/admin/api/preferences/:key", put(set_preference).delete(delete_preference))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .merge(admin)
        .fallback(dispatch_plugin_route)
        .with_state(state)
}

// ============================================================================
// Request plumbing
// ============================================================================

fn request_meta(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> RequestMeta {
    RequestMeta {
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        client: connect.map(|ConnectInfo(addr)| addr.ip().to_string()),
        principal: None,
    }
}

async fn require_admin(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let mut meta = request_meta(request.headers(), request.extensions().get());
    if let Err(rejection) = run_chain(&state.admin_chain, &mut meta).await {
        return ApiError::from(rejection).into_response();
    }
    if let Some(principal) = meta.principal {
        request.extensions_mut().insert(principal);
    }
    next.run(request).await
}

#[derive(Debug, Default, Deserialize)]
struct ProjectQuery {
    project: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    purge: bool,
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Health
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": HOST_VERSION,
        "projects": state.admin.registry().open_count().await,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

// ============================================================================
// Projects
// ============================================================================

async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<ProjectSnapshot>>> {
    Ok(Json(state.admin.list_projects().await?))
}

async fn get_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ProjectSnapshot>> {
    Ok(Json(state.admin.get_project(&id).await?))
}

async fn create_project(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(config): Json<ProjectConfig>,
) -> ApiResult<(StatusCode, Json<ProjectOutcome>)> {
    let outcome = state.admin.create_project(config, &principal.id).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<Value>> {
    let audit_id = state.admin.delete_project(&id, query.purge, &principal.id).await?;
    Ok(Json(json!({ "projectId": id, "purged": query.purge, "auditId": audit_id })))
}

async fn reload_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<ProjectOutcome>> {
    Ok(Json(state.admin.reload_project(&id, &principal.id).await?))
}

// ============================================================================
// Plugins
// ============================================================================

async fn list_plugins(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Json<Vec<PluginListing>>> {
    Ok(Json(state.admin.list_plugins(query.project.as_deref()).await?))
}

async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Response> {
    let mut found = state.admin.get_plugin(query.project.as_deref(), &id).await?;
    if query.project.is_some() && found.len() == 1 {
        return Ok(Json(found.remove(0)).into_response());
    }
    Ok(Json(found).into_response())
}

async fn run_command(
    state: &AppState,
    id: &str,
    query: &ProjectQuery,
    principal: &Principal,
    command: PluginCommand,
) -> ApiResult<Json<CommandOutcome>> {
    let outcome = state
        .admin
        .plugin_command(query.project.as_deref(), id, command, &principal.id)
        .await?;
    Ok(Json(outcome))
}

async fn enable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<CommandOutcome>> {
    run_command(&state, &id, &query, &principal, PluginCommand::Enable).await
}

async fn disable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<CommandOutcome>> {
    run_command(&state, &id, &query, &principal, PluginCommand::Disable).await
}

async fn toggle_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<CommandOutcome>> {
    run_command(&state, &id, &query, &principal, PluginCommand::Toggle).await
}

async fn reload_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<CommandOutcome>> {
    run_command(&state, &id, &query, &principal, PluginCommand::Reload).await
}

async fn get_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.admin.get_config(query.project.as_deref(), &id).await?))
}

async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProjectQuery>,
    Extension(principal): Extension<Principal>,
    Json(config): Json<Value>,
) -> ApiResult<Json<CommandOutcome>> {
    let outcome = state
        .admin
        .update_config(query.project.as_deref(), &id, config, &principal.id)
        .await?;
    Ok(Json(outcome))
}

// ============================================================================
// Audit and preferences
// ============================================================================

async fn audit_log(State(state): State<AppState>, Query(query): Query<AuditQuery>) -> ApiResult<Json<Vec<AuditRecord>>> {
    Ok(Json(state.admin.audit_records(&query)?))
}

fn admin_session(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(ADMIN_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request(format!("header `{ADMIN_SESSION_HEADER}` is required")))
}

async fn list_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<BTreeMap<String, Value>>> {
    let session = admin_session(&headers)?;
    Ok(Json(state.admin.preferences().list(&session)?))
}

async fn set_preference(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(value): Json<Value>,
) -> ApiResult<Json<Value>> {
    let session = admin_session(&headers)?;
    state.admin.preferences().set(&session, &key, &value)?;
    Ok(Json(json!({ "key": key, "value": value })))
}

async fn delete_preference(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let session = admin_session(&headers)?;
    if state.admin.preferences().remove(&session, &key)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("preference `{key}` not set")))
    }
}

// ============================================================================
// Plugin route dispatch
// ============================================================================

/// A request path addressed to a plugin namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PluginPath {
    scope: RouteScope,
    project: Option<String>,
    plugin: String,
    rest: String,
}

impl PluginPath {
    fn parse(path: &str) -> Option<Self> {
        if let Some(tail) = path.strip_prefix("/project/") {
            let (project, tail) = tail.split_once('/')?;
            let (plugin, rest) = split_plugin(tail.strip_prefix("plugin/")?)?;
            (!project.is_empty()).then(|| Self {
                scope: RouteScope::Project,
                project: Some(project.to_string()),
                plugin,
                rest,
            })
        } else {
            let (plugin, rest) = split_plugin(path.strip_prefix("/admin/api/plugins/")?)?;
            Some(Self {
                scope: RouteScope::Admin,
                project: None,
                plugin,
                rest,
            })
        }
    }
}

fn split_plugin(tail: &str) -> Option<(String, String)> {
    let (plugin, rest) = match tail.find('/') {
        Some(idx) => (&tail[..idx], &tail[idx..]),
        None => (tail, "/"),
    };
    (!plugin.is_empty()).then(|| (plugin.to_string(), rest.to_string()))
}

async fn dispatch_plugin_route(State(state): State<AppState>, request: Request) -> Response {
    match forward(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward(state: &AppState, request: Request) -> ApiResult<Response> {
    let (parts, body) = request.into_parts();
    let target = PluginPath::parse(parts.uri.path())
        .ok_or_else(|| ApiError::not_found(format!("no route for `{}`", parts.uri.path())))?;
    let method = HttpMethod::parse(parts.method.as_str())
        .ok_or_else(|| ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "method not allowed"))?;
    let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map_err(|e| ApiError::bad_request(e.body_text()))?;
    let mut meta = request_meta(&parts.headers, parts.extensions.get());

    let project = match (target.scope, &target.project) {
        (RouteScope::Project, Some(project)) => project.clone(),
        _ => {
            run_chain(&state.admin_chain, &mut meta).await.map_err(ApiError::from)?;
            state
                .admin
                .resolve_project(query.get("project").map(String::as_str))
                .await?
        }
    };

    let body = read_json(body).await?;
    debug!(project = %project, plugin = %target.plugin, path = %target.rest, "dispatching plugin route");
    let incoming = IncomingRequest {
        method,
        path: target.rest,
        query,
        body,
        meta,
    };
    let response = state
        .admin
        .registry()
        .services()
        .routes
        .dispatch(target.scope, &project, &target.plugin, incoming)
        .await;
    Ok(plugin_response(response))
}

async fn read_json(body: Body) -> ApiResult<Value> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge", e.to_string()))?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

fn plugin_response(response: PluginResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status == StatusCode::NO_CONTENT {
        return status.into_response();
    }
    (status, Json(response.body)).into_response()
}
