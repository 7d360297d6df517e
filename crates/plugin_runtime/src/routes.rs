//! Route Mount Controller.
//!
//! Each project owns a sub-router: a copy-on-write [`RouteTable`] published
//! through an [`ArcSwap`]. Writers (mount, unmount, swap) serialize on a
//! per-project lock, build a new table and publish it in one store. Dispatch
//! loads the current table once per request, so a request in flight keeps
//! the route group it started with even if a swap happens underneath it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::capabilities::{run_chain, Middleware, ProjectCapabilities};
use crate::catalog::RouteHandler;
use crate::error::{Result, RuntimeError};
use crate::manifest::{validate_route_path, HttpMethod, RouteDescriptor};
use crate::request::{IncomingRequest, PluginRequest, PluginResponse};
use crate::storage::StorageHandle;

/// Live, swappable plugin configuration shared with handlers.
pub type ConfigCell = Arc<ArcSwap<Value>>;

pub fn project_prefix(project_id: &str, plugin_id: &str) -> String {
    format!("/project/{project_id}/plugin/{plugin_id}")
}

pub fn admin_prefix(plugin_id: &str) -> String {
    format!("/admin/api/plugins/{plugin_id}")
}

/// Which namespace a request addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Project,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Rest(String),
}

/// A compiled route path supporting `:param` and a trailing `*rest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(path: &str) -> std::result::Result<Self, String> {
        validate_route_path(path)?;
        let segments = split(path)
            .map(|segment| {
                if let Some(name) = segment.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else if let Some(name) = segment.strip_prefix('*') {
                    Segment::Rest(name.to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();
        Ok(Self { segments })
    }

    /// Places the pattern under the literal segments of `prefix`.
    fn nested(mut self, prefix: &str) -> Self {
        let mut segments: Vec<Segment> = split(prefix).map(|s| Segment::Literal(s.to_string())).collect();
        segments.append(&mut self.segments);
        self.segments = segments;
        self
    }

    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split(path).collect();
        let mut params = HashMap::new();
        for (idx, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Literal(expected) => {
                    if parts.get(idx) != Some(&expected.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(idx).filter(|v| !v.is_empty())?;
                    params.insert(name.clone(), (*value).to_string());
                }
                Segment::Rest(name) => {
                    params.insert(name.clone(), parts.get(idx..).unwrap_or_default().join("/"));
                    return Some(params);
                }
            }
        }
        (parts.len() == self.segments.len()).then_some(params)
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty())
}

fn join_path(prefix: &str, path: &str) -> String {
    if path.trim_matches('/').is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}{}", path.trim_end_matches('/'))
    }
}

/// Where a declared route lives once mounted.
///
/// Project routes land under the plugin's own prefix, except paths already
/// written in the namespaced `/plugin/{id}/...` form, which are placed
/// directly under the project. Admin routes always use the admin prefix.
fn mount_prefix(project_id: &str, plugin_id: &str, descriptor: &RouteDescriptor) -> String {
    if descriptor.admin {
        admin_prefix(plugin_id)
    } else if is_namespaced(&descriptor.path) {
        format!("/project/{project_id}")
    } else {
        project_prefix(project_id, plugin_id)
    }
}

fn is_namespaced(path: &str) -> bool {
    let mut segments = split(path);
    segments.next() == Some("plugin") && segments.next().is_some()
}

/// A route paired with its handler, produced when a plugin loads.
#[derive(Clone)]
pub struct ResolvedRoute {
    pub descriptor: RouteDescriptor,
    pub handler: RouteHandler,
}

/// What handlers of a group are bound to.
#[derive(Clone)]
pub struct RouteBinding {
    pub storage: StorageHandle,
    pub config: ConfigCell,
}

/// Public description of one mounted route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountedRouteInfo {
    pub method: HttpMethod,
    pub path: String,
    pub full_path: String,
    pub admin: bool,
    pub middleware: Vec<String>,
}

struct MountedRoute {
    info: MountedRouteInfo,
    pattern: PathPattern,
    chain: Vec<Arc<dyn Middleware>>,
    handler: RouteHandler,
}

/// All routes of one plugin, mounted and unmounted as a unit.
pub struct RouteGroup {
    plugin_id: String,
    generation: u64,
    routes: Vec<MountedRoute>,
    binding: RouteBinding,
}

impl RouteGroup {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn routes(&self) -> Vec<MountedRouteInfo> {
        self.routes.iter().map(|r| r.info.clone()).collect()
    }
}

/// One immutable snapshot of a project's routes.
#[derive(Clone, Default)]
pub struct RouteTable {
    groups: BTreeMap<String, Arc<RouteGroup>>,
}

impl RouteTable {
    pub fn group(&self, plugin_id: &str) -> Option<&Arc<RouteGroup>> {
        self.groups.get(plugin_id)
    }

    pub fn plugins(&self) -> BTreeSet<String> {
        self.groups.keys().cloned().collect()
    }

    /// Canonical listing of every mounted route, used to compare tables.
    pub fn fingerprint(&self) -> Vec<String> {
        self.groups
            .values()
            .flat_map(|group| {
                group.routes.iter().map(move |r| {
                    format!(
                        "{} {} {} [{}]",
                        group.plugin_id,
                        r.info.method,
                        r.info.full_path,
                        r.info.middleware.join(",")
                    )
                })
            })
            .collect()
    }

    fn find_conflict(&self, plugin_id: &str, candidate: &MountedRouteInfo) -> Option<&str> {
        self.groups
            .values()
            .filter(|group| group.plugin_id != plugin_id)
            .find(|group| group.routes.iter().any(|r| conflicts(&r.info, candidate)))
            .map(|group| group.plugin_id.as_str())
    }
}

/// Routes conflict when they mount the same method on the same full path.
fn conflicts(a: &MountedRouteInfo, b: &MountedRouteInfo) -> bool {
    a.method == b.method && a.full_path == b.full_path
}

/// A project's sub-router.
pub struct ProjectRoutes {
    project_id: String,
    table: ArcSwap<RouteTable>,
    write: Mutex<()>,
}

impl ProjectRoutes {
    fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            table: ArcSwap::from_pointee(RouteTable::default()),
            write: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    fn update<T>(&self, f: impl FnOnce(&mut RouteTable) -> Result<T>) -> Result<T> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = RouteTable::clone(&self.table.load());
        let out = f(&mut next)?;
        self.table.store(Arc::new(next));
        Ok(out)
    }
}

/// Mounts and dispatches plugin routes for every project.
#[derive(Default)]
pub struct RouteMountController {
    projects: DashMap<String, Arc<ProjectRoutes>>,
    generation: AtomicU64,
}

impl RouteMountController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an empty sub-router for `project_id` if none exists.
    pub fn attach_project(&self, project_id: &str) -> Arc<ProjectRoutes> {
        self.projects
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(ProjectRoutes::new(project_id)))
            .clone()
    }

    /// Removes the project's sub-router. Later requests get 404.
    pub fn detach_project(&self, project_id: &str) -> bool {
        let removed = self.projects.remove(project_id).is_some();
        if removed {
            debug!(project = project_id, "detached project routes");
        }
        removed
    }

    pub fn project(&self, project_id: &str) -> Option<Arc<ProjectRoutes>> {
        self.projects.get(project_id).map(|r| r.clone())
    }

    pub fn mounted_plugins(&self, project_id: &str) -> BTreeSet<String> {
        self.project(project_id)
            .map(|p| p.snapshot().plugins())
            .unwrap_or_default()
    }

    pub fn fingerprint(&self, project_id: &str) -> Vec<String> {
        self.project(project_id)
            .map(|p| p.snapshot().fingerprint())
            .unwrap_or_default()
    }

    fn build_group(
        &self,
        project_id: &str,
        plugin_id: &str,
        routes: &[ResolvedRoute],
        capabilities: &ProjectCapabilities,
        binding: RouteBinding,
    ) -> Result<RouteGroup> {
        let mut mounted: Vec<MountedRoute> = Vec::with_capacity(routes.len());
        for route in routes {
            let descriptor = &route.descriptor;
            let prefix = mount_prefix(project_id, plugin_id, descriptor);
            let pattern = PathPattern::parse(&descriptor.path)
                .map_err(|reason| {
                    RuntimeError::invalid_input(format!(
                        "route {} {} of `{plugin_id}`: {reason}",
                        descriptor.method, descriptor.path
                    ))
                })?
                .nested(&prefix);
            let chain = descriptor
                .middleware
                .iter()
                .map(|tag| capabilities.resolve(plugin_id, tag))
                .collect::<Result<Vec<_>>>()?;

            let info = MountedRouteInfo {
                method: descriptor.method,
                path: descriptor.path.clone(),
                full_path: join_path(&prefix, &descriptor.path),
                admin: descriptor.admin,
                middleware: descriptor.middleware.clone(),
            };
            if mounted.iter().any(|m| conflicts(&m.info, &info)) {
                return Err(RuntimeError::RouteConflict {
                    plugin: plugin_id.to_string(),
                    method: info.method.to_string(),
                    path: info.full_path,
                    owner: plugin_id.to_string(),
                });
            }
            mounted.push(MountedRoute {
                info,
                pattern,
                chain,
                handler: route.handler.clone(),
            });
        }

        Ok(RouteGroup {
            plugin_id: plugin_id.to_string(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            routes: mounted,
            binding,
        })
    }

    fn check_conflicts(table: &RouteTable, group: &RouteGroup) -> Result<()> {
        for route in &group.routes {
            if let Some(owner) = table.find_conflict(&group.plugin_id, &route.info) {
                return Err(RuntimeError::RouteConflict {
                    plugin: group.plugin_id.clone(),
                    method: route.info.method.to_string(),
                    path: route.info.full_path.clone(),
                    owner: owner.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Mounts a plugin's routes. Nothing is published if any route fails.
    pub fn mount(
        &self,
        project_id: &str,
        plugin_id: &str,
        routes: &[ResolvedRoute],
        capabilities: &ProjectCapabilities,
        binding: RouteBinding,
    ) -> Result<Vec<MountedRouteInfo>> {
        let project = self
            .project(project_id)
            .ok_or_else(|| RuntimeError::not_found("project router", project_id))?;
        let group = self.build_group(project_id, plugin_id, routes, capabilities, binding)?;
        let info = group.routes();

        project.update(|table| {
            if table.groups.contains_key(plugin_id) {
                return Err(RuntimeError::conflict("route group", plugin_id));
            }
            Self::check_conflicts(table, &group)?;
            table.groups.insert(plugin_id.to_string(), Arc::new(group));
            Ok(())
        })?;

        info!(project = project_id, plugin = plugin_id, routes = info.len(), "mounted routes");
        Ok(info)
    }

    /// Removes a plugin's routes, returning them in reverse mount order.
    pub fn unmount(&self, project_id: &str, plugin_id: &str) -> Vec<MountedRouteInfo> {
        let Some(project) = self.project(project_id) else {
            return Vec::new();
        };
        let removed = project
            .update(|table| Ok(table.groups.remove(plugin_id)))
            .ok()
            .flatten();
        match removed {
            Some(group) => {
                let mut routes = group.routes();
                routes.reverse();
                info!(project = project_id, plugin = plugin_id, routes = routes.len(), "unmounted routes");
                routes
            }
            None => Vec::new(),
        }
    }

    /// Atomically replaces a plugin's route group.
    ///
    /// The new group is built and checked before anything is published; on
    /// error the previous group stays mounted.
    pub fn swap(
        &self,
        project_id: &str,
        plugin_id: &str,
        routes: &[ResolvedRoute],
        capabilities: &ProjectCapabilities,
        binding: RouteBinding,
    ) -> Result<Vec<MountedRouteInfo>> {
        let project = self
            .project(project_id)
            .ok_or_else(|| RuntimeError::not_found("project router", project_id))?;
        let group = self.build_group(project_id, plugin_id, routes, capabilities, binding)?;
        let info = group.routes();
        let generation = group.generation;

        project.update(|table| {
            Self::check_conflicts(table, &group)?;
            table.groups.insert(plugin_id.to_string(), Arc::new(group));
            Ok(())
        })?;

        info!(project = project_id, plugin = plugin_id, generation, "swapped route group");
        Ok(info)
    }

    /// Routes a request to the matching plugin handler.
    ///
    /// `incoming.path` is relative to the addressed plugin's prefix. Matching
    /// runs on the full mounted path, trying the addressed plugin's group
    /// before groups that claimed paths in its namespace. Always produces a
    /// response; middleware rejections, handler errors and handler panics
    /// become JSON error bodies.
    pub async fn dispatch(
        &self,
        scope: RouteScope,
        project_id: &str,
        plugin_id: &str,
        incoming: IncomingRequest,
    ) -> PluginResponse {
        let Some(project) = self.project(project_id) else {
            return PluginResponse::error(404, "NotFound", format!("unknown project `{project_id}`"));
        };
        let admin = scope == RouteScope::Admin;
        let prefix = if admin {
            admin_prefix(plugin_id)
        } else {
            project_prefix(project_id, plugin_id)
        };
        let requested = join_path(&prefix, &incoming.path);

        let table = project.snapshot();
        let addressed = table.group(plugin_id);
        let others = table.groups.values().filter(|group| group.plugin_id != plugin_id);
        let mut method_mismatch = false;
        let mut matched = None;
        'search: for group in addressed.into_iter().chain(others) {
            for (idx, route) in group.routes.iter().enumerate() {
                if route.info.admin != admin {
                    continue;
                }
                if let Some(params) = route.pattern.matches(&requested) {
                    if route.info.method == incoming.method {
                        matched = Some((group.clone(), idx, params));
                        break 'search;
                    }
                    method_mismatch = true;
                }
            }
        }
        let known = addressed.is_some();
        drop(table);

        let Some((group, idx, params)) = matched else {
            return if method_mismatch {
                PluginResponse::error(405, "MethodNotAllowed", "method not allowed")
            } else if known {
                PluginResponse::error(404, "NotFound", "no matching route")
            } else {
                PluginResponse::error(404, "NotFound", format!("no routes for plugin `{plugin_id}`"))
            };
        };
        let route = &group.routes[idx];

        let mut meta = incoming.meta;
        if let Err(rejection) = run_chain(&route.chain, &mut meta).await {
            return PluginResponse::error(rejection.status, rejection.error, rejection.message);
        }

        let request = PluginRequest {
            project_id: project.project_id.clone(),
            plugin_id: group.plugin_id.clone(),
            method: incoming.method,
            path: incoming.path,
            params,
            query: incoming.query,
            body: incoming.body,
            meta,
            storage: group.binding.storage.clone(),
            config: group.binding.config.load_full(),
        };

        match AssertUnwindSafe((route.handler)(request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) if err.status_code() >= 500 => {
                warn!(project = project_id, plugin = plugin_id, path = %route.info.full_path, error = %err, "⚠️ Handler failed");
                PluginResponse::error(err.status_code(), err.tag(), "plugin handler failed")
            }
            Ok(Err(err)) => {
                debug!(project = project_id, plugin = plugin_id, error = %err, "handler returned error");
                PluginResponse::error(err.status_code(), err.tag(), err.to_string())
            }
            Err(_) => {
                error!(project = project_id, plugin = plugin_id, path = %route.info.full_path, "handler panicked");
                PluginResponse::error(500, "HandlerPanicked", "plugin handler failed")
            }
        }
    }
}
