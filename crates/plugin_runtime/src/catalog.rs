//! Plugin code linked into the host.
//!
//! A bundle on disk carries the manifest and migrations; the code it names
//! lives in a [`PluginModule`] registered in the [`PluginCatalog`] under the
//! same id. Handler references in the manifest are resolved against the
//! module when the plugin loads.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::PluginError;
use crate::lifecycle::PluginContext;
use crate::request::{PluginRequest, PluginResponse};

pub type HandlerFuture = BoxFuture<'static, Result<PluginResponse, PluginError>>;

/// A resolved route handler.
pub type RouteHandler = Arc<dyn Fn(PluginRequest) -> HandlerFuture + Send + Sync>;

/// Why `on_deactivate` is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeactivationReason {
    Disabled,
    Reload,
    ProjectClosing,
    /// Activation failed after `on_activate` may have started work.
    AbortedActivation,
}

impl DeactivationReason {
    pub fn aborted_activation(self) -> bool {
        self == Self::AbortedActivation
    }
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Reload => "reload",
            Self::ProjectClosing => "projectClosing",
            Self::AbortedActivation => "abortedActivation",
        };
        f.write_str(s)
    }
}

/// Lifecycle callbacks. Only hooks the manifest declares are invoked.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn on_load(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_activate(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_deactivate(
        &self,
        _ctx: &PluginContext,
        _reason: DeactivationReason,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_unload(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Hooks for plugins that only serve routes.
pub struct NoHooks;

impl PluginHooks for NoHooks {}

pub trait PluginModule: Send + Sync {
    fn id(&self) -> &str;

    /// Creates a fresh hooks object for one instance.
    fn instantiate(&self) -> Arc<dyn PluginHooks>;

    fn handler(&self, name: &str) -> Option<RouteHandler>;
}

type HooksFactory = Arc<dyn Fn() -> Arc<dyn PluginHooks> + Send + Sync>;

/// A module assembled from closures.
pub struct StaticModule {
    id: String,
    handlers: HashMap<String, RouteHandler>,
    hooks: HooksFactory,
}

impl StaticModule {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handlers: HashMap::new(),
            hooks: Arc::new(|| Arc::new(NoHooks) as Arc<dyn PluginHooks>),
        }
    }

    pub fn handler<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(PluginRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PluginResponse, PluginError>> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |req: PluginRequest| -> HandlerFuture { Box::pin(f(req)) });
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn hooks<H, F>(mut self, factory: F) -> Self
    where
        H: PluginHooks + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.hooks = Arc::new(move || Arc::new(factory()) as Arc<dyn PluginHooks>);
        self
    }
}

impl PluginModule for StaticModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn instantiate(&self) -> Arc<dyn PluginHooks> {
        (self.hooks)()
    }

    fn handler(&self, name: &str) -> Option<RouteHandler> {
        self.handlers.get(name).cloned()
    }
}

/// Every plugin module the host links, by id.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    modules: HashMap<String, Arc<dyn PluginModule>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: impl PluginModule + 'static) -> &mut Self {
        self.modules.insert(module.id().to_string(), Arc::new(module));
        self
    }

    pub fn with(mut self, module: impl PluginModule + 'static) -> Self {
        self.register(module);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn PluginModule>> {
        self.modules.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.modules.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog").field("modules", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_module_exposes_handlers_by_name() {
        let catalog = PluginCatalog::new().with(
            StaticModule::new("economy")
                .handler("ping", |_req| async { Ok(PluginResponse::ok(json!("pong"))) }),
        );
        let module = catalog.get("economy").unwrap();
        assert!(module.handler("ping").is_some());
        assert!(module.handler("pong").is_none());
        assert!(catalog.get("missing").is_none());
        assert_eq!(catalog.ids(), vec!["economy"]);
    }

    #[test]
    fn reason_flags_aborted_activation() {
        assert!(DeactivationReason::AbortedActivation.aborted_activation());
        assert!(!DeactivationReason::Disabled.aborted_activation());
    }
}
