//! Named middleware capabilities.
//!
//! Routes reference middleware by tag. The host registers implementations once
//! in a [`CapabilityRegistry`]; each project may alias tags to registered names
//! through [`ProjectCapabilities`]. Tags that resolve to nothing fail mounting
//! with `UnknownMiddleware`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::request::{Principal, RequestMeta, Role};

pub const AUTH: &str = "auth";
pub const ADMIN_AUTH: &str = "adminAuth";
pub const CLI_BYPASS: &str = "cliBypass";
pub const RATE_LIMIT: &str = "rateLimit";

pub const CLI_BYPASS_HEADER: &str = "x-cli-bypass";

/// Why middleware refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub status: u16,
    pub error: &'static str,
    pub message: String,
}

impl Rejection {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: 401,
            error: "Unauthorized",
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: 403,
            error: "Forbidden",
            message: message.into(),
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            status: 429,
            error: "RateLimited",
            message: "too many requests".to_string(),
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Inspects the caller; may attach a principal. `Err` stops the chain.
    async fn check(&self, meta: &mut RequestMeta) -> std::result::Result<(), Rejection>;
}

/// Runs a chain in order, stopping at the first rejection.
pub async fn run_chain(
    chain: &[Arc<dyn Middleware>],
    meta: &mut RequestMeta,
) -> std::result::Result<(), Rejection> {
    for middleware in chain {
        if let Err(rejection) = middleware.check(meta).await {
            debug!(middleware = middleware.name(), status = rejection.status, "request rejected");
            return Err(rejection);
        }
    }
    Ok(())
}

/// Bearer tokens the host accepts.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    admin: HashSet<String>,
    user: HashSet<String>,
}

impl TokenTable {
    pub fn new(
        admin: impl IntoIterator<Item = String>,
        user: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            admin: admin.into_iter().collect(),
            user: user.into_iter().collect(),
        }
    }

    pub fn lookup(&self, token: &str) -> Option<Principal> {
        let role = if self.admin.contains(token) {
            Role::Admin
        } else if self.user.contains(token) {
            Role::User
        } else {
            return None;
        };
        let fingerprint: String = token.chars().take(6).collect();
        Some(Principal::new(format!("token:{fingerprint}"), role))
    }
}

/// `auth`: any known bearer token.
pub struct BearerAuth {
    tokens: Arc<TokenTable>,
}

impl BearerAuth {
    pub fn new(tokens: Arc<TokenTable>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    fn name(&self) -> &str {
        AUTH
    }

    async fn check(&self, meta: &mut RequestMeta) -> std::result::Result<(), Rejection> {
        if meta.principal.is_some() {
            return Ok(());
        }
        let principal = meta
            .bearer_token()
            .and_then(|token| self.tokens.lookup(token))
            .ok_or_else(|| Rejection::unauthorized("missing or unknown bearer token"))?;
        meta.principal = Some(principal);
        Ok(())
    }
}

/// `adminAuth`: an admin token, or a principal already admitted as admin.
pub struct AdminAuth {
    tokens: Arc<TokenTable>,
}

impl AdminAuth {
    pub fn new(tokens: Arc<TokenTable>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Middleware for AdminAuth {
    fn name(&self) -> &str {
        ADMIN_AUTH
    }

    async fn check(&self, meta: &mut RequestMeta) -> std::result::Result<(), Rejection> {
        if meta.principal.is_none() {
            meta.principal = meta.bearer_token().and_then(|token| self.tokens.lookup(token));
        }
        match &meta.principal {
            Some(principal) if principal.role.is_admin() => Ok(()),
            Some(_) => Err(Rejection::forbidden("admin role required")),
            None => Err(Rejection::unauthorized("admin credentials required")),
        }
    }
}

/// `cliBypass`: admits local tooling that sends `x-cli-bypass: 1`, only
/// outside production.
pub struct CliBypass {
    enabled: bool,
}

impl CliBypass {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Middleware for CliBypass {
    fn name(&self) -> &str {
        CLI_BYPASS
    }

    async fn check(&self, meta: &mut RequestMeta) -> std::result::Result<(), Rejection> {
        let requested = matches!(meta.header(CLI_BYPASS_HEADER), Some("1" | "true"));
        if self.enabled && requested && meta.principal.is_none() {
            meta.principal = Some(Principal::new("cli", Role::Cli));
        }
        Ok(())
    }
}

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// `rateLimit`: token bucket per principal, falling back to the client key.
pub struct RateLimit {
    capacity: f64,
    refill_per_sec: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimit {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: refill_per_sec.max(0.0),
            buckets: DashMap::new(),
        }
    }
}

#[async_trait]
impl Middleware for RateLimit {
    fn name(&self) -> &str {
        RATE_LIMIT
    }

    async fn check(&self, meta: &mut RequestMeta) -> std::result::Result<(), Rejection> {
        let key = meta
            .principal
            .as_ref()
            .map(|p| p.id.clone())
            .or_else(|| meta.client.clone())
            .unwrap_or_else(|| "anonymous".to_string());

        let now = Instant::now();
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: self.capacity,
            refreshed: now,
        });
        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.refreshed = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Rejection::rate_limited())
        }
    }
}

/// Settings for the built-in capabilities.
#[derive(Debug, Clone)]
pub struct BuiltinCapabilities {
    pub tokens: Arc<TokenTable>,
    pub cli_bypass: bool,
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: f64,
}

/// Process-wide middleware implementations, keyed by name.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Arc<dyn Middleware>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(settings: &BuiltinCapabilities) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BearerAuth::new(settings.tokens.clone())));
        registry.register(Arc::new(AdminAuth::new(settings.tokens.clone())));
        registry.register(Arc::new(CliBypass::new(settings.cli_bypass)));
        registry.register(Arc::new(RateLimit::new(
            settings.rate_limit_capacity,
            settings.rate_limit_refill_per_sec,
        )));
        registry
    }

    pub fn register(&mut self, middleware: Arc<dyn Middleware>) {
        self.entries.insert(middleware.name().to_string(), middleware);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// A project's view of the registry, with its tag aliases applied.
#[derive(Clone)]
pub struct ProjectCapabilities {
    registry: Arc<CapabilityRegistry>,
    aliases: BTreeMap<String, String>,
}

impl ProjectCapabilities {
    pub fn new(registry: Arc<CapabilityRegistry>, aliases: BTreeMap<String, String>) -> Self {
        Self { registry, aliases }
    }

    pub fn lookup(&self, tag: &str) -> Option<Arc<dyn Middleware>> {
        let name = self.aliases.get(tag).map(String::as_str).unwrap_or(tag);
        self.registry.get(name)
    }

    pub fn resolve(&self, plugin: &str, tag: &str) -> Result<Arc<dyn Middleware>> {
        self.lookup(tag).ok_or_else(|| RuntimeError::UnknownMiddleware {
            plugin: plugin.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Every tag this project can resolve.
    pub fn tags(&self) -> Vec<String> {
        let mut tags = self.registry.names();
        tags.extend(
            self.aliases
                .iter()
                .filter(|(_, target)| self.registry.get(target).is_some())
                .map(|(alias, _)| alias.clone()),
        );
        tags.sort();
        tags.dedup();
        tags
    }
}
