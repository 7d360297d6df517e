//! Transport-neutral request and response types seen by plugin handlers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;
use crate::manifest::HttpMethod;
use crate::storage::StorageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    /// Local tooling admitted by the `cliBypass` capability.
    Cli,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::Cli)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

/// Caller metadata that middleware inspects and enriches.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    /// Remote address or other client key, when the transport knows it.
    pub client: Option<String>,
    pub principal: Option<Principal>,
}

impl RequestMeta {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| token.trim())
            .filter(|t| !t.is_empty())
    }
}

/// A request as it arrives at the route mount controller.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: HttpMethod,
    /// Path relative to the plugin namespace.
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Value,
    pub meta: RequestMeta,
}

impl IncomingRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            body: Value::Null,
            meta: RequestMeta::default(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.meta.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }
}

/// What a route handler receives.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    pub project_id: String,
    pub plugin_id: String,
    pub method: HttpMethod,
    pub path: String,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Value,
    pub meta: RequestMeta,
    pub storage: StorageHandle,
    pub config: Arc<Value>,
}

impl PluginRequest {
    pub fn param(&self, name: &str) -> Result<&str, PluginError> {
        self.params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PluginError::bad_request(format!("missing path parameter `{name}`")))
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.meta.principal.as_ref()
    }

    /// Deserializes the JSON body.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, PluginError> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| PluginError::bad_request(format!("invalid body: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginResponse {
    pub status: u16,
    pub body: Value,
}

impl PluginResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn created(body: Value) -> Self {
        Self { status: 201, body }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: Value::Null,
        }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Error body in the shape the admin surface uses.
    pub fn error(status: u16, tag: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": tag, "message": message.into() }),
        }
    }
}
