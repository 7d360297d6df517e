//! JSON error responses: `{ error, message, auditId }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use plugin_runtime::{Rejection, RuntimeError};
use serde_json::{json, Value};

use crate::admin::CommandError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: String,
    audit_id: Option<i64>,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            audit_id: None,
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidInput", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Internal failures keep their details in the audit log only.
        let details = (!status.is_server_error()).then(|| err.details());
        Self {
            status,
            error: err.tag().to_string(),
            message: if status.is_server_error() {
                "internal error".to_string()
            } else {
                err.to_string()
            },
            audit_id: None,
            details,
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        let mut api = ApiError::from(err.error);
        api.audit_id = err.audit_id;
        api
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        let status = StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
        Self::new(status, rejection.error, rejection.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.error,
            "message": self.message,
            "auditId": self.audit_id,
        });
        if let (Some(Value::Object(details)), Some(map)) = (self.details, body.as_object_mut()) {
            let extra: serde_json::Map<String, Value> = details
                .into_iter()
                .filter(|(key, _)| key != "error" && key != "message")
                .collect();
            if !extra.is_empty() {
                map.insert("details".to_string(), Value::Object(extra));
            }
        }
        (self.status, Json(body)).into_response()
    }
}
