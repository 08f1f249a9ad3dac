//! Normalized error taxonomy surfaced to dashboard clients, and the
//! normalizer for agent-reported task failures.
//!
//! Agents may embed a structured JSON blob describing a finer-grained
//! failure inside a human-readable message string. That quirk of the agent
//! protocol is isolated here: `normalize_agent_error` is the only place
//! that parses it, and it always falls back to a generic internal error.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

/// Error codes surfaced to dashboard clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "unauthorized")]
    Unauthorized,
    #[serde(rename = "permission-denied")]
    PermissionDenied,
    #[serde(rename = "not-found")]
    NotFound,
    #[serde(rename = "missing-field")]
    MissingField,
    #[serde(rename = "internal-error")]
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::NotFound => "not-found",
            ErrorCode::MissingField => "missing-field",
            ErrorCode::InternalError => "internal-error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const FALLBACK_MESSAGE: &str = "The agent reported an internal error.";

/// A user-safe error derived from an agent failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedError {
    pub code: ErrorCode,
    pub message: String,
}

impl NormalizedError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
        }
    }
}

/// Build the error frame delivered to a client socket.
pub fn error_frame(
    code: ErrorCode,
    message: &str,
    stream_id: Option<&str>,
    task_id: Option<&str>,
) -> Value {
    let mut frame = json!({
        "kind": "error",
        "code": code.as_str(),
        "message": message,
    });
    if let Some(stream_id) = stream_id {
        frame["streamId"] = Value::String(stream_id.to_string());
    }
    if let Some(task_id) = task_id {
        frame["taskId"] = Value::String(task_id.to_string());
    }
    frame
}

/// Map a structured inner agent code to a normalized code and a fixed
/// user-safe message.
fn map_inner_code(code: &str) -> Option<NormalizedError> {
    let (code, message) = match code {
        "auth.unauthorized" => (
            ErrorCode::Unauthorized,
            "Your session is not authorized for this instance. Please sign in again.",
        ),
        "auth.forbidden" => (
            ErrorCode::PermissionDenied,
            "You do not have permission to perform this action.",
        ),
        "resource.not_found" => (
            ErrorCode::NotFound,
            "The requested resource was not found on the instance.",
        ),
        "request.missing_params" => (
            ErrorCode::MissingField,
            "The request was missing required fields.",
        ),
        "internal.registration_failure" => (ErrorCode::InternalError, FALLBACK_MESSAGE),
        _ => return None,
    };
    Some(NormalizedError {
        code,
        message: message.to_string(),
    })
}

static FLAT_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("flat object pattern is valid"));

/// Pull an embedded JSON object out of a human-readable message string.
///
/// Tries the widest brace span first so nested objects survive, then falls
/// back to the first flat `{...}` run.
fn extract_embedded_json(message: &str) -> Option<Value> {
    let start = message.find('{')?;
    let end = message.rfind('}')?;
    if end > start {
        if let Ok(value) = serde_json::from_str::<Value>(&message[start..=end]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    FLAT_OBJECT_RE
        .find(message)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .filter(Value::is_object)
}

/// Normalize an agent failure report into a user-safe error.
///
/// Precedence: structured code embedded in the message string, then the
/// report's own top-level code, then a generic internal error carrying the
/// best available message.
pub fn normalize_agent_error(code: Option<&str>, message: &str) -> NormalizedError {
    let embedded_code = extract_embedded_json(message)
        .as_ref()
        .and_then(|blob| blob.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(inner) = embedded_code.as_deref().and_then(map_inner_code) {
        return inner;
    }
    if let Some(outer) = code.and_then(map_inner_code) {
        return outer;
    }

    let best = if message.trim().is_empty() {
        FALLBACK_MESSAGE.to_string()
    } else {
        message.to_string()
    };
    NormalizedError::internal(best)
}
