//! Wire protocol for the gateway: JSON frames over WebSocket.
//!
//! Every frame carries a `kind` discriminant. `classify` maps a decoded
//! frame onto the closed set of known kinds; frames that match nothing are
//! `Unknown` and get dropped (with a log line) by the handlers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Agent broadcast kinds fanned out verbatim to every dashboard connection
/// of the tenant.
pub const BROADCAST_KINDS: [&str; 2] = ["status_report", "instance_update"];

/// The closed set of frame kinds exchanged over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client wants the tenant status replay.
    Subscribe,
    /// Client requests a deployment.
    Deploy,
    /// Client subscribes to a log byte range (legacy full form).
    LogSubscribe,
    /// Client drops all log subscriptions for a path.
    LogUnsubscribe,
    /// Token-gated log stream request.
    LogStream,
    /// Agent response to a dispatched task.
    TaskResponse,
    /// Agent status broadcast, fanned out to the tenant's clients.
    Broadcast,
    /// Agent log chunk addressed to one stream subscriber.
    LogChunk,
    /// Agent filesystem change event addressed to watch-key subscribers.
    FileUpdate,
    /// Error frame (gateway-to-client only; ignored inbound).
    Error,
    /// Handshake/liveness probe.
    Hello,
    /// No predicate matched.
    Unknown,
}

/// Classify a decoded frame by its `kind` discriminant.
///
/// Exhaustive and mutually exclusive: exactly one known kind matches, or
/// the frame is `Unknown`.
pub fn classify(frame: &Value) -> MessageKind {
    let Some(kind) = frame.get("kind").and_then(Value::as_str) else {
        return MessageKind::Unknown;
    };
    match kind {
        "subscribe" => MessageKind::Subscribe,
        "deploy" => MessageKind::Deploy,
        "log_subscribe" => MessageKind::LogSubscribe,
        "log_unsubscribe" => MessageKind::LogUnsubscribe,
        "log_stream" => MessageKind::LogStream,
        "task_response" => MessageKind::TaskResponse,
        "log_chunk" => MessageKind::LogChunk,
        "file_update" => MessageKind::FileUpdate,
        "error" => MessageKind::Error,
        "hello" => MessageKind::Hello,
        other if BROADCAST_KINDS.contains(&other) => MessageKind::Broadcast,
        _ => MessageKind::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Client frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub instance_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSubscribeRequest {
    pub instance_id: String,
    pub path: String,
    #[serde(default)]
    pub start_offset: Option<i64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogUnsubscribeRequest {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStreamRequest {
    pub token: String,
    pub path: String,
    pub stream_id: String,
    pub mode: String,
    pub start_from: i64,
}

impl LogStreamRequest {
    /// `-1` means "tail from the end": no explicit offset is sent to agents.
    pub fn start_offset(&self) -> Option<i64> {
        (self.start_from >= 0).then_some(self.start_from)
    }

    /// `tail` mode follows unbounded; any other mode caps the entry count.
    pub fn entry_limit(&self) -> Option<u32> {
        (self.mode != "tail").then_some(LOG_STREAM_ENTRY_CAP)
    }
}

pub const LOG_STREAM_ENTRY_CAP: u32 = 1000;

// ---------------------------------------------------------------------------
// Agent frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponseFrame {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<AgentErrorReport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentErrorReport {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunkFrame {
    pub stream_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdateFrame {
    pub instance_id: String,
    pub event: FileEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEvent {
    pub path: String,
}

// ---------------------------------------------------------------------------
// Task dispatch
// ---------------------------------------------------------------------------

/// The kind of work dispatched to an agent. Selects the task's `Type`
/// address and the response kind used when routing the answer back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Deploy,
    RemoveService,
    LogStream,
    Other(String),
}

impl TaskKind {
    /// `path:verb` address understood by agents.
    pub fn task_type(&self) -> String {
        match self {
            TaskKind::Deploy => "/deployments:POST".to_string(),
            TaskKind::RemoveService => "/services:DELETE".to_string(),
            TaskKind::LogStream => "/logs/stream:GET".to_string(),
            TaskKind::Other(kind) => format!("/{kind}:POST"),
        }
    }

    /// Response kind tagged onto the routed answer. Unmapped kinds degrade
    /// to the generic `task_response`.
    pub fn response_kind(&self) -> &'static str {
        match self {
            TaskKind::Deploy => "deploy_response",
            TaskKind::RemoveService => "remove_service_response",
            TaskKind::LogStream => "log_stream_response",
            TaskKind::Other(_) => "task_response",
        }
    }
}

/// Unit of work pushed to agents. The capitalized keys are the agent-side
/// task object shape and must stay as-is.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchTask {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub task_type: String,
    #[serde(rename = "Payload")]
    pub payload: Value,
    #[serde(rename = "Status")]
    pub status: String,
}

impl DispatchTask {
    pub fn new(id: impl Into<String>, kind: &TaskKind, payload: Value) -> Self {
        Self {
            id: id.into(),
            task_type: kind.task_type(),
            payload,
            status: "pending".to_string(),
        }
    }

    /// Wrap the task in a wire frame so it carries the `kind` discriminant
    /// like every other frame.
    pub fn into_frame(self) -> Value {
        json!({ "kind": "task", "task": self })
    }
}

pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}
