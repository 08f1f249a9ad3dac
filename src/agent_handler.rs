//! Behavior for frames arriving from remote-agent connections.
//!
//! Three concerns meet here: routing responses back to the client that
//! asked, side-effecting persistent state on specific successful response
//! kinds, and translating the agent-side error taxonomy into the codes
//! dashboards understand. An unroutable response is an expected race with
//! timeout or disconnect, never an error.

use std::sync::Arc;

use serde_json::Value;

use crate::connections::{watch_key, Connection};
use crate::errors::{error_frame, normalize_agent_error};
use crate::gateway::GatewayState;
use crate::protocol::{
    classify, FileUpdateFrame, LogChunkFrame, MessageKind, TaskKind, TaskResponseFrame,
};

pub async fn handle_agent_frame(state: &GatewayState, conn: &Arc<Connection>, frame: Value) {
    match classify(&frame) {
        MessageKind::TaskResponse => task_response(state, conn, frame).await,
        MessageKind::Broadcast => broadcast(state, conn, frame).await,
        MessageKind::LogChunk => log_chunk(state, frame),
        MessageKind::FileUpdate => file_update(state, conn, frame),
        MessageKind::Hello => hello(conn),
        MessageKind::Error => {}
        other => {
            tracing::warn!(
                target = "gateway::agent",
                connection = %conn.id,
                kind = ?other,
                "ignoring unexpected frame from agent"
            );
        }
    }
}

fn hello(conn: &Connection) {
    let ack = serde_json::json!({ "kind": "hello_ack", "connectionId": conn.id.to_string() });
    if let Err(error) = conn.send(&ack) {
        tracing::warn!(
            target = "gateway::agent",
            connection = %conn.id,
            error = %error,
            "hello ack send failed"
        );
    }
}

async fn task_response(state: &GatewayState, conn: &Arc<Connection>, raw: Value) {
    let parsed: TaskResponseFrame = match serde_json::from_value(raw.clone()) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(
                target = "gateway::agent",
                connection = %conn.id,
                error = %error,
                "dropping malformed task response"
            );
            return;
        }
    };

    // Failures carrying a structured error object get normalized and
    // answered directly; they never fall through to generic routing.
    if !parsed.success {
        if let Some(report) = parsed.error.as_ref() {
            let Some(pending) = state.manager.remove_pending_request(&parsed.task_id) else {
                tracing::warn!(
                    target = "gateway::agent",
                    task_id = %parsed.task_id,
                    "could not route task failure: no pending request"
                );
                return;
            };
            let normalized = normalize_agent_error(report.code.as_deref(), &report.message);
            let frame = error_frame(
                normalized.code,
                &normalized.message,
                None,
                Some(&parsed.task_id),
            );
            if let Err(error) = pending.client.send(&frame) {
                tracing::warn!(
                    target = "gateway::agent",
                    task_id = %parsed.task_id,
                    connection = %pending.client.id,
                    error = %error,
                    "normalized error send failed"
                );
            }
            return;
        }
    }

    let Some(pending) = state.manager.get_pending_request(&parsed.task_id) else {
        tracing::warn!(
            target = "gateway::agent",
            task_id = %parsed.task_id,
            "could not route response: no pending request"
        );
        return;
    };

    let mut routed = raw;
    routed["kind"] = Value::String(pending.kind.response_kind().to_string());
    if !state
        .manager
        .route_response_to_client(&parsed.task_id, &routed)
    {
        return;
    }

    if parsed.success {
        match pending.kind {
            TaskKind::Deploy => {
                persist_deploy(state, &conn.tenant, parsed.data.as_ref()).await;
            }
            TaskKind::RemoveService => {
                persist_service_removal(state, &conn.tenant, parsed.data.as_ref()).await;
            }
            _ => {}
        }
    }
}

async fn persist_deploy(state: &GatewayState, tenant: &str, data: Option<&Value>) {
    let Some((instance_id, name)) = service_fields(data) else {
        tracing::debug!(
            target = "gateway::agent",
            tenant = %tenant,
            "deploy response carried no service fields"
        );
        return;
    };
    if let Err(error) = state
        .platform
        .services
        .upsert_service(tenant, instance_id, name)
        .await
    {
        tracing::warn!(
            target = "gateway::agent",
            tenant = %tenant,
            instance = %instance_id,
            service = %name,
            error = %error,
            "service upsert failed"
        );
    }
}

async fn persist_service_removal(state: &GatewayState, tenant: &str, data: Option<&Value>) {
    let Some((instance_id, name)) = service_fields(data) else {
        tracing::debug!(
            target = "gateway::agent",
            tenant = %tenant,
            "removal response carried no service fields"
        );
        return;
    };
    if let Err(error) = state
        .platform
        .services
        .remove_service(tenant, instance_id, name)
        .await
    {
        tracing::warn!(
            target = "gateway::agent",
            tenant = %tenant,
            instance = %instance_id,
            service = %name,
            error = %error,
            "service removal failed"
        );
    }
}

fn service_fields(data: Option<&Value>) -> Option<(&str, &str)> {
    let data = data?;
    let instance_id = data.get("instance_id").and_then(Value::as_str)?;
    let name = data.get("name").and_then(Value::as_str)?;
    Some((instance_id, name))
}

/// Status/update reports: pipe instance-bearing payloads through the
/// update sink, then fan the raw frame out to the tenant's clients.
async fn broadcast(state: &GatewayState, conn: &Arc<Connection>, frame: Value) {
    if let Some(instance_id) = frame.get("instance_id").and_then(Value::as_str) {
        if let Err(error) = state
            .platform
            .updates
            .process_update(&conn.tenant, instance_id, &frame)
            .await
        {
            tracing::warn!(
                target = "gateway::agent",
                tenant = %conn.tenant,
                instance = %instance_id,
                error = %error,
                "update processing failed"
            );
        }
    }
    state.notifier.broadcast(&conn.tenant, &frame).await;
}

/// Forward a chunk to the stream's subscriber. A dead subscriber socket
/// removes the now-useless subscription; an unknown stream id is silently
/// ignored (superseded or unsubscribed).
fn log_chunk(state: &GatewayState, frame: Value) {
    let parsed: LogChunkFrame = match serde_json::from_value(frame.clone()) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(
                target = "gateway::agent",
                error = %error,
                "dropping malformed log chunk"
            );
            return;
        }
    };
    let Some(sub) = state.manager.get_log_stream(&parsed.stream_id) else {
        tracing::debug!(
            target = "gateway::agent",
            stream_id = %parsed.stream_id,
            "log chunk for unknown stream"
        );
        return;
    };
    if let Err(error) = sub.client.send(&frame) {
        state.manager.remove_log_stream(&parsed.stream_id);
        tracing::error!(
            target = "gateway::agent",
            stream_id = %parsed.stream_id,
            connection = %sub.client.id,
            error = %error,
            "removed log stream after dead-socket send"
        );
    }
}

/// Fan a filesystem change event out to the watch key's subscribers.
/// Individual dead sockets are logged and skipped without aborting the
/// rest of the broadcast.
fn file_update(state: &GatewayState, conn: &Arc<Connection>, frame: Value) {
    let parsed: FileUpdateFrame = match serde_json::from_value(frame.clone()) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(
                target = "gateway::agent",
                error = %error,
                "dropping malformed file update"
            );
            return;
        }
    };
    let key = watch_key(&parsed.instance_id, &parsed.event.path);
    let subscribers = state.manager.file_watch_subscribers(&key);
    let mut attempted = 0usize;
    let mut sent = 0usize;
    for id in subscribers {
        // Subscribers that already disconnected resolve to nothing.
        let Some(target) = state.manager.connection(&conn.tenant, id) else {
            continue;
        };
        if !target.is_open() {
            continue;
        }
        attempted += 1;
        match target.send(&frame) {
            Ok(()) => sent += 1,
            Err(error) => {
                tracing::warn!(
                    target = "gateway::agent",
                    watch_key = %key,
                    connection = %target.id,
                    error = %error,
                    "file update send failed"
                );
            }
        }
    }
    tracing::debug!(
        target = "gateway::agent",
        watch_key = %key,
        sent,
        attempted,
        "file update fanned out"
    );
}
