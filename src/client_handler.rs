//! Behavior for frames arriving from dashboard (client) connections.
//!
//! Malformed or incomplete frames are logged and dropped without a reply;
//! the one exception is `log_stream` token verification failures, which get
//! an explicit error frame back so the client can resolve its pending UI
//! state.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::connections::{log_stream_id, Connection, LogStreamSubscription};
use crate::errors::{error_frame, ErrorCode};
use crate::gateway::GatewayState;
use crate::notify::status_cache_key;
use crate::platform::TokenClaims;
use crate::protocol::{
    classify, new_task_id, DeployRequest, DispatchTask, LogStreamRequest, LogSubscribeRequest,
    LogUnsubscribeRequest, MessageKind, TaskKind,
};

pub async fn handle_client_frame(state: &GatewayState, conn: &Arc<Connection>, frame: Value) {
    match classify(&frame) {
        MessageKind::Subscribe => subscribe(state, conn).await,
        MessageKind::Deploy => match serde_json::from_value::<DeployRequest>(frame) {
            Ok(request) => deploy(state, conn, request).await,
            Err(error) => drop_malformed("deploy", &error),
        },
        MessageKind::LogSubscribe => match serde_json::from_value::<LogSubscribeRequest>(frame) {
            Ok(request) => log_subscribe(state, conn, request).await,
            Err(error) => drop_malformed("log_subscribe", &error),
        },
        MessageKind::LogUnsubscribe => {
            match serde_json::from_value::<LogUnsubscribeRequest>(frame) {
                Ok(request) => log_unsubscribe(state, conn, request),
                Err(error) => drop_malformed("log_unsubscribe", &error),
            }
        }
        MessageKind::LogStream => match serde_json::from_value::<LogStreamRequest>(frame) {
            Ok(request) => log_stream(state, conn, request).await,
            Err(error) => drop_malformed("log_stream", &error),
        },
        MessageKind::Hello => hello(conn),
        MessageKind::Error => {}
        other => {
            tracing::warn!(
                target = "gateway::client",
                connection = %conn.id,
                kind = ?other,
                "ignoring unexpected frame from client"
            );
        }
    }
}

fn drop_malformed(kind: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        target = "gateway::client",
        kind = %kind,
        error = %error,
        "dropping malformed client frame"
    );
}

fn hello(conn: &Connection) {
    let ack = json!({ "kind": "hello_ack", "connectionId": conn.id.to_string() });
    if let Err(error) = conn.send(&ack) {
        tracing::warn!(
            target = "gateway::client",
            connection = %conn.id,
            error = %error,
            "hello ack send failed"
        );
    }
}

/// Replay the tenant's last-known status payload from the cache, if any.
/// Best effort: a failed send is logged, not retried.
async fn subscribe(state: &GatewayState, conn: &Arc<Connection>) {
    let key = status_cache_key(&conn.tenant);
    match state.platform.cache.get(&key).await {
        Ok(Some(snapshot)) => {
            if let Err(error) = conn.send(&snapshot) {
                tracing::warn!(
                    target = "gateway::client",
                    tenant = %conn.tenant,
                    connection = %conn.id,
                    error = %error,
                    "status replay send failed"
                );
            }
        }
        Ok(None) => {
            tracing::debug!(
                target = "gateway::client",
                tenant = %conn.tenant,
                "no cached status to replay"
            );
        }
        Err(error) => {
            tracing::warn!(
                target = "gateway::client",
                tenant = %conn.tenant,
                error = %error,
                "status cache read failed"
            );
        }
    }
}

/// Dispatch a deploy task to the tenant's agents. Requires an
/// authenticated session; the response arrives asynchronously through the
/// agent handler and is routed back by task id.
async fn deploy(state: &GatewayState, conn: &Arc<Connection>, request: DeployRequest) {
    let Some(session) = conn.session.as_ref() else {
        tracing::warn!(
            target = "gateway::client",
            connection = %conn.id,
            "dropping deploy from unauthenticated connection"
        );
        return;
    };

    let claims = TokenClaims {
        tenant: conn.tenant.clone(),
        instance_id: Some(request.instance_id.clone()),
        user_id: Some(session.user_id.clone()),
        expires_at: state.token_expiry(),
    };
    let token = match state.platform.tokens.mint(claims).await {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(
                target = "gateway::client",
                connection = %conn.id,
                error = %error,
                "deploy token mint failed"
            );
            return;
        }
    };

    let task_id = new_task_id();
    state
        .manager
        .add_pending_request(&task_id, conn.clone(), TaskKind::Deploy);
    let task = DispatchTask::new(
        &task_id,
        &TaskKind::Deploy,
        json!({
            "instanceId": request.instance_id,
            "token": token,
            "deployment": request.payload,
        }),
    );
    dispatch_to_agents(state, &conn.tenant, &task.into_frame());
}

/// Legacy/full log subscription by instance + path. Dedup by derived
/// stream id: a second subscriber rewires the existing stream instead of
/// dispatching another task.
async fn log_subscribe(state: &GatewayState, conn: &Arc<Connection>, request: LogSubscribeRequest) {
    let stream_id = log_stream_id(
        &conn.tenant,
        &request.path,
        request.start_offset,
        request.limit,
    );
    if state
        .manager
        .update_log_stream_client(&stream_id, conn.clone())
    {
        tracing::debug!(
            target = "gateway::client",
            stream_id = %stream_id,
            connection = %conn.id,
            "reusing existing log stream for new subscriber"
        );
        return;
    }

    state.manager.add_log_stream(LogStreamSubscription {
        stream_id: stream_id.clone(),
        path: request.path.clone(),
        client: conn.clone(),
        start_offset: request.start_offset,
        limit: request.limit,
    });

    let claims = TokenClaims {
        tenant: conn.tenant.clone(),
        instance_id: Some(request.instance_id.clone()),
        user_id: conn.session.as_ref().map(|s| s.user_id.clone()),
        expires_at: state.token_expiry(),
    };
    let token = match state.platform.tokens.mint(claims).await {
        Ok(token) => token,
        Err(error) => {
            state.manager.remove_log_stream(&stream_id);
            tracing::warn!(
                target = "gateway::client",
                stream_id = %stream_id,
                error = %error,
                "log stream token mint failed"
            );
            return;
        }
    };

    let payload = log_task_payload(
        &request.path,
        &stream_id,
        request.start_offset,
        request.limit,
        &token,
        None,
    );
    dispatch_log_task(state, conn, &stream_id, payload);
}

/// Token-gated stream form. The presented token must verify on its own; a
/// failure answers the requester with an error frame echoing the streamId
/// it sent, so its pending UI state can resolve.
async fn log_stream(state: &GatewayState, conn: &Arc<Connection>, request: LogStreamRequest) {
    if let Err(error) = state.platform.tokens.verify(&request.token).await {
        tracing::warn!(
            target = "gateway::client",
            connection = %conn.id,
            stream_id = %request.stream_id,
            error = %error,
            "log stream token rejected"
        );
        let frame = error_frame(
            ErrorCode::Unauthorized,
            "Log stream token is invalid or expired.",
            Some(&request.stream_id),
            None,
        );
        if let Err(error) = conn.send(&frame) {
            tracing::warn!(
                target = "gateway::client",
                connection = %conn.id,
                error = %error,
                "log stream error send failed"
            );
        }
        return;
    }

    let start_offset = request.start_offset();
    let limit = request.entry_limit();
    let stream_id = log_stream_id(&conn.tenant, &request.path, start_offset, limit);
    if state
        .manager
        .update_log_stream_client(&stream_id, conn.clone())
    {
        tracing::debug!(
            target = "gateway::client",
            stream_id = %stream_id,
            connection = %conn.id,
            "reusing existing log stream for new subscriber"
        );
        return;
    }

    state.manager.add_log_stream(LogStreamSubscription {
        stream_id: stream_id.clone(),
        path: request.path.clone(),
        client: conn.clone(),
        start_offset,
        limit,
    });

    let payload = log_task_payload(
        &request.path,
        &stream_id,
        start_offset,
        limit,
        &request.token,
        Some(&request.mode),
    );
    dispatch_log_task(state, conn, &stream_id, payload);
}

fn log_unsubscribe(state: &GatewayState, conn: &Connection, request: LogUnsubscribeRequest) {
    let removed = state
        .manager
        .remove_log_streams_by_path(&request.path, conn.id);
    tracing::debug!(
        target = "gateway::client",
        connection = %conn.id,
        path = %request.path,
        removed,
        "log unsubscribe"
    );
}

fn log_task_payload(
    path: &str,
    stream_id: &str,
    start_offset: Option<i64>,
    limit: Option<u32>,
    token: &str,
    mode: Option<&str>,
) -> Value {
    let mut payload = json!({
        "path": path,
        "streamId": stream_id,
        "token": token,
    });
    if let Some(offset) = start_offset {
        payload["startOffset"] = offset.into();
    }
    if let Some(limit) = limit {
        payload["limit"] = limit.into();
    }
    if let Some(mode) = mode {
        payload["mode"] = mode.into();
    }
    payload
}

fn dispatch_log_task(state: &GatewayState, conn: &Arc<Connection>, stream_id: &str, payload: Value) {
    let task_id = new_task_id();
    state
        .manager
        .add_pending_request(&task_id, conn.clone(), TaskKind::LogStream);
    let task = DispatchTask::new(&task_id, &TaskKind::LogStream, payload);
    dispatch_to_agents(state, &conn.tenant, &task.into_frame());
    tracing::debug!(
        target = "gateway::client",
        stream_id = %stream_id,
        task_id = %task_id,
        "log stream task dispatched"
    );
}

/// Send a frame to every open agent connection of the tenant. A tenant
/// with no connected agents is only a warning; the client learns about the
/// failure through its own request timeout.
pub(crate) fn dispatch_to_agents(state: &GatewayState, tenant: &str, frame: &Value) -> usize {
    let agents = state.manager.agents(tenant);
    if agents.is_empty() {
        tracing::warn!(
            target = "gateway::dispatch",
            tenant = %tenant,
            "no agents connected; task not delivered"
        );
        return 0;
    }
    let mut sent = 0usize;
    for agent in &agents {
        if !agent.is_open() {
            continue;
        }
        match agent.send(frame) {
            Ok(()) => sent += 1,
            Err(error) => {
                tracing::warn!(
                    target = "gateway::dispatch",
                    tenant = %tenant,
                    connection = %agent.id,
                    error = %error,
                    "task send to agent failed"
                );
            }
        }
    }
    tracing::debug!(
        target = "gateway::dispatch",
        tenant = %tenant,
        sent,
        agents = agents.len(),
        "task dispatched"
    );
    sent
}
