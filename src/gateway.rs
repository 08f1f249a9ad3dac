//! HTTP upgrade endpoints and the per-socket session loop.
//!
//! A connection is `accepted` (registered with the manager) or `rejected`
//! (HTTP error written, no state created) — nothing in between. Clients
//! attach on the cluster-stream endpoint with a `clusterId` query
//! parameter; agents attach on a per-instance endpoint and must present a
//! bearer token before the upgrade happens.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing, Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent_handler::handle_agent_frame;
use crate::client_handler::handle_client_frame;
use crate::connections::{Connection, ConnectionManager, OutboundSender, Role, Session};
use crate::notify::ClientNotifier;
use crate::platform::Platform;

#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<ConnectionManager>,
    pub notifier: Arc<ClientNotifier>,
    pub platform: Platform,
    pub agent_token_ttl: Duration,
}

impl GatewayState {
    pub fn new(platform: Platform, status_cache_ttl: Duration, agent_token_ttl: Duration) -> Self {
        let manager = Arc::new(ConnectionManager::new());
        let notifier = Arc::new(ClientNotifier::new(
            manager.clone(),
            platform.cache.clone(),
            status_cache_ttl,
        ));
        Self {
            manager,
            notifier,
            platform,
            agent_token_ttl,
        }
    }

    /// Expiry for freshly minted agent-access tokens.
    pub fn token_expiry(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.agent_token_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(15))
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", routing::get(health))
        .route("/ws/clusters", routing::get(client_ws))
        .route("/ws/agents/{instance_id}", routing::get(agent_ws))
        .with_state(state)
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "fleet-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.manager.connection_count(),
        "tenants": state.manager.tenant_count(),
    }))
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": { "code": code, "message": message }
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStreamQuery {
    #[serde(default)]
    cluster_id: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

/// Dashboard stream endpoint. Tenant comes from the `clusterId` query
/// parameter; a bearer token is optional and, when it verifies, attaches a
/// user session to the connection (required later for deploys).
async fn client_ws(
    State(state): State<GatewayState>,
    Query(query): Query<ClientStreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(tenant) = query.cluster_id.filter(|id| !id.trim().is_empty()) else {
        return reject(
            StatusCode::BAD_REQUEST,
            "missing-field",
            "clusterId query parameter is required",
        );
    };

    let session = match query.token.as_deref() {
        Some(token) => match state.platform.tokens.verify(token).await {
            Ok(claims) => claims.user_id.map(|user_id| Session {
                user_id,
                email: None,
            }),
            Err(error) => {
                tracing::warn!(
                    target = "gateway::upgrade",
                    tenant = %tenant,
                    error = %error,
                    "ignoring invalid client token; connection continues unauthenticated"
                );
                None
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| run_socket(state, socket, tenant, Role::Client, session))
}

/// Per-instance agent endpoint. The bearer token is mandatory and the
/// instance must resolve to an owning tenant; both checks reject at the
/// HTTP level before any socket exists.
async fn agent_ws(
    State(state): State<GatewayState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing bearer token",
        );
    };
    if let Err(error) = state.platform.tokens.verify(token).await {
        tracing::warn!(
            target = "gateway::upgrade",
            instance = %instance_id,
            error = %error,
            "agent token rejected"
        );
        return reject(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Invalid bearer token",
        );
    }

    let tenant = match state.platform.instances.owning_tenant(&instance_id).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => {
            return reject(StatusCode::NOT_FOUND, "not-found", "Unknown instance");
        }
        Err(error) => {
            tracing::error!(
                target = "gateway::upgrade",
                instance = %instance_id,
                error = %error,
                "instance lookup failed"
            );
            return reject(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal-error",
                "Instance lookup failed",
            );
        }
    };

    ws.on_upgrade(move |socket| run_socket(state, socket, tenant, Role::Agent, None))
}

/// Accept token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Owns one accepted socket: registers the connection, pumps outbound
/// frames through a writer task, feeds inbound frames to the role's
/// handler in receipt order, and cascade-removes all state on close.
async fn run_socket(
    state: GatewayState,
    socket: WebSocket,
    tenant: String,
    role: Role,
    session: Option<Session>,
) {
    let (sender, mut outbound_rx) = OutboundSender::channel();
    let conn = Connection::new(tenant, role, session, sender);
    state.manager.register(conn.clone());
    tracing::info!(
        target = "gateway::session",
        tenant = %conn.tenant,
        role = %conn.role.as_str(),
        connection = %conn.id,
        "connection registered"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                state.manager.update_activity(&conn);
                let frame: Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        tracing::debug!(
                            target = "gateway::session",
                            connection = %conn.id,
                            "ignoring non-json text frame"
                        );
                        continue;
                    }
                };
                match conn.role {
                    Role::Client => handle_client_frame(&state, &conn, frame).await,
                    Role::Agent => handle_agent_frame(&state, &conn, frame).await,
                }
            }
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the protocol layer; binary frames
            // are not part of this protocol.
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    target = "gateway::session",
                    connection = %conn.id,
                    error = %error,
                    "socket read error"
                );
                break;
            }
        }
    }

    state.manager.remove(&conn);
    writer.abort();
    tracing::info!(
        target = "gateway::session",
        tenant = %conn.tenant,
        role = %conn.role.as_str(),
        connection = %conn.id,
        "connection closed"
    );
}
