//! End-to-end routing tests: real `ConnectionManager` and handlers wired to
//! channel-backed connections, in-memory collaborators behind the platform
//! traits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

use fleet_gateway::agent_handler::handle_agent_frame;
use fleet_gateway::client_handler::handle_client_frame;
use fleet_gateway::connections::{log_stream_id, watch_key, Connection, OutboundSender, Role, Session};
use fleet_gateway::gateway::GatewayState;
use fleet_gateway::notify::status_cache_key;
use fleet_gateway::platform::{
    InMemoryInstanceDirectory, InMemoryServiceStore, InMemoryStatusCache, Platform,
    RecordingUpdateSink, ServiceStore, StatusCache, TokenClaims, TokenService, UuidTokenService,
};
use fleet_gateway::protocol::TaskKind;

struct Harness {
    state: GatewayState,
    cache: Arc<InMemoryStatusCache>,
    services: Arc<InMemoryServiceStore>,
    tokens: Arc<UuidTokenService>,
    updates: Arc<RecordingUpdateSink>,
}

fn harness() -> Harness {
    let cache = Arc::new(InMemoryStatusCache::new());
    let services = Arc::new(InMemoryServiceStore::new());
    let tokens = Arc::new(UuidTokenService::new());
    let updates = Arc::new(RecordingUpdateSink::new());
    let platform = Platform {
        cache: cache.clone(),
        instances: Arc::new(InMemoryInstanceDirectory::new()),
        services: services.clone(),
        tokens: tokens.clone(),
        updates: updates.clone(),
    };
    let state = GatewayState::new(platform, Duration::from_secs(60), Duration::from_secs(600));
    Harness {
        state,
        cache,
        services,
        tokens,
        updates,
    }
}

fn connect(
    state: &GatewayState,
    tenant: &str,
    role: Role,
    session: Option<Session>,
) -> (Arc<Connection>, UnboundedReceiver<String>) {
    let (sender, rx) = OutboundSender::channel();
    let conn = Connection::new(tenant, role, session, sender);
    state.manager.register(conn.clone());
    (conn, rx)
}

fn user_session(user_id: &str) -> Option<Session> {
    Some(Session {
        user_id: user_id.to_string(),
        email: None,
    })
}

fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(text) = rx.try_recv() {
        frames.push(serde_json::from_str(&text).expect("frames are json"));
    }
    frames
}

// ==================== at-most-once response routing ====================

#[tokio::test]
async fn duplicate_task_response_delivers_exactly_once() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    h.state
        .manager
        .add_pending_request("abc", client.clone(), TaskKind::Deploy);

    let response = json!({"kind": "task_response", "taskId": "abc", "success": true, "data": {}});
    handle_agent_frame(&h.state, &agent, response.clone()).await;
    handle_agent_frame(&h.state, &agent, response).await;

    let frames = drain(&mut client_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "deploy_response");
    assert_eq!(frames[0]["success"], true);
}

#[tokio::test]
async fn response_after_client_disconnect_is_a_noop() {
    let h = harness();
    let (client, client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    h.state
        .manager
        .add_pending_request("gone", client.clone(), TaskKind::Deploy);
    h.state.manager.remove(&client);
    drop(client_rx);

    // The pending entry was cascade-removed; routing must not panic.
    handle_agent_frame(
        &h.state,
        &agent,
        json!({"kind": "task_response", "taskId": "gone", "success": true}),
    )
    .await;
    assert!(h.state.manager.get_pending_request("gone").is_none());
}

// ==================== log stream dedup and rewire ====================

#[tokio::test]
async fn identical_log_subscribes_share_one_stream_and_one_dispatch() {
    let h = harness();
    let (first, _first_rx) = connect(&h.state, "t1", Role::Client, None);
    let (second, _second_rx) = connect(&h.state, "t1", Role::Client, None);
    let (_agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    let subscribe = json!({
        "kind": "log_subscribe",
        "instanceId": "i1",
        "path": "/var/log/app.log",
        "startOffset": 0,
        "limit": 100,
    });
    handle_client_frame(&h.state, &first, subscribe.clone()).await;
    handle_client_frame(&h.state, &second, subscribe).await;

    let dispatched = drain(&mut agent_rx);
    assert_eq!(dispatched.len(), 1, "second subscriber reuses the stream");
    assert_eq!(dispatched[0]["kind"], "task");
    assert_eq!(dispatched[0]["task"]["Type"], "/logs/stream:GET");

    let stream_id = log_stream_id("t1", "/var/log/app.log", Some(0), Some(100));
    let sub = h.state.manager.get_log_stream(&stream_id).expect("stream");
    assert_eq!(sub.client.id, second.id);
}

#[tokio::test]
async fn chunks_follow_the_rewired_subscriber() {
    let h = harness();
    let (first, mut first_rx) = connect(&h.state, "t1", Role::Client, None);
    let (second, mut second_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    let subscribe = json!({
        "kind": "log_subscribe",
        "instanceId": "i1",
        "path": "/var/log/app.log",
    });
    handle_client_frame(&h.state, &first, subscribe.clone()).await;
    handle_client_frame(&h.state, &second, subscribe).await;
    drain(&mut agent_rx);
    drain(&mut first_rx);

    let stream_id = log_stream_id("t1", "/var/log/app.log", None, None);
    let chunk = json!({"kind": "log_chunk", "streamId": stream_id, "lines": ["a", "b"]});
    handle_agent_frame(&h.state, &agent, chunk).await;

    assert!(drain(&mut first_rx).is_empty(), "old subscriber gets nothing");
    let frames = drain(&mut second_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "log_chunk");
}

#[tokio::test]
async fn chunk_to_dead_subscriber_removes_the_stream() {
    let h = harness();
    let (client, client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    handle_client_frame(
        &h.state,
        &client,
        json!({"kind": "log_subscribe", "instanceId": "i1", "path": "/var/log/app.log"}),
    )
    .await;
    drain(&mut agent_rx);
    drop(client_rx);

    let stream_id = log_stream_id("t1", "/var/log/app.log", None, None);
    handle_agent_frame(
        &h.state,
        &agent,
        json!({"kind": "log_chunk", "streamId": stream_id}),
    )
    .await;
    assert!(h.state.manager.get_log_stream(&stream_id).is_none());
}

#[tokio::test]
async fn log_unsubscribe_only_drops_own_path_subscriptions() {
    let h = harness();
    let (client, _client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (_agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    handle_client_frame(
        &h.state,
        &client,
        json!({"kind": "log_subscribe", "instanceId": "i1", "path": "/var/log/app.log"}),
    )
    .await;
    handle_client_frame(
        &h.state,
        &client,
        json!({"kind": "log_subscribe", "instanceId": "i1", "path": "/var/log/other.log"}),
    )
    .await;
    drain(&mut agent_rx);

    handle_client_frame(
        &h.state,
        &client,
        json!({"kind": "log_unsubscribe", "path": "/var/log/app.log"}),
    )
    .await;

    assert!(h
        .state
        .manager
        .get_log_stream(&log_stream_id("t1", "/var/log/app.log", None, None))
        .is_none());
    assert!(h
        .state
        .manager
        .get_log_stream(&log_stream_id("t1", "/var/log/other.log", None, None))
        .is_some());
}

// ==================== token-gated log streams ====================

#[tokio::test]
async fn invalid_log_stream_token_answers_with_error_and_creates_nothing() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (_agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    handle_client_frame(
        &h.state,
        &client,
        json!({
            "kind": "log_stream",
            "token": "forged",
            "path": "/var/log/app.log",
            "streamId": "ui-stream-7",
            "mode": "tail",
            "startFrom": -1,
        }),
    )
    .await;

    let frames = drain(&mut client_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "error");
    assert_eq!(frames[0]["code"], "unauthorized");
    assert_eq!(frames[0]["streamId"], "ui-stream-7");

    assert!(drain(&mut agent_rx).is_empty(), "no task was dispatched");
    assert!(h
        .state
        .manager
        .get_log_stream(&log_stream_id("t1", "/var/log/app.log", None, None))
        .is_none());
}

#[tokio::test]
async fn valid_log_stream_tail_dispatches_unbounded_follow() {
    let h = harness();
    let (client, _client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (_agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    let token = h
        .tokens
        .mint(TokenClaims {
            tenant: "t1".into(),
            instance_id: Some("i1".into()),
            user_id: None,
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        })
        .await
        .unwrap();

    handle_client_frame(
        &h.state,
        &client,
        json!({
            "kind": "log_stream",
            "token": token,
            "path": "/var/log/app.log",
            "streamId": "ui-stream-8",
            "mode": "tail",
            "startFrom": -1,
        }),
    )
    .await;

    let dispatched = drain(&mut agent_rx);
    assert_eq!(dispatched.len(), 1);
    let payload = &dispatched[0]["task"]["Payload"];
    assert!(payload.get("startOffset").is_none(), "tail has no offset");
    assert!(payload.get("limit").is_none(), "tail is unbounded");

    let stream_id = log_stream_id("t1", "/var/log/app.log", None, None);
    assert!(h.state.manager.get_log_stream(&stream_id).is_some());
}

// ==================== deploy round trip ====================

#[tokio::test]
async fn deploy_routes_response_and_persists_service_record() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, user_session("u1"));
    let (agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    handle_client_frame(
        &h.state,
        &client,
        json!({"kind": "deploy", "instanceId": "i1", "payload": {"image": "web:1"}}),
    )
    .await;

    let dispatched = drain(&mut agent_rx);
    assert_eq!(dispatched.len(), 1);
    let task = &dispatched[0]["task"];
    assert_eq!(task["Type"], "/deployments:POST");
    assert_eq!(task["Status"], "pending");
    assert_eq!(task["Payload"]["instanceId"], "i1");
    assert!(task["Payload"]["token"].is_string(), "scoped token attached");
    let task_id = task["ID"].as_str().unwrap().to_string();

    handle_agent_frame(
        &h.state,
        &agent,
        json!({
            "kind": "task_response",
            "taskId": task_id,
            "success": true,
            "data": {"instance_id": "i1", "name": "web"},
        }),
    )
    .await;

    let frames = drain(&mut client_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "deploy_response");
    assert_eq!(frames[0]["success"], true);
    assert_eq!(frames[0]["data"]["name"], "web");

    assert_eq!(
        h.services.services(),
        vec![("t1".to_string(), "i1".to_string(), "web".to_string())]
    );
}

#[tokio::test]
async fn deploy_without_session_is_dropped() {
    let h = harness();
    let (client, _client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (_agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    handle_client_frame(
        &h.state,
        &client,
        json!({"kind": "deploy", "instanceId": "i1", "payload": {}}),
    )
    .await;
    assert!(drain(&mut agent_rx).is_empty());
}

// ==================== agent failure normalization ====================

#[tokio::test]
async fn embedded_agent_error_code_is_normalized_for_the_client() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    h.state
        .manager
        .add_pending_request("task-9", client.clone(), TaskKind::Deploy);

    let raw_message = r#"deploy handler blew up: {"code":"auth.unauthorized"} (worker 3)"#;
    handle_agent_frame(
        &h.state,
        &agent,
        json!({
            "kind": "task_response",
            "taskId": "task-9",
            "success": false,
            "error": {"message": raw_message},
        }),
    )
    .await;

    let frames = drain(&mut client_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "error");
    assert_eq!(frames[0]["code"], "unauthorized");
    let message = frames[0]["message"].as_str().unwrap();
    assert!(!message.contains("blew up"), "raw agent text never leaks");

    // The failure consumed the pending entry.
    assert!(h.state.manager.get_pending_request("task-9").is_none());
}

#[tokio::test]
async fn failure_without_error_object_routes_raw_response() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    h.state
        .manager
        .add_pending_request("task-10", client.clone(), TaskKind::Other("restart".into()));

    handle_agent_frame(
        &h.state,
        &agent,
        json!({"kind": "task_response", "taskId": "task-10", "success": false}),
    )
    .await;

    let frames = drain(&mut client_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "task_response");
    assert_eq!(frames[0]["success"], false);
}

#[tokio::test]
async fn successful_removal_response_deletes_the_service_record() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    h.services.upsert_service("t1", "i1", "web").await.unwrap();
    h.state
        .manager
        .add_pending_request("rm-1", client.clone(), TaskKind::RemoveService);

    handle_agent_frame(
        &h.state,
        &agent,
        json!({
            "kind": "task_response",
            "taskId": "rm-1",
            "success": true,
            "data": {"instance_id": "i1", "name": "web"},
        }),
    )
    .await;

    assert_eq!(drain(&mut client_rx)[0]["kind"], "remove_service_response");
    assert!(h.services.services().is_empty());
}

// ==================== broadcasts and status replay ====================

#[tokio::test]
async fn status_report_fans_out_and_survives_one_dead_socket() {
    let h = harness();
    let (_a, mut rx_a) = connect(&h.state, "t1", Role::Client, None);
    let (_dead, dead_rx) = connect(&h.state, "t1", Role::Client, None);
    drop(dead_rx);
    let (_c, mut rx_c) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    let report = json!({"kind": "status_report", "instance_id": "i1", "cpu": 71});
    handle_agent_frame(&h.state, &agent, report.clone()).await;

    assert_eq!(drain(&mut rx_a).len(), 1);
    assert_eq!(drain(&mut rx_c).len(), 1);

    // Instance-bearing reports run through the update pipeline.
    let seen = h.updates.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "t1");
    assert_eq!(seen[0].1, "i1");

    // And the payload is cached for later subscribers.
    assert_eq!(
        h.cache.get(&status_cache_key("t1")).await.unwrap(),
        Some(report)
    );
}

#[tokio::test]
async fn subscribe_replays_cached_status() {
    let h = harness();
    let snapshot = json!({"kind": "status_report", "cpu": 12});
    h.cache
        .put(&status_cache_key("t1"), snapshot.clone(), Duration::from_secs(60))
        .await
        .unwrap();

    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    handle_client_frame(&h.state, &client, json!({"kind": "subscribe"})).await;

    assert_eq!(drain(&mut client_rx), vec![snapshot]);
}

#[tokio::test]
async fn subscribe_with_empty_cache_sends_nothing() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    handle_client_frame(&h.state, &client, json!({"kind": "subscribe"})).await;
    assert!(drain(&mut client_rx).is_empty());
}

// ==================== file watches ====================

#[tokio::test]
async fn file_update_reaches_watchers_only() {
    let h = harness();
    let (watcher, mut watcher_rx) = connect(&h.state, "t1", Role::Client, None);
    let (_bystander, mut bystander_rx) = connect(&h.state, "t1", Role::Client, None);
    let (dead, dead_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, _agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    let key = watch_key("i1", "/srv/app/config.yml");
    h.state.manager.add_file_watch(&key, watcher.id);
    h.state.manager.add_file_watch(&key, dead.id);
    drop(dead_rx);

    handle_agent_frame(
        &h.state,
        &agent,
        json!({
            "kind": "file_update",
            "instanceId": "i1",
            "event": {"path": "/srv/app/config.yml", "op": "modify"},
        }),
    )
    .await;

    let frames = drain(&mut watcher_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "file_update");
    assert!(drain(&mut bystander_rx).is_empty());
}

// ==================== unknown frames ====================

#[tokio::test]
async fn unknown_kinds_are_dropped_without_replies() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    let (agent, mut agent_rx) = connect(&h.state, "t1", Role::Agent, None);

    handle_client_frame(&h.state, &client, json!({"kind": "yodel"})).await;
    handle_agent_frame(&h.state, &agent, json!({"no_kind": true})).await;

    assert!(drain(&mut client_rx).is_empty());
    assert!(drain(&mut agent_rx).is_empty());
}

#[tokio::test]
async fn hello_is_acknowledged_with_the_connection_id() {
    let h = harness();
    let (client, mut client_rx) = connect(&h.state, "t1", Role::Client, None);
    handle_client_frame(&h.state, &client, json!({"kind": "hello"})).await;

    let frames = drain(&mut client_rx);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "hello_ack");
    assert_eq!(frames[0]["connectionId"], client.id.to_string());
}
