//! In-memory registry of open WebSocket connections and their subscription
//! tables, grouped by tenant.
//!
//! The `ConnectionManager` is the single source of truth for connection
//! membership, the pending-request correlation table, log-stream
//! subscriptions, and file-watch subscriber sets. All mutation goes through
//! its methods; every table sits behind one mutex so routing can look up
//! and delete in a single step. Correlation is purely in-memory: an
//! in-flight task does not survive a process restart and must be retried by
//! the caller.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Agent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Agent => "agent",
        }
    }
}

/// Authenticated user identity attached to a client connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub email: Option<String>,
}

#[derive(Debug, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Handle for pushing frames into a connection's send buffer.
///
/// The receiving half is owned by the socket's writer task; once that task
/// ends, sends fail synchronously, which is how dead sockets are detected.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<String>,
}

impl OutboundSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: &Value) -> Result<(), ConnectionClosed> {
        self.tx
            .send(frame.to_string())
            .map_err(|_| ConnectionClosed)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A live WebSocket session, exclusively owned by the manager for its
/// lifetime: created on successful upgrade, destroyed on socket close.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub tenant: String,
    pub role: Role,
    pub session: Option<Session>,
    sender: OutboundSender,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Connection {
    pub fn new(
        tenant: impl Into<String>,
        role: Role,
        session: Option<Session>,
        sender: OutboundSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::generate(),
            tenant: tenant.into(),
            role,
            session,
            sender,
            last_activity: Mutex::new(Utc::now()),
        })
    }

    pub fn send(&self, frame: &Value) -> Result<(), ConnectionClosed> {
        self.sender.send(frame)
    }

    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Last-seen timestamp, read by the idle-connection reaper.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }
}

/// An in-flight task awaiting an agent response to route back to a client.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client: Arc<Connection>,
    pub kind: TaskKind,
    pub created_at: DateTime<Utc>,
}

/// A client's interest in a byte range of a remote log file. The stream id
/// is derived deterministically so a second subscriber reuses the entry by
/// rewiring `client` instead of creating a duplicate stream.
#[derive(Debug, Clone)]
pub struct LogStreamSubscription {
    pub stream_id: String,
    pub path: String,
    pub client: Arc<Connection>,
    pub start_offset: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Default)]
struct Tables {
    tenants: HashMap<String, HashMap<ConnectionId, Arc<Connection>>>,
    pending: HashMap<String, PendingRequest>,
    log_streams: HashMap<String, LogStreamSubscription>,
    file_watches: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct ConnectionManager {
    tables: Mutex<Tables>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    // -- connection membership ----------------------------------------------

    pub fn register(&self, conn: Arc<Connection>) {
        let mut tables = self.tables.lock();
        tables
            .tenants
            .entry(conn.tenant.clone())
            .or_default()
            .insert(conn.id, conn);
    }

    /// Remove a connection and cascade-cleanup everything it owns: pending
    /// requests, log streams, and file-watch memberships. No dangling
    /// references survive a disconnect.
    pub fn remove(&self, conn: &Connection) {
        let mut tables = self.tables.lock();
        if let Some(set) = tables.tenants.get_mut(&conn.tenant) {
            set.remove(&conn.id);
            if set.is_empty() {
                tables.tenants.remove(&conn.tenant);
            }
        }
        tables.pending.retain(|_, p| p.client.id != conn.id);
        tables.log_streams.retain(|_, s| s.client.id != conn.id);
        tables.file_watches.retain(|_, subscribers| {
            subscribers.remove(&conn.id);
            !subscribers.is_empty()
        });
    }

    /// Hook for the external heartbeat/reaper: record frame activity.
    pub fn update_activity(&self, conn: &Connection) {
        conn.touch();
    }

    pub fn connections(&self, tenant: &str) -> Vec<Arc<Connection>> {
        self.tables
            .lock()
            .tenants
            .get(tenant)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clients(&self, tenant: &str) -> Vec<Arc<Connection>> {
        self.connections_with_role(tenant, Role::Client)
    }

    pub fn agents(&self, tenant: &str) -> Vec<Arc<Connection>> {
        self.connections_with_role(tenant, Role::Agent)
    }

    fn connections_with_role(&self, tenant: &str, role: Role) -> Vec<Arc<Connection>> {
        self.tables
            .lock()
            .tenants
            .get(tenant)
            .map(|set| {
                set.values()
                    .filter(|c| c.role == role)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn connection(&self, tenant: &str, id: ConnectionId) -> Option<Arc<Connection>> {
        self.tables
            .lock()
            .tenants
            .get(tenant)
            .and_then(|set| set.get(&id))
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.tables
            .lock()
            .tenants
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn tenant_count(&self) -> usize {
        self.tables.lock().tenants.len()
    }

    // -- pending-request correlation ----------------------------------------

    /// Insert a pending request. Task ids are caller-unique, so an existing
    /// entry for the same id is overwritten (last writer wins).
    pub fn add_pending_request(&self, task_id: &str, client: Arc<Connection>, kind: TaskKind) {
        self.tables.lock().pending.insert(
            task_id.to_string(),
            PendingRequest {
                client,
                kind,
                created_at: Utc::now(),
            },
        );
    }

    pub fn get_pending_request(&self, task_id: &str) -> Option<PendingRequest> {
        self.tables.lock().pending.get(task_id).cloned()
    }

    pub fn remove_pending_request(&self, task_id: &str) -> Option<PendingRequest> {
        self.tables.lock().pending.remove(task_id)
    }

    /// Look up and consume the pending request for `task_id` in one step,
    /// then send `frame` to its client. Returns false when no entry exists
    /// (already timed out, client gone, or a duplicate response) — an
    /// expected race, not an error.
    pub fn route_response_to_client(&self, task_id: &str, frame: &Value) -> bool {
        let pending = self.tables.lock().pending.remove(task_id);
        let Some(pending) = pending else {
            tracing::warn!(
                target = "gateway::route",
                task_id = %task_id,
                "could not route response: no pending request"
            );
            return false;
        };
        if let Err(error) = pending.client.send(frame) {
            tracing::warn!(
                target = "gateway::route",
                task_id = %task_id,
                connection = %pending.client.id,
                error = %error,
                "pending client went away before response delivery"
            );
        }
        true
    }

    // -- log-stream subscriptions -------------------------------------------

    pub fn add_log_stream(&self, sub: LogStreamSubscription) {
        self.tables
            .lock()
            .log_streams
            .insert(sub.stream_id.clone(), sub);
    }

    pub fn get_log_stream(&self, stream_id: &str) -> Option<LogStreamSubscription> {
        self.tables.lock().log_streams.get(stream_id).cloned()
    }

    pub fn remove_log_stream(&self, stream_id: &str) -> Option<LogStreamSubscription> {
        self.tables.lock().log_streams.remove(stream_id)
    }

    /// Drop every subscription for `path` owned by `owner`.
    pub fn remove_log_streams_by_path(&self, path: &str, owner: ConnectionId) -> usize {
        let mut tables = self.tables.lock();
        let before = tables.log_streams.len();
        tables
            .log_streams
            .retain(|_, s| !(s.path == path && s.client.id == owner));
        before - tables.log_streams.len()
    }

    /// Rewire an existing stream to a new subscriber socket. Returns false
    /// when no stream exists for the id; the caller must then create one.
    pub fn update_log_stream_client(&self, stream_id: &str, client: Arc<Connection>) -> bool {
        match self.tables.lock().log_streams.get_mut(stream_id) {
            Some(sub) => {
                sub.client = client;
                true
            }
            None => false,
        }
    }

    // -- file-watch subscriptions -------------------------------------------

    pub fn add_file_watch(&self, watch_key: &str, id: ConnectionId) {
        self.tables
            .lock()
            .file_watches
            .entry(watch_key.to_string())
            .or_default()
            .insert(id);
    }

    pub fn remove_file_watch(&self, watch_key: &str, id: ConnectionId) {
        let mut tables = self.tables.lock();
        if let Some(subscribers) = tables.file_watches.get_mut(watch_key) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                tables.file_watches.remove(watch_key);
            }
        }
    }

    pub fn file_watch_subscribers(&self, watch_key: &str) -> Vec<ConnectionId> {
        self.tables
            .lock()
            .file_watches
            .get(watch_key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Deterministic stream id for a log subscription. Two clients asking for
/// the same (tenant, path, offset, limit) land on the same stream and share
/// one subscription.
pub fn log_stream_id(
    tenant: &str,
    path: &str,
    start_offset: Option<i64>,
    limit: Option<u32>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(path.as_bytes());
    hasher.update(b"\x1f");
    match start_offset {
        Some(offset) => hasher.update(offset.to_string().as_bytes()),
        None => hasher.update(b"-"),
    }
    hasher.update(b"\x1f");
    match limit {
        Some(limit) => hasher.update(limit.to_string().as_bytes()),
        None => hasher.update(b"-"),
    }
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    format!("ls_{}", &hex[..16])
}

/// Key for filesystem-change subscriptions.
pub fn watch_key(instance_id: &str, path: &str) -> String {
    format!("{instance_id}:{path}")
}
