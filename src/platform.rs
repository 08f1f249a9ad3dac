//! External collaborators consumed by the routing core, as narrow traits.
//!
//! Persistent storage, the key-value status cache, and token
//! issuance/verification all live outside this crate in production; the
//! in-memory implementations here back the default binary wiring and the
//! test suites.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

/// Key-value store holding the last broadcast payload per tenant, with
/// expiry. Written by the notifier, replayed on client subscribe.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;
}

/// Lookup of an instance's owning tenant, backed by the relational store.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn owning_tenant(&self, instance_id: &str) -> Result<Option<String>>;
}

/// Service records derived from successful deploy / service-removal
/// responses.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn upsert_service(&self, tenant: &str, instance_id: &str, name: &str) -> Result<()>;
    async fn remove_service(&self, tenant: &str, instance_id: &str, name: &str) -> Result<()>;
}

/// Scope carried by an agent-access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub tenant: String,
    pub instance_id: Option<String>,
    pub user_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Token issuance and verification (JWT service in production).
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn mint(&self, claims: TokenClaims) -> Result<String>;
    async fn verify(&self, token: &str) -> Result<TokenClaims>;
}

/// Processes agent status reports that carry an instance id (persists or
/// derives instance state) before the raw report is fanned out.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn process_update(&self, tenant: &str, instance_id: &str, report: &Value) -> Result<()>;
}

/// Bundle of collaborator handles threaded through the gateway.
#[derive(Clone)]
pub struct Platform {
    pub cache: Arc<dyn StatusCache>,
    pub instances: Arc<dyn InstanceDirectory>,
    pub services: Arc<dyn ServiceStore>,
    pub tokens: Arc<dyn TokenService>,
    pub updates: Arc<dyn UpdateSink>,
}

impl Platform {
    /// Fully in-memory wiring, used by the binary default and tests.
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(InMemoryStatusCache::new()),
            instances: Arc::new(InMemoryInstanceDirectory::new()),
            services: Arc::new(InMemoryServiceStore::new()),
            tokens: Arc::new(UuidTokenService::new()),
            updates: Arc::new(RecordingUpdateSink::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStatusCache {
    entries: Mutex<HashMap<String, (Value, Instant)>>,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusCache for InMemoryStatusCache {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryInstanceDirectory {
    owners: Mutex<HashMap<String, String>>,
}

impl InMemoryInstanceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance_id: impl Into<String>, tenant: impl Into<String>) {
        self.owners.lock().insert(instance_id.into(), tenant.into());
    }
}

#[async_trait]
impl InstanceDirectory for InMemoryInstanceDirectory {
    async fn owning_tenant(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self.owners.lock().get(instance_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryServiceStore {
    records: Mutex<HashSet<(String, String, String)>>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> Vec<(String, String, String)> {
        let mut records: Vec<_> = self.records.lock().iter().cloned().collect();
        records.sort();
        records
    }
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn upsert_service(&self, tenant: &str, instance_id: &str, name: &str) -> Result<()> {
        self.records.lock().insert((
            tenant.to_string(),
            instance_id.to_string(),
            name.to_string(),
        ));
        Ok(())
    }

    async fn remove_service(&self, tenant: &str, instance_id: &str, name: &str) -> Result<()> {
        self.records.lock().remove(&(
            tenant.to_string(),
            instance_id.to_string(),
            name.to_string(),
        ));
        Ok(())
    }
}

/// Opaque token issuer: tokens are random ids resolved against an issued
/// table, checked for expiry on verification.
#[derive(Default)]
pub struct UuidTokenService {
    issued: Mutex<HashMap<String, TokenClaims>>,
}

impl UuidTokenService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenService for UuidTokenService {
    async fn mint(&self, claims: TokenClaims) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        self.issued.lock().insert(token.clone(), claims);
        Ok(token)
    }

    async fn verify(&self, token: &str) -> Result<TokenClaims> {
        let claims = match self.issued.lock().get(token) {
            Some(claims) => claims.clone(),
            None => bail!("unknown token"),
        };
        if claims.expires_at <= Utc::now() {
            bail!("token expired");
        }
        Ok(claims)
    }
}

/// Update sink that records what it was given; stands in for the
/// instance-state pipeline.
#[derive(Default)]
pub struct RecordingUpdateSink {
    seen: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingUpdateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<(String, String, Value)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl UpdateSink for RecordingUpdateSink {
    async fn process_update(&self, tenant: &str, instance_id: &str, report: &Value) -> Result<()> {
        self.seen.lock().push((
            tenant.to_string(),
            instance_id.to_string(),
            report.clone(),
        ));
        Ok(())
    }
}
