//! Fan-out broadcast to every dashboard connection of a tenant.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::connections::ConnectionManager;
use crate::platform::StatusCache;

/// Cache key for the most recent broadcast payload of a tenant.
pub fn status_cache_key(tenant: &str) -> String {
    format!("cluster:{tenant}:status")
}

pub struct ClientNotifier {
    manager: Arc<ConnectionManager>,
    cache: Arc<dyn StatusCache>,
    cache_ttl: Duration,
}

impl ClientNotifier {
    pub fn new(
        manager: Arc<ConnectionManager>,
        cache: Arc<dyn StatusCache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            manager,
            cache,
            cache_ttl,
        }
    }

    /// Push `frame` to every open client connection of `tenant`, then cache
    /// it as the tenant's last-known status so a later subscribe can replay
    /// it. One bad connection never blocks delivery to the rest. Returns
    /// the number of successful sends.
    pub async fn broadcast(&self, tenant: &str, frame: &Value) -> usize {
        let clients = self.manager.clients(tenant);
        let mut sent = 0usize;
        for conn in &clients {
            if !conn.is_open() {
                tracing::debug!(
                    target = "gateway::notify",
                    tenant = %tenant,
                    connection = %conn.id,
                    "skipping closed client connection"
                );
                continue;
            }
            match conn.send(frame) {
                Ok(()) => sent += 1,
                Err(error) => {
                    tracing::warn!(
                        target = "gateway::notify",
                        tenant = %tenant,
                        connection = %conn.id,
                        error = %error,
                        "broadcast send failed"
                    );
                }
            }
        }
        tracing::debug!(
            target = "gateway::notify",
            tenant = %tenant,
            sent,
            clients = clients.len(),
            "broadcast delivered"
        );

        if let Err(error) = self
            .cache
            .put(&status_cache_key(tenant), frame.clone(), self.cache_ttl)
            .await
        {
            tracing::warn!(
                target = "gateway::notify",
                tenant = %tenant,
                error = %error,
                "failed to cache broadcast payload"
            );
        }
        sent
    }
}
