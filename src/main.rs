use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use fleet_gateway::config::Config;
use fleet_gateway::gateway::{router, GatewayState};
use fleet_gateway::logging::init_logging;
use fleet_gateway::platform::{
    InMemoryInstanceDirectory, InMemoryServiceStore, InMemoryStatusCache, Platform,
    RecordingUpdateSink, UuidTokenService,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg.log_level)?;

    let instances = Arc::new(InMemoryInstanceDirectory::new());
    for (instance, tenant) in cfg.instance_pairs() {
        instances.insert(instance, tenant);
    }
    let platform = Platform {
        cache: Arc::new(InMemoryStatusCache::new()),
        instances,
        services: Arc::new(InMemoryServiceStore::new()),
        tokens: Arc::new(UuidTokenService::new()),
        updates: Arc::new(RecordingUpdateSink::new()),
    };

    let state = GatewayState::new(platform, cfg.status_cache_ttl(), cfg.agent_token_ttl());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    tracing::info!(target = "gateway", addr = %cfg.listen, "fleet-gateway listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
