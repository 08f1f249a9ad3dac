use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "fleet-gateway")]
#[command(about = "Control-plane WebSocket gateway for cluster dashboards and agents")]
pub struct Config {
    /// Address the gateway listens on.
    #[arg(long, default_value = "127.0.0.1:8440")]
    pub listen: String,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Seconds a cached tenant status snapshot stays replayable.
    #[arg(long, default_value_t = 300)]
    pub status_cache_ttl_secs: u64,

    /// Seconds a minted agent-access token stays valid.
    #[arg(long, default_value_t = 900)]
    pub agent_token_ttl_secs: u64,

    /// Seed the instance directory: repeatable `instanceId=tenantId`.
    #[arg(long = "instance")]
    pub instances: Vec<String>,
}

impl Config {
    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_secs)
    }

    pub fn agent_token_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_token_ttl_secs)
    }

    pub fn instance_pairs(&self) -> Vec<(String, String)> {
        self.instances
            .iter()
            .filter_map(|entry| {
                let (instance, tenant) = entry.split_once('=')?;
                let instance = instance.trim();
                let tenant = tenant.trim();
                if instance.is_empty() || tenant.is_empty() {
                    return None;
                }
                Some((instance.to_string(), tenant.to_string()))
            })
            .collect()
    }
}
