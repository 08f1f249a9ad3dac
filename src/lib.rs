//! Control-plane WebSocket gateway for a multi-tenant deployment platform.
//!
//! Multiplexes dashboard (client) and remote-agent connections per cluster,
//! routes correlated request/response traffic between them, manages
//! ephemeral log-stream and file-watch subscriptions, and normalizes
//! agent-side error reports into a small taxonomy dashboards understand.

pub mod agent_handler;
pub mod client_handler;
pub mod config;
pub mod connections;
pub mod errors;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod platform;
pub mod protocol;
