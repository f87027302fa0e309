//! # Server Configuration
//!
//! Read once from the environment at startup. Runtime-tunable values
//! (diagnostic probe timeouts) live in the `panel_config` table instead
//! and are read through the store.

use std::net::SocketAddr;

/// Identity string stamped into `metadata.managedBy` on every service
/// this controller emits. Strict reconciliation only ever deletes
/// services carrying this marker.
pub const CONTROLLER_ID: &str = "flux-panel";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    /// Seconds between periodic reconcile passes; 0 disables the loop.
    pub reconcile_interval: u64,
    /// When set, reconciliation deletes managed services that are no
    /// longer desired. Off by default so foreign services on shared
    /// nodes survive.
    pub strict_reconcile: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = std::env::var("LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 6365)));
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:flux-panel.db?mode=rwc".to_string());
        let reconcile_interval = std::env::var("RECONCILE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);
        let strict_reconcile = std::env::var("STRICT_RECONCILE")
            .map(|s| {
                let s = s.to_ascii_lowercase();
                s == "true" || s == "1"
            })
            .unwrap_or(false);
        Self {
            listen_addr,
            database_url,
            reconcile_interval,
            strict_reconcile,
        }
    }
}
