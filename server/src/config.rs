//! Startup configuration. Values are fixed for the lifetime of a running
//! server; nothing here is renegotiated at runtime.

use crate::error::ServerError;
use realm_shared::{DEFAULT_PORT, WORLD_HEIGHT, WORLD_WIDTH};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// ~60 Hz by default.
    pub tick_interval: Duration,
    pub max_sessions: usize,
    /// How long a deposited handoff waits for its connection.
    pub handoff_timeout: Duration,
    /// Only this peer may deposit handoff info.
    pub trusted_center: IpAddr,
    pub world_width: f32,
    pub world_height: f32,
    /// Ticks between debug summaries.
    pub stats_interval_ticks: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            tick_interval: Duration::from_millis(16),
            max_sessions: 1024,
            handoff_timeout: Duration::from_secs(120),
            trusted_center: IpAddr::V4(Ipv4Addr::LOCALHOST),
            world_width: WORLD_WIDTH,
            world_height: WORLD_HEIGHT,
            stats_interval_ticks: 60,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick_interval.is_zero() {
            return Err(ServerError::Config("tick interval must be non-zero".into()));
        }
        if self.max_sessions == 0 {
            return Err(ServerError::Config("max sessions must be at least 1".into()));
        }
        if self.stats_interval_ticks == 0 {
            return Err(ServerError::Config("stats interval must be non-zero".into()));
        }
        Ok(())
    }
}
