//! Feed server and client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broadcast server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Bind address
    pub addr: String,
    /// Bind port (0 picks an ephemeral port)
    pub port: u16,
    /// Upper bound on any single socket operation
    pub io_timeout_ms: u64,
    /// Interval between pings to each subscriber
    pub ping_interval_ms: u64,
    /// Silence after which a subscriber is evicted
    pub client_timeout_ms: u64,
    /// Per-subscriber outbound queue capacity
    pub queue: usize,
    /// Maximum concurrently served connections
    pub workers: usize,
    /// Messages kept for resuming subscribers
    pub max_retained: usize,
    /// Largest websocket frame accepted from a client
    pub max_frame_size: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: 9642,
            io_timeout_ms: 5_000,
            ping_interval_ms: 5_000,
            client_timeout_ms: 15_000,
            queue: 100,
            workers: 100,
            max_retained: 1024,
            max_frame_size: 64 * 1024,
        }
    }
}

impl BroadcasterConfig {
    /// Parse from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}

/// Broadcast client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastClientConfig {
    /// Feed endpoint, e.g. `ws://localhost:9642/feed`
    pub url: String,
    /// Total time allowed for the initial connect, retries included
    pub timeout_ms: u64,
    /// Upper bound on a single connect/handshake/write
    pub io_timeout_ms: u64,
    /// Server silence after which the client reconnects
    pub server_timeout_ms: u64,
    /// First retry delay; doubles up to `max_backoff_ms`
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Buffered messages between the connection task and the caller
    pub delivery_buffer: usize,
    /// Recent message digests kept to detect equivocating re-deliveries
    pub duplicate_window: usize,
}

impl Default for BroadcastClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9642/feed".to_string(),
            timeout_ms: 20_000,
            io_timeout_ms: 5_000,
            server_timeout_ms: 15_000,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            delivery_buffer: 1000,
            duplicate_window: 1024,
        }
    }
}

impl BroadcastClientConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
