//! Event-stream configuration

use std::time::Duration;

use spaceport_common::retry::RetryConfig;

use crate::protocol::Identifier;

/// Default capacity of the outbound message channel
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Configuration for the event stream
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream URL (e.g., "wss://api.spaceport.dev/cable")
    pub url: String,
    /// Channel to subscribe to
    pub channel: String,
    /// Cluster identifier sent in the subscription
    pub cluster_id: i64,
    /// Queue outbound messages while disconnected instead of dropping them
    pub use_backlog: bool,
    /// Capacity of the outbound and wire channels
    pub outbound_capacity: usize,
    /// How long to wait for `confirm_subscription` before reconnecting
    pub subscribe_timeout: Duration,
    /// How long to wait for the peer's close frame on shutdown
    pub close_timeout: Duration,
    /// Reconnect backoff
    pub reconnect: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/cable".to_string(),
            channel: "ClusterChannel".to_string(),
            cluster_id: 0,
            use_backlog: true,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            subscribe_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
            reconnect: RetryConfig::reconnect(),
        }
    }
}

impl StreamConfig {
    /// Subscription identity for this configuration
    pub fn identifier(&self) -> Identifier {
        Identifier {
            channel: self.channel.clone(),
            cluster_id: self.cluster_id,
        }
    }
}
