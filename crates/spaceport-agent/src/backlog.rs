//! Outbound backlog kept while the stream is not subscribed

use std::collections::VecDeque;

use tracing::debug;

/// FIFO queue of outbound payloads awaiting a live subscription.
///
/// Bounded only by memory. When disabled, pushed payloads are discarded.
#[derive(Debug, Default)]
pub struct Backlog {
    enabled: bool,
    queue: VecDeque<serde_json::Value>,
}

impl Backlog {
    /// Create a backlog; `enabled = false` drops everything pushed
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            queue: VecDeque::new(),
        }
    }

    /// Queue a payload (or drop it when disabled)
    pub fn push(&mut self, payload: serde_json::Value) {
        if self.enabled {
            self.queue.push_back(payload);
        } else {
            debug!("backlog disabled, dropping outbound message");
        }
    }

    /// Take every queued payload in enqueue order
    pub fn drain(&mut self) -> Vec<serde_json::Value> {
        self.queue.drain(..).collect()
    }

    /// Number of queued payloads
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
