//! Event router: immutable dispatch table from event type to handler

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::StreamError;
use crate::protocol::InboundEvent;

/// Handles one or more event types
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle a decoded event. Long-running work belongs to the reconcilers.
    async fn handle(&self, event: &InboundEvent) -> Result<(), StreamError>;
}

/// Builder for a [`Router`]
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl RouterBuilder {
    /// Route `event_type` to `handler`, replacing any earlier route
    pub fn route(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(event_type.into(), handler);
        self
    }

    /// Route several event types to the same handler
    pub fn routes(mut self, event_types: &[&str], handler: Arc<dyn EventHandler>) -> Self {
        for t in event_types {
            self.routes.insert((*t).to_string(), handler.clone());
        }
        self
    }

    /// Freeze the table
    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
        }
    }
}

/// Dispatch table built once at startup
pub struct Router {
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl Router {
    /// Start building a router
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Dispatch to the handler registered for the event's type
    pub async fn dispatch(&self, event: &InboundEvent) -> Result<(), StreamError> {
        match self.routes.get(&event.event_type) {
            Some(handler) => handler.handle(event).await,
            None => Err(StreamError::NoHandler(event.event_type.clone())),
        }
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
