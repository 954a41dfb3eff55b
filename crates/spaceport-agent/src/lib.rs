//! Spaceport agent: backend event stream and domain handlers
//!
//! The agent keeps one authenticated subscription to the backend's event
//! channel for this host cluster. Inbound events are acked, routed by type
//! and turned into `Project` and `Configuration` writes; the reconcilers
//! take it from there. A separate pinger reports liveness over HTTP.

#![deny(missing_docs)]

pub mod backend;
pub mod backlog;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod pinger;
pub mod protocol;
pub mod router;
pub mod token;
pub mod transport;

pub use backend::{BackendClient, ClusterPing, HttpBackendClient, ProjectStatusReport};
pub use config::StreamConfig;
pub use error::StreamError;
pub use handlers::{build_router, KubeSpecStore, SpecStore};
pub use pinger::Pinger;
pub use router::{EventHandler, Router};
pub use token::{OAuthClientCredentials, TokenSource};
pub use transport::{EventStream, StreamHandle, StreamState, WsConnector};
