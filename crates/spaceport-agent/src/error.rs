//! Event-stream error types

use thiserror::Error;

/// Errors raised by the event stream, its handlers and the backend client
#[derive(Debug, Error)]
pub enum StreamError {
    /// Dialing or reading/writing the connection failed
    #[error("connection error: {0}")]
    Connect(String),

    /// Token exchange failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The peer violated the subscription protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame or event payload didn't match its schema
    #[error("failed to decode {event_type}: {message}")]
    Decode {
        /// Event type (or "frame" for envelope failures)
        event_type: String,
        /// Decoder message
        message: String,
    },

    /// No handler registered for the event type
    #[error("no handler registered for {0}")]
    NoHandler(String),

    /// A domain handler failed
    #[error("handler for {event_type} failed: {source}")]
    Handler {
        /// Event type being handled
        event_type: String,
        /// Underlying error
        #[source]
        source: spaceport_common::Error,
    },

    /// Backend REST call failed
    #[error("backend request failed: {0}")]
    Backend(String),

    /// The outbound channel or writer task is gone
    #[error("stream channel closed")]
    ChannelClosed,
}

impl StreamError {
    /// Create a decode error for an event type
    pub fn decode(event_type: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            event_type: event_type.into(),
            message: message.to_string(),
        }
    }

    /// Wrap a domain error raised while handling `event_type`
    pub fn handler(event_type: impl Into<String>, source: impl Into<spaceport_common::Error>) -> Self {
        Self::Handler {
            event_type: event_type.into(),
            source: source.into(),
        }
    }

    /// Whether the session must be torn down and re-established
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Auth(_) | Self::Protocol(_) | Self::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_level_errors_keep_the_connection() {
        assert!(!StreamError::decode("projects.created", "missing field `slug`")
            .is_connection_fatal());
        assert!(!StreamError::NoHandler("widgets.created".to_string()).is_connection_fatal());
        assert!(StreamError::Connect("reset".to_string()).is_connection_fatal());
        assert!(StreamError::Protocol("subscription rejected".to_string()).is_connection_fatal());
    }

    #[test]
    fn display_names_event_type() {
        let err = StreamError::decode("addons.created", "missing field `oci_registry`");
        assert!(err.to_string().contains("addons.created"));

        let err = StreamError::handler(
            "projects.paused",
            spaceport_common::Error::internal("project acme not found"),
        );
        assert!(err.to_string().contains("projects.paused"));
    }
}
