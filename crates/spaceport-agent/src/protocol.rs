//! Wire protocol of the event stream
//!
//! Frames are JSON text messages. Outbound:
//! - subscribe: `{"command":"subscribe","identifier":"<json {channel,cluster_id}>"}`
//! - message: `{"command":"message","identifier":"...","data":"<json payload>"}`
//! - ack: `{"id":"<event id>"}`
//!
//! Inbound frames are either control frames, recognized by their top-level
//! `type` before any further decoding, or domain events. Domain events come
//! nested as `{"identifier":..., "message":{"id","type","payload"}}`; the flat
//! `{"id","type","payload"}` shape is accepted as well.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StreamError;

/// Subscription identity, fixed for the lifetime of a connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    /// Channel name
    pub channel: String,
    /// Cluster this agent runs in
    pub cluster_id: i64,
}

impl Identifier {
    /// JSON encoding used inside command frames
    pub fn encode(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(|e| StreamError::Protocol(e.to_string()))
    }
}

#[derive(Serialize)]
struct Command<'a> {
    command: &'a str,
    identifier: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
}

/// Build the subscribe frame
pub fn subscribe_frame(identifier: &str) -> Result<String, StreamError> {
    encode(&Command {
        command: "subscribe",
        identifier,
        data: None,
    })
}

/// Build a generic outbound message frame carrying `payload`
pub fn message_frame(identifier: &str, payload: &serde_json::Value) -> Result<String, StreamError> {
    let data = serde_json::to_string(payload).map_err(|e| StreamError::Protocol(e.to_string()))?;
    encode(&Command {
        command: "message",
        identifier,
        data: Some(data),
    })
}

/// Build the acknowledgement frame for an event id
pub fn ack_frame(id: &str) -> Result<String, StreamError> {
    encode(&serde_json::json!({ "id": id }))
}

fn encode(value: &impl Serialize) -> Result<String, StreamError> {
    serde_json::to_string(value).map_err(|e| StreamError::Protocol(e.to_string()))
}

/// Protocol frames that carry no domain event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    /// Connection keep-alive
    Ping,
    /// Server greeting after connect
    Welcome,
    /// Subscription accepted
    ConfirmSubscription,
    /// Subscription refused
    RejectSubscription,
    /// Server asks the client to go away
    Disconnect {
        /// Reason given by the server
        reason: Option<String>,
    },
}

/// A decoded domain event
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct InboundEvent {
    /// Event id, echoed in the ack
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Event type, e.g. `projects.created`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InboundEvent {
    /// Decode the payload into the schema for this event type
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, StreamError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| StreamError::decode(&self.event_type, e))
    }
}

/// A classified inbound frame
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Protocol-level frame
    Control(ControlFrame),
    /// Domain event to ack and dispatch
    Event(InboundEvent),
}

#[derive(Deserialize)]
struct Peek {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Nested { message: InboundEvent },
    Flat(InboundEvent),
}

/// Classify a text frame
pub fn parse_frame(text: &str) -> Result<Inbound, StreamError> {
    let peek: Peek =
        serde_json::from_str(text).map_err(|e| StreamError::decode("frame", e))?;

    let control = match peek.kind.as_deref() {
        Some("ping") => Some(ControlFrame::Ping),
        Some("welcome") => Some(ControlFrame::Welcome),
        Some("confirm_subscription") => Some(ControlFrame::ConfirmSubscription),
        Some("reject_subscription") => Some(ControlFrame::RejectSubscription),
        Some("disconnect") => Some(ControlFrame::Disconnect {
            reason: peek.reason,
        }),
        _ => None,
    };
    if let Some(control) = control {
        return Ok(Inbound::Control(control));
    }

    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| StreamError::decode("frame", e))?;
    Ok(Inbound::Event(match envelope {
        Envelope::Nested { message } => message,
        Envelope::Flat(event) => event,
    }))
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier() -> String {
        Identifier {
            channel: "ClusterChannel".to_string(),
            cluster_id: 42,
        }
        .encode()
        .unwrap()
    }

    mod outbound {
        use super::*;

        #[test]
        fn subscribe_carries_json_encoded_identifier() {
            let frame: serde_json::Value =
                serde_json::from_str(&subscribe_frame(&identifier()).unwrap()).unwrap();
            assert_eq!(frame["command"], "subscribe");
            assert!(frame.get("data").is_none());

            let ident: Identifier =
                serde_json::from_str(frame["identifier"].as_str().unwrap()).unwrap();
            assert_eq!(ident.channel, "ClusterChannel");
            assert_eq!(ident.cluster_id, 42);
        }

        #[test]
        fn message_data_is_a_json_string() {
            let payload = serde_json::json!({"status": "provisioned"});
            let frame: serde_json::Value =
                serde_json::from_str(&message_frame(&identifier(), &payload).unwrap()).unwrap();
            assert_eq!(frame["command"], "message");
            let data: serde_json::Value =
                serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
            assert_eq!(data, payload);
        }

        #[test]
        fn ack_echoes_id() {
            assert_eq!(ack_frame("evt-1").unwrap(), r#"{"id":"evt-1"}"#);
        }
    }

    mod inbound {
        use super::*;

        #[test]
        fn control_frames_are_recognized_by_type() {
            assert_eq!(
                parse_frame(r#"{"type":"ping","message":1700000000}"#).unwrap(),
                Inbound::Control(ControlFrame::Ping)
            );
            assert_eq!(
                parse_frame(r#"{"type":"welcome"}"#).unwrap(),
                Inbound::Control(ControlFrame::Welcome)
            );
            assert_eq!(
                parse_frame(r#"{"identifier":"x","type":"confirm_subscription"}"#).unwrap(),
                Inbound::Control(ControlFrame::ConfirmSubscription)
            );
            assert_eq!(
                parse_frame(r#"{"type":"disconnect","reason":"server_restart","reconnect":true}"#)
                    .unwrap(),
                Inbound::Control(ControlFrame::Disconnect {
                    reason: Some("server_restart".to_string())
                })
            );
        }

        #[test]
        fn nested_envelope_decodes() {
            let text = r#"{"identifier":"x","message":{"id":"e1","type":"projects.created","payload":{"slug":"acme"}}}"#;
            match parse_frame(text).unwrap() {
                Inbound::Event(e) => {
                    assert_eq!(e.id, "e1");
                    assert_eq!(e.event_type, "projects.created");
                    assert_eq!(e.payload["slug"], "acme");
                }
                other => panic!("expected event, got {other:?}"),
            }
        }

        #[test]
        fn flat_envelope_and_numeric_id_decode() {
            let text = r#"{"id":17,"type":"addons.delete","payload":{"name":"pg"}}"#;
            match parse_frame(text).unwrap() {
                Inbound::Event(e) => {
                    assert_eq!(e.id, "17");
                    assert_eq!(e.event_type, "addons.delete");
                }
                other => panic!("expected event, got {other:?}"),
            }
        }

        #[test]
        fn malformed_frames_fail_closed() {
            assert!(matches!(
                parse_frame("not json"),
                Err(StreamError::Decode { .. })
            ));
            assert!(matches!(
                parse_frame(r#"{"message":{"type":"projects.created"}}"#),
                Err(StreamError::Decode { .. })
            ));
        }

        #[test]
        fn payload_decode_reports_event_type() {
            #[derive(Debug, Deserialize)]
            #[allow(dead_code)]
            struct NeedsSlug {
                slug: String,
            }
            let event = InboundEvent {
                id: "1".to_string(),
                event_type: "projects.paused".to_string(),
                payload: serde_json::json!({"id": 7}),
            };
            match event.decode_payload::<NeedsSlug>() {
                Err(StreamError::Decode { event_type, .. }) => {
                    assert_eq!(event_type, "projects.paused")
                }
                other => panic!("expected decode error, got {other:?}"),
            }
        }
    }
}
