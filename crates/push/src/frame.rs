//! JSON frames exchanged over the push channel: `{"event": ..., "data": ...}`.

use pairlink_api::StatusData;
use pairlink_core::state::ConnectionState;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::PushError;

pub const AUTH: &str = "auth";
pub const JOIN_ROOM: &str = "join-room";
pub const STATUS_UPDATE: &str = "whatsapp-status-update";
pub const CONNECT_ERROR: &str = "connect_error";
pub const DISCONNECT: &str = "disconnect";

/// Close reason the server uses when it deliberately drops a client.
pub const SERVER_DISCONNECT_REASON: &str = "io server disconnect";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn auth(token: &str) -> Self {
        Self {
            event: AUTH.to_string(),
            data: json!({ "token": token }),
        }
    }

    pub fn join_room(user_id: &str) -> Self {
        Self {
            event: JOIN_ROOM.to_string(),
            data: Value::String(user_id.to_string()),
        }
    }

    pub fn to_text(&self) -> Result<String, PushError> {
        serde_json::to_string(self).map_err(|e| PushError::Protocol(e.to_string()))
    }
}

/// Everything that can happen to a push channel, as one exhaustive union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Opened { user_id: String },
    Closed { server_initiated: bool, reason: String },
    AuthFailed { message: String },
    StatusUpdate(ConnectionState),
}

impl PushEvent {
    pub fn closed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::Closed {
            server_initiated: reason == SERVER_DISCONNECT_REASON,
            reason,
        }
    }
}

/// Decode an inbound text frame. Events the engine does not consume yield
/// `Ok(None)`.
pub fn decode(text: &str) -> Result<Option<PushEvent>, PushError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| PushError::Protocol(e.to_string()))?;

    let event = match frame.event.as_str() {
        STATUS_UPDATE => {
            let data: StatusData = serde_json::from_value(frame.data)
                .map_err(|e| PushError::Protocol(format!("{STATUS_UPDATE}: {e}")))?;
            PushEvent::StatusUpdate(data.to_proposal())
        }
        DISCONNECT => PushEvent::closed(text_field(&frame.data, "reason")),
        CONNECT_ERROR => {
            let message = text_field(&frame.data, "message");
            if message.contains("Authentication") {
                PushEvent::AuthFailed { message }
            } else {
                PushEvent::Closed {
                    server_initiated: false,
                    reason: message,
                }
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Accepts either `{"<key>": "..."}` or a bare string payload.
fn text_field(data: &Value, key: &str) -> String {
    match data {
        Value::String(text) => text.clone(),
        other => other
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pairlink_core::state::Phase;
    use pairlink_test_support::fixtures;

    #[test]
    fn status_update_becomes_proposal() {
        let event = decode(&fixtures::push_frame("status-update-open.json"))
            .unwrap()
            .unwrap();
        assert_matches!(event, PushEvent::StatusUpdate(state) if state.phase == Phase::Open);
    }

    #[test]
    fn server_disconnect_is_terminal_close() {
        let event = decode(&fixtures::push_frame("server-disconnect.json"))
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            PushEvent::Closed {
                server_initiated: true,
                reason: SERVER_DISCONNECT_REASON.to_string()
            }
        );
    }

    #[test]
    fn transport_disconnect_is_not_server_initiated() {
        let event = decode(r#"{"event":"disconnect","data":"transport close"}"#)
            .unwrap()
            .unwrap();
        assert_matches!(event, PushEvent::Closed { server_initiated: false, .. });
    }

    #[test]
    fn connect_error_mentioning_authentication_is_auth_failure() {
        let event = decode(&fixtures::push_frame("connect-error-auth.json"))
            .unwrap()
            .unwrap();
        assert_matches!(event, PushEvent::AuthFailed { .. });

        let event = decode(r#"{"event":"connect_error","data":{"message":"xhr poll error"}}"#)
            .unwrap()
            .unwrap();
        assert_matches!(event, PushEvent::Closed { server_initiated: false, .. });
    }

    #[test]
    fn unknown_events_are_ignored() {
        assert_eq!(decode(r#"{"event":"new-message","data":{}}"#).unwrap(), None);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert_matches!(decode("not json"), Err(PushError::Protocol(_)));
    }

    #[test]
    fn outbound_frames_serialize() {
        assert_eq!(
            Frame::join_room("user-1").to_text().unwrap(),
            r#"{"event":"join-room","data":"user-1"}"#
        );
        assert_eq!(
            Frame::auth("tok").to_text().unwrap(),
            r#"{"event":"auth","data":{"token":"tok"}}"#
        );
    }
}
