use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{MessageId, MessagePayload, OnlineUser, UserId},
    error::FrameDecodeError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    pub content: String,
    pub client_message_id: MessageId,
}

/// Frames written to the real-time socket. Serialized with an `action` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum OutboundFrame {
    Connect {
        token: String,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    SendMessage {
        data: SendMessageData,
        timestamp: DateTime<Utc>,
    },
    Ping,
}

impl OutboundFrame {
    pub fn action(&self) -> &'static str {
        match self {
            OutboundFrame::Connect { .. } => "connect",
            OutboundFrame::SendMessage { .. } => "sendmessage",
            OutboundFrame::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NewMessage,
    UserJoined,
    UserLeft,
    Error,
}

impl EventKind {
    /// Maps every accepted wire spelling onto one kind.
    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "NEW_MESSAGE" | "message" => Some(EventKind::NewMessage),
            "USER_JOINED" | "user-joined" => Some(EventKind::UserJoined),
            "USER_LEFT" | "user-left" => Some(EventKind::UserLeft),
            "ERROR" | "error" => Some(EventKind::Error),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            EventKind::NewMessage => "NEW_MESSAGE",
            EventKind::UserJoined => "USER_JOINED",
            EventKind::UserLeft => "USER_LEFT",
            EventKind::Error => "ERROR",
        }
    }
}

/// Inbound frame after discriminator normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(MessagePayload),
    UserJoined(OnlineUser),
    UserLeft { user_id: UserId },
    ServerError { message: String },
    Unknown { kind: Option<String> },
}

impl InboundEvent {
    pub fn decode(text: &str) -> Result<Self, FrameDecodeError> {
        let Value::Object(mut frame) = serde_json::from_str::<Value>(text)? else {
            return Err(FrameDecodeError::NotAnObject);
        };

        let raw_kind = discriminator(&frame);
        let Some(kind) = raw_kind.as_deref().and_then(EventKind::from_wire) else {
            return Ok(InboundEvent::Unknown { kind: raw_kind });
        };

        match kind {
            EventKind::NewMessage => {
                let body = match frame.remove("data") {
                    Some(data @ Value::Object(_)) => data,
                    _ => Value::Object(frame),
                };
                parse_body(kind, body).map(InboundEvent::NewMessage)
            }
            EventKind::UserJoined => {
                let body = ["user", "data"]
                    .into_iter()
                    .find_map(|key| frame.remove(key).filter(Value::is_object))
                    .ok_or(FrameDecodeError::MissingField {
                        kind: kind.label(),
                        field: "user",
                    })?;
                parse_body(kind, body).map(InboundEvent::UserJoined)
            }
            EventKind::UserLeft => {
                let raw = frame
                    .remove("userId")
                    .filter(|value| !value.is_null())
                    .or_else(|| {
                        frame
                            .get_mut("data")
                            .and_then(Value::as_object_mut)
                            .and_then(|data| data.remove("userId"))
                    })
                    .ok_or(FrameDecodeError::MissingField {
                        kind: kind.label(),
                        field: "userId",
                    })?;
                parse_body(kind, raw).map(|user_id| InboundEvent::UserLeft { user_id })
            }
            EventKind::Error => {
                let message = frame
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified server error")
                    .to_string();
                Ok(InboundEvent::ServerError { message })
            }
        }
    }
}

fn discriminator(frame: &Map<String, Value>) -> Option<String> {
    ["action", "type"]
        .into_iter()
        .filter_map(|key| frame.get(key).and_then(Value::as_str))
        .find(|raw| !raw.is_empty())
        .map(str::to_string)
}

fn parse_body<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    body: Value,
) -> Result<T, FrameDecodeError> {
    serde_json::from_value(body).map_err(|source| FrameDecodeError::InvalidBody {
        kind: kind.label(),
        source,
    })
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
