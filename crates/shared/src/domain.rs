use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Server ids arrive as JSON strings or integers depending on the backing table.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(match RawId::deserialize(deserializer)? {
                    RawId::Text(text) => Self(text),
                    RawId::Int(value) => Self(value.to_string()),
                })
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

const TEMP_ID_PREFIX: &str = "temp-";
const LOCAL_ID_PREFIX: &str = "local-";

impl MessageId {
    /// Id for an optimistic entry; also sent as the correlation id of the outbound frame.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Id for a server message that arrived without one.
    pub fn local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

/// Durable credential slots. Keys are fixed and shared by every store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenSlot {
    Access,
    Identity,
    Refresh,
}

impl TokenSlot {
    pub const ALL: [TokenSlot; 3] = [TokenSlot::Access, TokenSlot::Identity, TokenSlot::Refresh];

    pub fn storage_key(self) -> &'static str {
        match self {
            TokenSlot::Access => "chat_token",
            TokenSlot::Identity => "id_token",
            TokenSlot::Refresh => "refresh_token",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: String,
    pub identity_token: String,
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("identity_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    pub username: String,
}

/// One entry of the rendered message sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_temp: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl Message {
    pub fn optimistic(
        id: MessageId,
        content: impl Into<String>,
        author: &UserIdentity,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            content: content.into(),
            sender_id: Some(author.id.clone()),
            sender: Some(SenderRef {
                username: author.username.clone(),
            }),
            timestamp: Some(timestamp),
            is_temp: true,
            error: false,
        }
    }
}

/// Message as the gateway sends it: every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub sender: Option<SenderRef>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_message_id: Option<MessageId>,
}

impl MessagePayload {
    pub fn into_message(self) -> Message {
        let id = self
            .id
            .or(self.client_message_id)
            .unwrap_or_else(MessageId::local);
        Message {
            id,
            content: self.content.unwrap_or_default(),
            sender_id: self.sender_id,
            sender: self.sender,
            timestamp: self.timestamp,
            is_temp: false,
            error: false,
        }
    }

    /// Server-confirmed version of an optimistic entry. Fields the server
    /// omitted keep the optimistic values, including the temporary id.
    pub fn confirm(self, pending: &Message) -> Message {
        Message {
            id: self.id.unwrap_or_else(|| pending.id.clone()),
            content: self.content.unwrap_or_else(|| pending.content.clone()),
            sender_id: self.sender_id.or_else(|| pending.sender_id.clone()),
            sender: self.sender.or_else(|| pending.sender.clone()),
            timestamp: self.timestamp.or(pending.timestamp),
            is_temp: false,
            error: false,
        }
    }
}
