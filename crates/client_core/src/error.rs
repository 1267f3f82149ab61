use thiserror::Error;

/// Call-boundary failures surfaced to the conversation layer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session expired; sign in again")]
    AuthExpired,
    #[error("request still unauthorized after credential refresh")]
    Unauthorized,
    #[error("server unreachable: {0}")]
    Connectivity(String),
    #[error("malformed data: {0}")]
    ProtocolDecode(String),
    #[error("real-time channel is not open")]
    ChannelUnavailable,
    #[error("server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("credential storage failed: {0:#}")]
    Storage(anyhow::Error),
}

impl ClientError {
    pub fn requires_reauth(&self) -> bool {
        matches!(self, ClientError::AuthExpired | ClientError::Unauthorized)
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, ClientError::Connectivity(_))
    }

    /// Text suitable for a user-visible notice.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::ServerRejected { message, .. } => message.clone(),
            ClientError::Connectivity(_) => {
                "Cannot reach the chat server; please retry later.".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
