use std::sync::Arc;

use serde::Serialize;
use shared::domain::{Message, MessagePayload, OnlineUser};
use tracing::debug;

use crate::{error::ClientResult, gateway::GatewayClient};

pub const MESSAGES_PATH: &str = "/messages";
pub const CONTACTS_PATH: &str = "/contacts";
pub const ONLINE_USERS_PATH: &str = "/users/online";
pub const ALL_USERS_PATH: &str = "/users";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
}

/// Typed chat operations. An empty or absent body yields an empty result;
/// gateway errors pass through unchanged.
#[derive(Clone)]
pub struct ChatApi {
    gateway: Arc<GatewayClient>,
}

impl ChatApi {
    pub fn new(gateway: Arc<GatewayClient>) -> Self {
        Self { gateway }
    }

    /// `page` is 1-based.
    pub async fn get_messages(&self, page: u32, limit: u32) -> ClientResult<Vec<Message>> {
        let payloads: Vec<MessagePayload> = self
            .gateway
            .get_json(
                MESSAGES_PATH,
                &[("page", page.to_string()), ("limit", limit.to_string())],
            )
            .await?
            .unwrap_or_default();
        debug!(page, limit, count = payloads.len(), "chat api: history loaded");
        Ok(payloads.into_iter().map(MessagePayload::into_message).collect())
    }

    /// Returns the server's version of the message, with every field it omitted left empty.
    pub async fn send_message(&self, content: &str) -> ClientResult<MessagePayload> {
        let confirmed = self
            .gateway
            .post_json(MESSAGES_PATH, &SendMessageRequest { content })
            .await?;
        Ok(confirmed.unwrap_or_default())
    }

    pub async fn get_online_users(&self) -> ClientResult<Vec<OnlineUser>> {
        self.list_users(ONLINE_USERS_PATH).await
    }

    pub async fn get_all_users(&self) -> ClientResult<Vec<OnlineUser>> {
        self.list_users(ALL_USERS_PATH).await
    }

    pub async fn get_contacts(&self) -> ClientResult<Vec<OnlineUser>> {
        self.list_users(CONTACTS_PATH).await
    }

    async fn list_users(&self, path: &str) -> ClientResult<Vec<OnlineUser>> {
        let users: Vec<OnlineUser> = self.gateway.get_json(path, &[]).await?.unwrap_or_default();
        debug!(path, count = users.len(), "chat api: users loaded");
        Ok(users)
    }
}

#[cfg(test)]
#[path = "tests/chat_api_tests.rs"]
mod tests;
