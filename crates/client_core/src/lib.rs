use std::sync::Arc;

use storage::CredentialStore;
use tracing::info;

pub mod backoff;
pub mod channel;
pub mod chat_api;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod session;
pub mod transport;

pub use backoff::{BackoffGrowth, BackoffPolicy};
pub use channel::{ChannelEvent, ChannelOptions, ChannelState, ChannelStatus, RealtimeChannel};
pub use chat_api::ChatApi;
pub use config::{load_settings, load_settings_from, normalize_database_url, ClientSettings};
pub use conversation::{ConversationViewModel, NoticeSeverity, SendOutcome, ViewUpdate};
pub use error::{ClientError, ClientResult};
pub use gateway::GatewayClient;
pub use session::{complete_login_handoff, decode_identity_token, Navigator, Route, SessionResolver};
pub use transport::{StreamingSocket, TungsteniteSocket};

/// Explicitly constructed service graph shared by every view.
#[derive(Clone)]
pub struct ClientContext {
    settings: ClientSettings,
    credentials: Arc<dyn CredentialStore>,
    session: SessionResolver,
    api: ChatApi,
    channel: Arc<RealtimeChannel>,
}

impl ClientContext {
    pub fn new(
        settings: ClientSettings,
        credentials: Arc<dyn CredentialStore>,
        socket: Arc<dyn StreamingSocket>,
    ) -> ClientResult<Self> {
        let gateway = Arc::new(GatewayClient::new(&settings, Arc::clone(&credentials))?);
        let channel = RealtimeChannel::new(
            ChannelOptions::from(&settings),
            socket,
            Arc::clone(&credentials),
        );
        info!(
            api = %settings.api_base_url,
            growth = ?settings.backoff.growth,
            "client context ready"
        );
        Ok(Self {
            session: SessionResolver::new(Arc::clone(&credentials)),
            api: ChatApi::new(gateway),
            channel,
            credentials,
            settings,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn session(&self) -> &SessionResolver {
        &self.session
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }

    /// Stores the identity provider hand-off and routes accordingly.
    pub async fn complete_login(
        &self,
        fragment: &str,
        navigator: &dyn Navigator,
    ) -> ClientResult<Route> {
        complete_login_handoff(fragment, self.credentials.as_ref(), navigator).await
    }

    pub fn conversation(&self, navigator: Arc<dyn Navigator>) -> ConversationViewModel {
        ConversationViewModel::new(
            self.session.clone(),
            self.api.clone(),
            Arc::clone(&self.channel),
            navigator,
            &self.settings,
        )
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
