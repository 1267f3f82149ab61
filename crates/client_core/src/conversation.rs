//! Conversation view model: the message and online-user lists behind the chat
//! view, plus the optimistic send protocol.
//!
//! A send appends a temporary entry at once. While the real-time channel is
//! open the text goes out as a `sendmessage` frame carrying the temporary id
//! as `clientMessageId`; a `NEW_MESSAGE` echoing that id replaces the entry in
//! place, and an entry still unconfirmed after `ack_timeout` is dropped.
//! Otherwise the REST call runs and its reply replaces the entry, or the entry
//! is kept and flagged with `error` when the call fails.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{Message, MessageId, OnlineUser, UserId, UserIdentity},
    protocol::{InboundEvent, OutboundFrame, SendMessageData},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ChannelEvent, ChannelState, RealtimeChannel},
    chat_api::ChatApi,
    config::ClientSettings,
    error::{ClientError, ClientResult},
    session::{Navigator, Route, SessionResolver},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    Success,
    Warning,
    Error,
}

/// Re-render hints for whatever draws the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    MessagesChanged,
    UsersChanged,
    ConnectionChanged(bool),
    Notice {
        severity: NoticeSeverity,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank content or nobody signed in.
    Ignored,
    /// Written to the real-time channel; awaiting the echo.
    Streamed,
    /// Confirmed by the REST call.
    Confirmed,
    /// Kept in the list with `error` set.
    Failed,
}

#[derive(Debug, Clone)]
struct PendingAck {
    temp_id: MessageId,
    deadline: Instant,
}

enum Wake {
    Channel(Result<ChannelEvent, RecvError>),
    AckDeadline,
}

pub struct ConversationViewModel {
    session: SessionResolver,
    api: ChatApi,
    channel: Arc<RealtimeChannel>,
    navigator: Arc<dyn Navigator>,
    history_page_size: u32,
    ack_timeout: Duration,
    channel_events: broadcast::Receiver<ChannelEvent>,
    updates: broadcast::Sender<ViewUpdate>,
    current_user: Option<UserIdentity>,
    messages: Vec<Message>,
    online_users: Vec<OnlineUser>,
    draft: String,
    connected: bool,
    pending_acks: Vec<PendingAck>,
}

impl ConversationViewModel {
    pub fn new(
        session: SessionResolver,
        api: ChatApi,
        channel: Arc<RealtimeChannel>,
        navigator: Arc<dyn Navigator>,
        settings: &ClientSettings,
    ) -> Self {
        let channel_events = channel.subscribe();
        let (updates, _) = broadcast::channel(1024);
        Self {
            session,
            api,
            channel,
            navigator,
            history_page_size: settings.history_page_size,
            ack_timeout: settings.ack_timeout,
            channel_events,
            updates,
            current_user: None,
            messages: Vec::new(),
            online_users: Vec::new(),
            draft: String::new(),
            connected: false,
            pending_acks: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewUpdate> {
        self.updates.subscribe()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn online_users(&self) -> &[OnlineUser] {
        &self.online_users
    }

    pub fn current_user(&self) -> Option<&UserIdentity> {
        self.current_user.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn channel(&self) -> &Arc<RealtimeChannel> {
        &self.channel
    }

    /// Gates on the stored session, loads history and the online list, then
    /// starts the real-time channel. Returns the route the user ends up on.
    pub async fn open(&mut self) -> ClientResult<Route> {
        let user = self.session.resolve_current_user().await;
        let token = self.session.access_token().await;
        let (Some(user), Some(token)) = (user, token) else {
            info!("conversation: no session; redirecting to login");
            self.navigator.navigate(Route::Login);
            return Ok(Route::Login);
        };
        info!(user = %user.username, "conversation: opening");
        let user_id = user.id.clone();
        self.current_user = Some(user);

        if let Err(err) = self.load_history().await {
            if err.requires_reauth() {
                return self.sign_out_after(err).await;
            }
            warn!(error = %err, "conversation: history unavailable");
            self.notify(NoticeSeverity::Error, load_failure_text(&err));
        }

        if let Err(err) = self.refresh_online_users().await {
            if err.requires_reauth() {
                return self.sign_out_after(err).await;
            }
            debug!(error = %err, "conversation: online users unavailable");
        }

        // The gateway may have rotated the access credential while loading.
        let token = self.session.access_token().await.unwrap_or(token);
        self.channel.connect(Some(&token), Some(user_id)).await?;
        Ok(Route::Chat)
    }

    pub async fn load_history(&mut self) -> ClientResult<()> {
        let history = self.api.get_messages(1, self.history_page_size).await?;
        info!(count = history.len(), "conversation: history loaded");
        self.messages = history;
        self.pending_acks.clear();
        self.emit(ViewUpdate::MessagesChanged);
        Ok(())
    }

    /// Replaces the online-user set wholesale.
    pub async fn refresh_online_users(&mut self) -> ClientResult<()> {
        let users = self.api.get_online_users().await?;
        debug!(count = users.len(), "conversation: online users loaded");
        self.online_users = users;
        self.emit(ViewUpdate::UsersChanged);
        Ok(())
    }

    pub async fn send_draft(&mut self) -> SendOutcome {
        let draft = self.draft.clone();
        self.send(&draft).await
    }

    pub async fn send(&mut self, content: &str) -> SendOutcome {
        let content = content.trim();
        if content.is_empty() {
            return SendOutcome::Ignored;
        }
        let Some(author) = self.current_user.clone() else {
            debug!("conversation: send ignored; nobody signed in");
            return SendOutcome::Ignored;
        };

        let temp_id = MessageId::temporary();
        self.messages.push(Message::optimistic(
            temp_id.clone(),
            content,
            &author,
            Utc::now(),
        ));
        self.draft.clear();
        self.emit(ViewUpdate::MessagesChanged);

        if self.channel.state() == ChannelState::Open {
            let frame = OutboundFrame::SendMessage {
                data: SendMessageData {
                    content: content.to_string(),
                    client_message_id: temp_id.clone(),
                },
                timestamp: Utc::now(),
            };
            match self.channel.send(&frame).await {
                Ok(()) => {
                    self.pending_acks.push(PendingAck {
                        temp_id,
                        deadline: Instant::now() + self.ack_timeout,
                    });
                    return SendOutcome::Streamed;
                }
                Err(err) => debug!(error = %err, "conversation: channel send failed; using rest"),
            }
        }

        match self.api.send_message(content).await {
            Ok(confirmed) => {
                if let Some(entry) = self.find_message_mut(&temp_id) {
                    *entry = confirmed.confirm(entry);
                }
                self.emit(ViewUpdate::MessagesChanged);
                SendOutcome::Confirmed
            }
            Err(err) => {
                warn!(error = %err, "conversation: send failed");
                if let Some(entry) = self.find_message_mut(&temp_id) {
                    entry.error = true;
                }
                self.emit(ViewUpdate::MessagesChanged);
                if err.requires_reauth() {
                    if let Err(clear_err) = self.sign_out_after(err).await {
                        warn!(error = %clear_err, "conversation: sign-out after failed send");
                    }
                } else {
                    self.notify(NoticeSeverity::Error, send_failure_text(&err));
                }
                SendOutcome::Failed
            }
        }
    }

    /// Folds one real-time channel event into the lists.
    pub fn apply_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => {
                let connected = state == ChannelState::Open;
                if connected != self.connected {
                    self.connected = connected;
                    self.emit(ViewUpdate::ConnectionChanged(connected));
                    if connected {
                        self.notify(NoticeSeverity::Success, "Connected to real-time chat");
                    }
                }
            }
            ChannelEvent::Inbound(inbound) => self.apply_inbound(inbound),
            ChannelEvent::ReconnectScheduled { attempt, delay } => {
                self.notify(
                    NoticeSeverity::Warning,
                    format!(
                        "Real-time connection lost; retrying in {}s (attempt {attempt})",
                        delay.as_secs()
                    ),
                );
            }
            ChannelEvent::ReconnectExhausted { attempts } => {
                self.notify(
                    NoticeSeverity::Error,
                    format!("Real-time connection lost after {attempts} attempts; messages will be sent without live updates"),
                );
            }
        }
    }

    fn apply_inbound(&mut self, inbound: InboundEvent) {
        match inbound {
            InboundEvent::NewMessage(payload) => {
                let correlated = payload.client_message_id.clone().and_then(|correlation| {
                    self.pending_acks
                        .iter()
                        .position(|pending| pending.temp_id == correlation)
                });
                match correlated {
                    Some(index) => {
                        let pending = self.pending_acks.remove(index);
                        match self.find_message_mut(&pending.temp_id) {
                            Some(entry) => *entry = payload.confirm(entry),
                            None => self.messages.push(payload.into_message()),
                        }
                    }
                    None => self.messages.push(payload.into_message()),
                }
                self.emit(ViewUpdate::MessagesChanged);
            }
            InboundEvent::UserJoined(user) => {
                match self
                    .online_users
                    .iter_mut()
                    .find(|existing| existing.id == user.id)
                {
                    Some(existing) => *existing = user,
                    None => self.online_users.push(user),
                }
                self.emit(ViewUpdate::UsersChanged);
            }
            InboundEvent::UserLeft { user_id } => {
                if self.remove_user(&user_id) {
                    self.emit(ViewUpdate::UsersChanged);
                }
            }
            InboundEvent::ServerError { message } => {
                debug!(message = %message, "conversation: server error frame");
            }
            InboundEvent::Unknown { .. } => {}
        }
    }

    /// Drops optimistic entries whose echo did not arrive by `now`.
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .pending_acks
            .drain(..)
            .partition(|pending| pending.deadline <= now);
        self.pending_acks = waiting;
        if expired.is_empty() {
            return 0;
        }

        let before = self.messages.len();
        self.messages.retain(|message| {
            !(message.is_temp && expired.iter().any(|pending| pending.temp_id == message.id))
        });
        let removed = before - self.messages.len();
        if removed > 0 {
            debug!(removed, "conversation: dropped unconfirmed optimistic entries");
            self.emit(ViewUpdate::MessagesChanged);
        }
        removed
    }

    pub fn next_ack_deadline(&self) -> Option<Instant> {
        self.pending_acks.iter().map(|pending| pending.deadline).min()
    }

    /// Waits for the next channel event or acknowledgement deadline and applies
    /// it. Returns `false` once the channel's event stream is gone.
    pub async fn process_next(&mut self) -> bool {
        let deadline = self.next_ack_deadline();
        let wake = tokio::select! {
            event = self.channel_events.recv() => Wake::Channel(event),
            _ = wait_for_deadline(deadline) => Wake::AckDeadline,
        };

        match wake {
            Wake::Channel(Ok(event)) => self.apply_channel_event(event),
            Wake::Channel(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "conversation: channel events lagged");
            }
            Wake::Channel(Err(RecvError::Closed)) => return false,
            Wake::AckDeadline => {
                self.expire_pending(Instant::now());
            }
        }
        true
    }

    /// Disconnects, clears every credential slot and returns to the login view.
    pub async fn logout(&mut self) -> ClientResult<()> {
        self.channel.disconnect().await;
        let cleared = self.session.clear().await;
        self.reset();
        self.navigator.navigate(Route::Login);
        info!("conversation: logged out");
        cleared
    }

    /// Leaves the view without touching the session.
    pub async fn close(&mut self) {
        self.channel.disconnect().await;
        self.pending_acks.clear();
    }

    async fn sign_out_after(&mut self, err: ClientError) -> ClientResult<Route> {
        warn!(error = %err, "conversation: session no longer valid");
        self.channel.disconnect().await;
        let cleared = self.session.clear().await;
        self.reset();
        self.notify(NoticeSeverity::Warning, err.user_message());
        self.navigator.navigate(Route::Login);
        cleared.map(|()| Route::Login)
    }

    fn reset(&mut self) {
        self.current_user = None;
        self.messages.clear();
        self.online_users.clear();
        self.pending_acks.clear();
        self.draft.clear();
        if self.connected {
            self.connected = false;
            self.emit(ViewUpdate::ConnectionChanged(false));
        }
        self.emit(ViewUpdate::MessagesChanged);
        self.emit(ViewUpdate::UsersChanged);
    }

    fn remove_user(&mut self, user_id: &UserId) -> bool {
        let before = self.online_users.len();
        self.online_users.retain(|user| &user.id != user_id);
        self.online_users.len() != before
    }

    fn find_message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    fn notify(&self, severity: NoticeSeverity, text: impl Into<String>) {
        self.emit(ViewUpdate::Notice {
            severity,
            text: text.into(),
        });
    }

    fn emit(&self, update: ViewUpdate) {
        let _ = self.updates.send(update);
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn load_failure_text(err: &ClientError) -> String {
    if err.is_connectivity() {
        err.user_message()
    } else {
        format!("Could not load messages: {}", err.user_message())
    }
}

fn send_failure_text(err: &ClientError) -> String {
    format!("Could not send message: {}", err.user_message())
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
