//! Real-time channel: one live streaming connection with reconnect-with-backoff.
//!
//! State flows `Disconnected -> Connecting -> Open -> Closing -> Closed`. A close
//! with any code other than 1000 while the session still holds an access token
//! loops back to `Connecting` after the backoff delay. `disconnect` aborts the
//! supervisor task, which also cancels a pending reconnect sleep.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{TokenSlot, UserId},
    protocol::{InboundEvent, OutboundFrame},
};
use storage::CredentialStore;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    backoff::BackoffPolicy,
    config::ClientSettings,
    error::{ClientError, ClientResult},
    transport::{
        redacted, SocketCommand, SocketLink, SocketSignal, StreamingSocket, ABNORMAL_CLOSURE,
        NORMAL_CLOSURE,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Reset to zero whenever a connection opens.
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    Inbound(InboundEvent),
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub ws_url: String,
    pub token_query_param: String,
    pub send_connect_handshake: bool,
    pub backoff: BackoffPolicy,
}

impl From<&ClientSettings> for ChannelOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            ws_url: settings.ws_url.clone(),
            token_query_param: settings.token_query_param.clone(),
            send_connect_handshake: settings.send_connect_handshake,
            backoff: settings.backoff.clone(),
        }
    }
}

pub struct RealtimeChannel {
    options: ChannelOptions,
    socket: Arc<dyn StreamingSocket>,
    credentials: Arc<dyn CredentialStore>,
    status: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<ChannelEvent>,
    outbound: Mutex<Option<mpsc::Sender<SocketCommand>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(
        options: ChannelOptions,
        socket: Arc<dyn StreamingSocket>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ChannelStatus {
            state: ChannelState::Disconnected,
            reconnect_attempts: 0,
        });
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            options,
            socket,
            credentials,
            status,
            events,
            outbound: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Connection uri with the credential percent-encoded into the query.
    pub fn connection_url(&self, credential: &str) -> ClientResult<Url> {
        let mut url = Url::parse(&self.options.ws_url).map_err(|err| {
            ClientError::Config(format!("invalid websocket url '{}': {err}", self.options.ws_url))
        })?;
        url.query_pairs_mut()
            .append_pair(&self.options.token_query_param, credential);
        Ok(url)
    }

    /// Starts (or restarts) the connection. An absent credential is a logged no-op.
    pub async fn connect(
        self: &Arc<Self>,
        credential: Option<&str>,
        user_id: Option<UserId>,
    ) -> ClientResult<()> {
        let Some(credential) = credential.filter(|credential| !credential.is_empty()) else {
            warn!("realtime: no credential available; connect skipped");
            return Ok(());
        };
        self.connection_url(credential)?;

        self.stop_supervisor().await;
        self.set_status(ChannelState::Connecting, 0);

        let channel = Arc::clone(self);
        let credential = credential.to_string();
        let task = tokio::spawn(async move { channel.supervise(credential, user_id).await });
        *self.supervisor.lock().await = Some(task);
        Ok(())
    }

    /// Fails with `ChannelUnavailable` unless the channel is `Open`.
    pub async fn send(&self, frame: &OutboundFrame) -> ClientResult<()> {
        if self.state() != ChannelState::Open {
            debug!(action = frame.action(), state = ?self.state(), "realtime: send refused");
            return Err(ClientError::ChannelUnavailable);
        }
        let text = serde_json::to_string(frame)
            .map_err(|err| ClientError::ProtocolDecode(format!("unserializable frame: {err}")))?;

        let outbound = self.outbound.lock().await.clone();
        let Some(outbound) = outbound else {
            return Err(ClientError::ChannelUnavailable);
        };
        outbound
            .send(SocketCommand::Text(text))
            .await
            .map_err(|_| ClientError::ChannelUnavailable)?;
        debug!(action = frame.action(), "realtime: frame sent");
        Ok(())
    }

    pub async fn ping(&self) -> ClientResult<()> {
        self.send(&OutboundFrame::Ping).await
    }

    /// Closes with the normal code and cancels any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        if self.stop_supervisor().await {
            info!("realtime: disconnected by client");
        }
        self.set_status(ChannelState::Closed, 0);
    }

    async fn stop_supervisor(&self) -> bool {
        let task = self.supervisor.lock().await.take();
        let had_task = task.is_some();
        if let Some(task) = task {
            self.set_status(ChannelState::Closing, self.status().reconnect_attempts);
            task.abort();
            let _ = task.await;
        }

        if let Some(outbound) = self.outbound.lock().await.take() {
            let _ = outbound
                .send(SocketCommand::Close {
                    code: NORMAL_CLOSURE,
                    reason: "client disconnect".to_string(),
                })
                .await;
        }
        had_task
    }

    async fn supervise(self: Arc<Self>, mut credential: String, user_id: Option<UserId>) {
        let mut attempt: u32 = 0;
        loop {
            let url = match self.connection_url(&credential) {
                Ok(url) => url,
                Err(err) => {
                    error!(error = %err, "realtime: cannot build connection url");
                    self.set_status(ChannelState::Closed, attempt);
                    return;
                }
            };
            self.set_status(ChannelState::Connecting, attempt);
            info!(url = %redacted(&url), attempt, "realtime: connecting");

            let (code, reason) = match self.socket.open(&url).await {
                Ok(link) => {
                    attempt = 0;
                    self.run_link(link, &credential, user_id.as_ref()).await
                }
                Err(err) => {
                    warn!("realtime: connect failed: {err:#}");
                    (ABNORMAL_CLOSURE, err.to_string())
                }
            };
            *self.outbound.lock().await = None;

            if code == NORMAL_CLOSURE {
                info!(code, reason = %reason, "realtime: closed normally");
                self.set_status(ChannelState::Closed, 0);
                return;
            }
            warn!(code, reason = %reason, "realtime: closed abnormally");

            if !self.session_active().await {
                info!("realtime: session ended; not reconnecting");
                self.set_status(ChannelState::Closed, attempt);
                return;
            }

            let next_attempt = attempt.saturating_add(1);
            if !self.options.backoff.allows(next_attempt) {
                error!(attempts = attempt, "realtime: reconnect attempts exhausted");
                self.set_status(ChannelState::Closed, attempt);
                let _ = self
                    .events
                    .send(ChannelEvent::ReconnectExhausted { attempts: attempt });
                return;
            }
            attempt = next_attempt;

            let delay = self.options.backoff.delay_for(attempt);
            self.set_status(ChannelState::Closed, attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "realtime: reconnect scheduled"
            );
            let _ = self
                .events
                .send(ChannelEvent::ReconnectScheduled { attempt, delay });
            tokio::time::sleep(delay).await;

            match self.current_credential().await {
                Some(fresh) => credential = fresh,
                None => {
                    info!("realtime: credential gone before reconnect; giving up");
                    self.set_status(ChannelState::Closed, attempt);
                    return;
                }
            }
        }
    }

    async fn run_link(
        &self,
        link: SocketLink,
        credential: &str,
        user_id: Option<&UserId>,
    ) -> (u16, String) {
        let SocketLink {
            outbound,
            mut inbound,
        } = link;
        *self.outbound.lock().await = Some(outbound);
        self.set_status(ChannelState::Open, 0);
        info!("realtime: connected");

        if self.options.send_connect_handshake {
            let handshake = OutboundFrame::Connect {
                token: credential.to_string(),
                user_id: user_id.cloned(),
            };
            if let Err(err) = self.send(&handshake).await {
                warn!(error = %err, "realtime: connect handshake not sent");
            }
        }

        while let Some(signal) = inbound.recv().await {
            match signal {
                SocketSignal::Text(text) => self.dispatch(&text),
                SocketSignal::Closed { code, reason } => return (code, reason),
            }
        }
        (ABNORMAL_CLOSURE, "socket dropped".to_string())
    }

    fn dispatch(&self, text: &str) {
        let event = match InboundEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "realtime: dropping malformed frame");
                return;
            }
        };
        match &event {
            InboundEvent::Unknown { kind } => {
                debug!(kind = kind.as_deref().unwrap_or("<none>"), "realtime: ignoring unknown frame");
                return;
            }
            InboundEvent::ServerError { message } => {
                warn!(message = %message, "realtime: server reported an error");
            }
            _ => {}
        }
        let _ = self.events.send(ChannelEvent::Inbound(event));
    }

    async fn current_credential(&self) -> Option<String> {
        match self.credentials.get(TokenSlot::Access).await {
            Ok(credential) => credential.filter(|credential| !credential.is_empty()),
            Err(err) => {
                warn!("realtime: credential read failed: {err:#}");
                None
            }
        }
    }

    async fn session_active(&self) -> bool {
        self.current_credential().await.is_some()
    }

    fn set_status(&self, state: ChannelState, reconnect_attempts: u32) {
        let mut previous = state;
        self.status.send_if_modified(|status| {
            previous = status.state;
            let next = ChannelStatus {
                state,
                reconnect_attempts,
            };
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
        if previous != state {
            debug!(from = ?previous, to = ?state, reconnect_attempts, "realtime: state changed");
            let _ = self.events.send(ChannelEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
