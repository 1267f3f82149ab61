use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the connection ends without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Reported when a close frame carries no status code.
pub const NO_STATUS_CLOSURE: u16 = 1005;

/// How long the reader waits for the peer to finish a close handshake.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSignal {
    Text(String),
    /// Always the last signal of a link.
    Closed { code: u16, reason: String },
}

/// An open streaming connection, split into a command queue and a signal queue.
pub struct SocketLink {
    pub outbound: mpsc::Sender<SocketCommand>,
    pub inbound: mpsc::Receiver<SocketSignal>,
}

#[async_trait]
pub trait StreamingSocket: Send + Sync {
    /// Resolves once the connection is open.
    async fn open(&self, url: &Url) -> Result<SocketLink>;
}

/// Connection url with its query (which carries the credential) masked.
pub fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.query().is_some() {
        shown.set_query(Some("redacted"));
    }
    shown.to_string()
}

pub struct TungsteniteSocket;

#[async_trait]
impl StreamingSocket for TungsteniteSocket {
    async fn open(&self, url: &Url) -> Result<SocketLink> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", redacted(url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut commands) = mpsc::channel::<SocketCommand>(64);
        let (signals, inbound) = mpsc::channel::<SocketSignal>(256);

        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SocketCommand::Text(text) => {
                        if let Err(err) = ws_writer.send(Message::Text(text)).await {
                            warn!(error = %err, "websocket send failed");
                            break;
                        }
                    }
                    SocketCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(err) = ws_writer.send(Message::Close(Some(frame))).await {
                            debug!(error = %err, "websocket close frame not delivered");
                        }
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut closed = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if signals.send(SocketSignal::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        closed = Some(match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (NO_STATUS_CLOSURE, String::new()),
                        });
                        // The close reply is only flushed while the stream is polled.
                        let drained = timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
                            while let Some(Ok(_)) = ws_reader.next().await {}
                        })
                        .await;
                        if drained.is_err() {
                            debug!("websocket close handshake timed out");
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "websocket receive failed");
                        break;
                    }
                }
            }
            let (code, reason) =
                closed.unwrap_or_else(|| (ABNORMAL_CLOSURE, "connection lost".to_string()));
            let _ = signals.send(SocketSignal::Closed { code, reason }).await;
        });

        Ok(SocketLink { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
