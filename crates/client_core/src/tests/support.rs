//! Fakes shared by the client_core test modules.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex as StdMutex,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc};
use url::Url;

use crate::{
    session::{Navigator, Route},
    transport::{SocketCommand, SocketLink, SocketSignal, StreamingSocket},
};

/// Server half of one fake socket connection.
pub struct FakeServerSide {
    pub url: Url,
    pub to_client: mpsc::Sender<SocketSignal>,
    pub from_client: mpsc::Receiver<SocketCommand>,
}

impl FakeServerSide {
    pub async fn push_text(&self, text: impl Into<String>) {
        self.to_client
            .send(SocketSignal::Text(text.into()))
            .await
            .expect("client side alive");
    }

    pub async fn close(&self, code: u16) {
        self.to_client
            .send(SocketSignal::Closed {
                code,
                reason: format!("closed with {code}"),
            })
            .await
            .expect("client side alive");
    }

    pub async fn next_text(&mut self) -> String {
        match self.from_client.recv().await {
            Some(SocketCommand::Text(text)) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Hands every opened connection to the test through an unbounded queue.
pub struct FakeSocket {
    servers: mpsc::UnboundedSender<FakeServerSide>,
    failures_left: AtomicU32,
    pub opens: AtomicU32,
}

impl FakeSocket {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServerSide>) {
        Self::failing_first(0)
    }

    /// The first `failures` open attempts are refused.
    pub fn failing_first(
        failures: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeServerSide>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                servers,
                failures_left: AtomicU32::new(failures),
                opens: AtomicU32::new(0),
            }),
            rx,
        )
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingSocket for FakeSocket {
    async fn open(&self, url: &Url) -> Result<SocketLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("connection refused"));
        }

        let (to_client, inbound) = mpsc::channel(64);
        let (outbound, from_client) = mpsc::channel(64);
        self.servers
            .send(FakeServerSide {
                url: url.clone(),
                to_client,
                from_client,
            })
            .map_err(|_| anyhow!("test dropped the server queue"))?;
        Ok(SocketLink { outbound, inbound })
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    routes: StdMutex<Vec<Route>>,
}

impl RecordingNavigator {
    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().expect("navigator lock").clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: Route) {
        self.routes.lock().expect("navigator lock").push(route);
    }
}

pub fn identity_token(sub: &str, username: Option<&str>, email: Option<&str>) -> String {
    let mut claims = json!({ "sub": sub, "exp": 4_102_444_800_u64 });
    if let Some(username) = username {
        claims["cognito:username"] = json!(username);
    }
    if let Some(email) = email {
        claims["email"] = json!(email);
    }
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-secret"),
    )
    .expect("encode identity token")
}

pub async fn spawn_gateway(app: Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}
