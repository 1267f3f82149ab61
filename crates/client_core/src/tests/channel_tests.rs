use super::*;
use crate::{
    backoff::BackoffGrowth,
    test_support::{FakeServerSide, FakeSocket},
};
use serde_json::{json, Value};
use storage::MemoryCredentialStore;
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(600);

fn options(backoff: BackoffPolicy) -> ChannelOptions {
    ChannelOptions {
        ws_url: "wss://rt.example.com/production/".to_string(),
        token_query_param: "token".to_string(),
        send_connect_handshake: true,
        backoff,
    }
}

async fn signed_in_store(access_token: &str) -> Arc<MemoryCredentialStore> {
    let store = Arc::new(MemoryCredentialStore::new());
    store
        .set(TokenSlot::Access, access_token)
        .await
        .expect("set access token");
    store
}

async fn wait_for_state(channel: &RealtimeChannel, state: ChannelState) {
    let mut status = channel.watch_status();
    timeout(WAIT, status.wait_for(|status| status.state == state))
        .await
        .expect("state wait timed out")
        .expect("status channel open");
}

async fn next_signal_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event wait timed out")
            .expect("event stream open");
        if !matches!(event, ChannelEvent::StateChanged(_)) {
            return event;
        }
    }
}

fn drained_signal_events(events: &mut broadcast::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, ChannelEvent::StateChanged(_)) {
            drained.push(event);
        }
    }
    drained
}

/// Connects and consumes the handshake frame.
async fn open_channel(
    channel: &Arc<RealtimeChannel>,
    servers: &mut mpsc::UnboundedReceiver<FakeServerSide>,
    token: &str,
) -> FakeServerSide {
    channel
        .connect(Some(token), Some(UserId::from("u1")))
        .await
        .expect("connect");
    let mut server = timeout(WAIT, servers.recv())
        .await
        .expect("open timed out")
        .expect("server side");
    wait_for_state(channel, ChannelState::Open).await;
    let handshake: Value = serde_json::from_str(&server.next_text().await).expect("json");
    assert_eq!(handshake["action"], "connect");
    server
}

#[tokio::test]
async fn connect_without_credential_is_a_noop() {
    let (socket, _servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket.clone(),
        Arc::new(MemoryCredentialStore::new()),
    );

    channel.connect(None, None).await.expect("no-op");
    channel.connect(Some(""), None).await.expect("no-op");

    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(socket.open_count(), 0);
}

#[tokio::test]
async fn invalid_websocket_url_is_a_config_error() {
    let (socket, _servers) = FakeSocket::new();
    let mut opts = options(BackoffPolicy::default());
    opts.ws_url = "not a url".to_string();
    let channel = RealtimeChannel::new(opts, socket, Arc::new(MemoryCredentialStore::new()));

    let err = channel
        .connect(Some("tok"), None)
        .await
        .expect_err("bad url");
    assert!(matches!(err, ClientError::Config(_)));
}

#[tokio::test]
async fn connect_encodes_credential_and_sends_handshake() {
    let token = "tok+/=";
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket,
        signed_in_store(token).await,
    );

    channel
        .connect(Some(token), Some(UserId::from("u1")))
        .await
        .expect("connect");
    let mut server = servers.recv().await.expect("opened");

    assert_eq!(server.url.query(), Some("token=tok%2B%2F%3D"));
    let decoded: Vec<(String, String)> = server.url.query_pairs().into_owned().collect();
    assert_eq!(decoded, vec![("token".to_string(), token.to_string())]);

    wait_for_state(&channel, ChannelState::Open).await;
    let handshake: Value = serde_json::from_str(&server.next_text().await).expect("json");
    assert_eq!(
        handshake,
        json!({ "action": "connect", "token": token, "userId": "u1" })
    );
    assert_eq!(channel.status().reconnect_attempts, 0);
}

#[tokio::test]
async fn send_only_succeeds_while_open() {
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket,
        signed_in_store("tok").await,
    );

    assert!(matches!(
        channel.send(&OutboundFrame::Ping).await,
        Err(ClientError::ChannelUnavailable)
    ));

    let mut server = open_channel(&channel, &mut servers, "tok").await;
    channel.ping().await.expect("ping while open");
    let ping: Value = serde_json::from_str(&server.next_text().await).expect("json");
    assert_eq!(ping, json!({ "action": "ping" }));

    channel.disconnect().await;
    assert!(matches!(
        channel.ping().await,
        Err(ClientError::ChannelUnavailable)
    ));
}

#[tokio::test]
async fn inbound_frames_are_classified_and_bad_frames_skipped() {
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket,
        signed_in_store("tok").await,
    );
    let mut events = channel.subscribe();
    let server = open_channel(&channel, &mut servers, "tok").await;

    server.push_text("{not json").await;
    server
        .push_text(json!({ "action": "typing", "userId": "u9" }).to_string())
        .await;
    server
        .push_text(json!({ "type": "error", "message": "slow down" }).to_string())
        .await;
    server
        .push_text(json!({ "action": "USER_LEFT", "userId": "u1" }).to_string())
        .await;

    assert_eq!(
        next_signal_event(&mut events).await,
        ChannelEvent::Inbound(InboundEvent::ServerError {
            message: "slow down".to_string()
        })
    );
    assert_eq!(
        next_signal_event(&mut events).await,
        ChannelEvent::Inbound(InboundEvent::UserLeft {
            user_id: UserId::from("u1")
        })
    );
    assert_eq!(channel.state(), ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_schedules_one_reconnect_after_backoff() {
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket.clone(),
        signed_in_store("tok").await,
    );
    let mut events = channel.subscribe();
    let first = open_channel(&channel, &mut servers, "tok").await;

    first.close(4000).await;
    assert_eq!(
        next_signal_event(&mut events).await,
        ChannelEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(5)
        }
    );
    assert_eq!(channel.status().reconnect_attempts, 1);

    let scheduled_at = Instant::now();
    let _second = timeout(WAIT, servers.recv())
        .await
        .expect("reconnect timed out")
        .expect("server side");
    assert!(scheduled_at.elapsed() >= Duration::from_secs(5));

    wait_for_state(&channel, ChannelState::Open).await;
    assert_eq!(channel.status().reconnect_attempts, 0);
    assert_eq!(socket.open_count(), 2);
    assert!(drained_signal_events(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn normal_close_does_not_reconnect() {
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket.clone(),
        signed_in_store("tok").await,
    );
    let mut events = channel.subscribe();
    let server = open_channel(&channel, &mut servers, "tok").await;

    server.close(NORMAL_CLOSURE).await;
    wait_for_state(&channel, ChannelState::Closed).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(socket.open_count(), 1);
    assert!(drained_signal_events(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_reconnect() {
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket.clone(),
        signed_in_store("tok").await,
    );
    let mut events = channel.subscribe();
    let server = open_channel(&channel, &mut servers, "tok").await;

    server.close(1011).await;
    assert!(matches!(
        next_signal_event(&mut events).await,
        ChannelEvent::ReconnectScheduled { attempt: 1, .. }
    ));

    channel.disconnect().await;
    assert_eq!(
        channel.status(),
        ChannelStatus {
            state: ChannelState::Closed,
            reconnect_attempts: 0
        }
    );

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(socket.open_count(), 1);
    assert!(servers.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_twice_closes_normally_once() {
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket,
        signed_in_store("tok").await,
    );
    let mut server = open_channel(&channel, &mut servers, "tok").await;

    channel.disconnect().await;
    channel.disconnect().await;

    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(
        server.from_client.recv().await,
        Some(SocketCommand::Close {
            code: NORMAL_CLOSURE,
            reason: "client disconnect".to_string()
        })
    );
}

#[tokio::test]
async fn disconnect_before_connect_is_harmless() {
    let (socket, _servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket,
        Arc::new(MemoryCredentialStore::new()),
    );
    channel.disconnect().await;
    channel.disconnect().await;
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_stop_at_the_configured_ceiling() {
    let (socket, _servers) = FakeSocket::failing_first(u32::MAX);
    let channel = RealtimeChannel::new(
        options(BackoffPolicy {
            max_attempts: Some(2),
            ..BackoffPolicy::default()
        }),
        socket.clone(),
        signed_in_store("tok").await,
    );
    let mut events = channel.subscribe();

    channel.connect(Some("tok"), None).await.expect("connect");

    assert_eq!(
        next_signal_event(&mut events).await,
        ChannelEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(5)
        }
    );
    assert_eq!(
        next_signal_event(&mut events).await,
        ChannelEvent::ReconnectScheduled {
            attempt: 2,
            delay: Duration::from_secs(10)
        }
    );
    assert_eq!(
        next_signal_event(&mut events).await,
        ChannelEvent::ReconnectExhausted { attempts: 2 }
    );
    wait_for_state(&channel, ChannelState::Closed).await;
    assert_eq!(socket.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_resets_after_successful_open() {
    let (socket, mut servers) = FakeSocket::failing_first(3);
    let channel = RealtimeChannel::new(
        options(BackoffPolicy {
            growth: BackoffGrowth::Exponential,
            max_attempts: None,
            ..BackoffPolicy::default()
        }),
        socket.clone(),
        signed_in_store("tok").await,
    );
    let mut events = channel.subscribe();

    channel.connect(Some("tok"), None).await.expect("connect");

    let mut delays = Vec::new();
    for _ in 0..3 {
        match next_signal_event(&mut events).await {
            ChannelEvent::ReconnectScheduled { delay, .. } => delays.push(delay.as_secs()),
            other => panic!("expected reconnect schedule, got {other:?}"),
        }
    }
    assert_eq!(delays, vec![5, 10, 20]);

    let _server = timeout(WAIT, servers.recv())
        .await
        .expect("open timed out")
        .expect("server side");
    wait_for_state(&channel, ChannelState::Open).await;
    assert_eq!(channel.status().reconnect_attempts, 0);
    assert_eq!(socket.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn cleared_session_is_not_reconnected() {
    let store = signed_in_store("tok").await;
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket.clone(),
        store.clone(),
    );
    let mut events = channel.subscribe();
    let server = open_channel(&channel, &mut servers, "tok").await;

    store.clear().await.expect("clear");
    server.close(4000).await;
    wait_for_state(&channel, ChannelState::Closed).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(socket.open_count(), 1);
    assert!(drained_signal_events(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_uses_the_current_credential() {
    let store = signed_in_store("tok").await;
    let (socket, mut servers) = FakeSocket::new();
    let channel = RealtimeChannel::new(
        options(BackoffPolicy::default()),
        socket,
        store.clone(),
    );
    let mut events = channel.subscribe();
    let server = open_channel(&channel, &mut servers, "tok").await;

    server.close(4000).await;
    assert!(matches!(
        next_signal_event(&mut events).await,
        ChannelEvent::ReconnectScheduled { .. }
    ));
    store
        .set(TokenSlot::Access, "rotated")
        .await
        .expect("rotate");

    let second = timeout(WAIT, servers.recv())
        .await
        .expect("reconnect timed out")
        .expect("server side");
    assert_eq!(second.url.query(), Some("token=rotated"));
}
