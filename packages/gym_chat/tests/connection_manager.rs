//! ConnectionManager against an in-process WebSocket chat server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};

use gym_chat::{
    ChatConfig, ConnectionManager, ConnectionState, Message, ReconnectPolicy, SendError,
    SendStatus,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct FakeChat {
    /// Frames pushed to every client right after the upgrade.
    greeting: Arc<Vec<String>>,
    /// The first N connections are closed by the server after the greeting.
    hang_up_first: usize,
    connections: Arc<AtomicUsize>,
    received: mpsc::UnboundedSender<(String, String)>,
}

struct FakeServer {
    host: String,
    connections: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<(String, String)>,
    _shutdown: oneshot::Sender<()>,
}

impl FakeServer {
    async fn start(greeting: &[&str], hang_up_first: usize) -> Self {
        let (tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let fake = FakeChat {
            greeting: Arc::new(greeting.iter().map(|s| s.to_string()).collect()),
            hang_up_first,
            connections: connections.clone(),
            received: tx,
        };
        let app = Router::new()
            .route("/ws/chat/{room}", get(chat_ws))
            .with_state(fake);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            host: addr.to_string(),
            connections,
            received,
            _shutdown: shutdown,
        }
    }

    fn config(&self) -> ChatConfig {
        ChatConfig::new(self.host.clone())
    }

    async fn next_frame(&mut self) -> (String, Value) {
        let (room, text) = tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("server gone");
        (room, serde_json::from_str(&text).unwrap())
    }
}

async fn chat_ws(
    State(fake): State<FakeChat>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let n = fake.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_socket(socket, room, n, fake))
}

async fn serve_socket(mut socket: WebSocket, room: String, n: usize, fake: FakeChat) {
    for frame in fake.greeting.iter() {
        if socket.send(WsMessage::Text(frame.clone().into())).await.is_err() {
            return;
        }
    }
    if n < fake.hang_up_first {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            WsMessage::Text(text) => {
                let _ = fake.received.send((room.clone(), text.as_str().to_string()));
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

fn inbound(id: &str, room: &str, content: &str) -> String {
    json!({
        "id": id,
        "roomId": room,
        "senderId": "coach",
        "content": content,
        "createdAt": "2025-03-01T10:00:00Z",
    })
    .to_string()
}

fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_millis(400),
        max_attempts,
    }
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ConnectionState>,
    mut f: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| f(s)))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
    *state
}

async fn wait_open(manager: &ConnectionManager) {
    let mut rx = manager.subscribe_state();
    wait_for_state(&mut rx, |s| s.is_open()).await;
}

fn collector() -> (
    impl Fn(Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |m: Message| {
            let _ = tx.send(m);
        },
        rx,
    )
}

#[tokio::test]
async fn send_before_open_is_rejected_and_never_delivered() {
    let mut server = FakeServer::start(&[], 0).await;
    let manager = ConnectionManager::new(server.config());
    let (handler, mut delivered) = collector();

    manager.join("r1", handler).unwrap();
    let early = manager.send(&Message::draft("u1", "too early"));
    assert!(matches!(early, Err(SendError::NotConnected)));

    wait_open(&manager).await;
    assert_eq!(
        manager.send(&Message::draft("u1", "on time")).unwrap(),
        SendStatus::Sent
    );

    let (room, frame) = server.next_frame().await;
    assert_eq!(room, "r1");
    assert_eq!(frame["content"], "on time");
    assert!(server.received.try_recv().is_err());
    assert!(delivered.try_recv().is_err());
    manager.leave().await;
}

#[tokio::test]
async fn outbound_frame_carries_only_wire_fields() {
    let mut server = FakeServer::start(&[], 0).await;
    let manager = ConnectionManager::new(server.config());
    manager.join("r1", |_| {}).unwrap();
    wait_open(&manager).await;

    manager.send(&Message::draft("u1", "hi")).unwrap();

    let (_, frame) = server.next_frame().await;
    assert_eq!(
        frame,
        json!({ "roomId": "r1", "senderId": "u1", "content": "hi" })
    );
    manager.leave().await;
}

#[tokio::test]
async fn inbound_message_delivered_exactly_once() {
    let frame = inbound("m1", "r1", "welcome");
    let server = FakeServer::start(&[frame.as_str()], 0).await;
    let manager = ConnectionManager::new(server.config());
    let (handler, mut delivered) = collector();

    manager.join("r1", handler).unwrap();

    let message = tokio::time::timeout(WAIT, delivered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id.as_deref(), Some("m1"));
    assert_eq!(message.room_id.as_deref(), Some("r1"));
    assert_eq!(message.content, "welcome");
    assert!(message.is_persisted());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(delivered.try_recv().is_err());
    manager.leave().await;
}

#[tokio::test]
async fn malformed_frames_are_dropped_and_channel_stays_open() {
    let good = inbound("m2", "r1", "still here");
    let server = FakeServer::start(
        &[
            "not json",
            r#"{"id":"m1","roomId":"r1"}"#,
            r#"{"id":"","roomId":"r1","senderId":"u","content":"x","createdAt":"2025-03-01T10:00:00Z"}"#,
            good.as_str(),
        ],
        0,
    )
    .await;
    let manager = ConnectionManager::new(server.config());
    let (handler, mut delivered) = collector();

    manager.join("r1", handler).unwrap();

    let message = tokio::time::timeout(WAIT, delivered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.id.as_deref(), Some("m2"));
    assert!(delivered.try_recv().is_err());
    assert_eq!(manager.state(), ConnectionState::Open);
    manager.leave().await;
}

#[tokio::test]
async fn leave_is_idempotent() {
    let server = FakeServer::start(&[], 0).await;
    let manager = ConnectionManager::new(server.config());
    manager.join("r1", |_| {}).unwrap();
    wait_open(&manager).await;

    manager.leave().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.active_room(), None);

    manager.leave().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(matches!(
        manager.send(&Message::draft("u1", "hi")),
        Err(SendError::NotConnected)
    ));
}

#[tokio::test]
async fn joining_another_room_closes_the_previous_channel() {
    let mut server = FakeServer::start(&[], 0).await;
    let manager = ConnectionManager::new(server.config());

    manager.join("r1", |_| {}).unwrap();
    wait_open(&manager).await;
    let mut r1 = manager.subscribe_state();

    manager.join("r2", |_| {}).unwrap();
    assert_eq!(manager.active_room().as_deref(), Some("r2"));
    assert_eq!(
        wait_for_state(&mut r1, |s| *s == ConnectionState::Closed).await,
        ConnectionState::Closed
    );

    wait_open(&manager).await;
    manager.send(&Message::draft("u1", "moved")).unwrap();
    let (room, frame) = server.next_frame().await;
    assert_eq!(room, "r2");
    assert_eq!(frame["roomId"], "r2");
    manager.leave().await;
}

#[tokio::test]
async fn payload_room_must_match_active_room() {
    let server = FakeServer::start(&[], 0).await;
    let manager = ConnectionManager::new(server.config());
    manager.join("r1", |_| {}).unwrap();
    wait_open(&manager).await;

    let err = manager
        .send(&Message::draft("u1", "hi").in_room("r2"))
        .unwrap_err();
    match err {
        SendError::RoomMismatch { payload, joined } => {
            assert_eq!(payload, "r2");
            assert_eq!(joined, "r1");
        }
        other => panic!("expected RoomMismatch, got {other:?}"),
    }

    assert_eq!(
        manager
            .send(&Message::draft("u1", "hi").in_room("r1"))
            .unwrap(),
        SendStatus::Sent
    );
    manager.leave().await;
}

#[tokio::test]
async fn server_close_without_reconnect_ends_closed() {
    let server = FakeServer::start(&[], 1).await;
    let manager = ConnectionManager::new(server.config());
    manager.join("r1", |_| {}).unwrap();

    let mut rx = manager.subscribe_state();
    wait_for_state(&mut rx, |s| *s == ConnectionState::Closed).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert!(matches!(
        manager.send(&Message::draft("u1", "hi")),
        Err(SendError::NotConnected)
    ));
}

#[tokio::test]
async fn reconnects_after_server_close_when_enabled() {
    let server = FakeServer::start(&[], 1).await;
    let mut config = server.config();
    config.reconnect = fast_reconnect(None);
    let manager = ConnectionManager::new(config);
    manager.join("r1", |_| {}).unwrap();

    let mut rx = manager.subscribe_state();
    let state = wait_for_state(&mut rx, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
    assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });

    wait_for_state(&mut rx, |s| s.is_open()).await;
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    manager.leave().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let mut config = ChatConfig::new("127.0.0.1:1");
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        ..fast_reconnect(Some(2))
    };
    let manager = ConnectionManager::new(config);
    manager.join("r1", |_| {}).unwrap();

    let mut rx = manager.subscribe_state();
    wait_for_state(&mut rx, |s| *s == ConnectionState::Closed).await;
    assert_eq!(manager.active_room().as_deref(), Some("r1"));
}

#[tokio::test]
async fn queued_messages_flush_in_order_on_open() {
    let mut server = FakeServer::start(&[], 0).await;
    let mut config = server.config();
    config.queue_capacity = 8;
    let manager = ConnectionManager::new(config);

    manager.join("r1", |_| {}).unwrap();
    for content in ["one", "two", "three"] {
        assert_eq!(
            manager.send(&Message::draft("u1", content)).unwrap(),
            SendStatus::Queued
        );
    }

    for expected in ["one", "two", "three"] {
        let (_, frame) = server.next_frame().await;
        assert_eq!(frame["content"], expected);
    }
    manager.leave().await;
}

#[tokio::test]
async fn full_queue_rejects() {
    let server = FakeServer::start(&[], 0).await;
    let mut config = server.config();
    config.queue_capacity = 1;
    let manager = ConnectionManager::new(config);

    manager.join("r1", |_| {}).unwrap();
    assert_eq!(
        manager.send(&Message::draft("u1", "a")).unwrap(),
        SendStatus::Queued
    );
    assert!(matches!(
        manager.send(&Message::draft("u1", "b")),
        Err(SendError::QueueFull)
    ));
    manager.leave().await;
}

#[tokio::test]
async fn disconnect_closes_everything() {
    let server = FakeServer::start(&[], 0).await;
    let manager = ConnectionManager::new(server.config());
    manager.join("r1", |_| {}).unwrap();
    wait_open(&manager).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.active_room(), None);

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}

/// Accepts one WebSocket connection and drops it without a close frame.
async fn spawn_abrupt_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(ws);
    });
    addr.to_string()
}

#[tokio::test]
async fn connection_lost_without_close_frame_ends_closed() {
    let host = spawn_abrupt_server().await;
    let manager = ConnectionManager::new(ChatConfig::new(host));
    manager.join("r1", |_| {}).unwrap();

    let mut rx = manager.subscribe_state();
    wait_for_state(&mut rx, |s| s.is_open()).await;
    wait_for_state(&mut rx, |s| *s == ConnectionState::Closed).await;

    assert!(matches!(
        manager.send(&Message::draft("u1", "hi")),
        Err(SendError::NotConnected)
    ));
    manager.leave().await;
    manager.leave().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn panicking_handler_closes_the_channel() {
    let frame = inbound("m1", "r1", "boom");
    let server = FakeServer::start(&[frame.as_str()], 0).await;
    let manager = ConnectionManager::new(server.config());
    manager
        .join("r1", |_| panic!("handler failed"))
        .unwrap();

    let mut rx = manager.subscribe_state();
    wait_for_state(&mut rx, |s| *s == ConnectionState::Closed).await;

    assert!(matches!(
        manager.send(&Message::draft("u1", "hi")),
        Err(SendError::NotConnected)
    ));
    manager.leave().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
}
