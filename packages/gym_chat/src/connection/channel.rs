//! One room's WebSocket channel: a handle owned by the manager and a
//! background task that owns the socket.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::OutboundQueue;
use super::state::ConnectionState;
use crate::config::{ChatConfig, ReconnectPolicy};
use crate::error::{DecodeError, SendError, is_connect_failure};
use crate::models::Message;

/// Callback invoked once per decoded inbound message.
pub(crate) type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a local close waits for the server's close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outcome of a successful [`ConnectionManager::send`](crate::ConnectionManager::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed to the open channel's writer.
    Sent,
    /// Held in the outbound queue until the channel opens.
    Queued,
}

/// Manager-side handle to a room channel.
pub(crate) struct RoomChannel {
    pub room_id: String,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::Sender<String>,
    queue: Arc<Mutex<OutboundQueue>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RoomChannel {
    /// Spawn the channel task. The channel starts in `Connecting`.
    pub fn open(room_id: String, url: Url, handler: MessageHandler, config: &ChatConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);
        let (outbound, out_rx) = mpsc::channel(config.writer_buffer);
        let queue = Arc::new(Mutex::new(OutboundQueue::new(config.queue_capacity)));
        let cancel = CancellationToken::new();

        let task = ChannelTask {
            room_id: room_id.clone(),
            url,
            handler,
            state: state.clone(),
            out_rx,
            queue: queue.clone(),
            cancel: cancel.clone(),
            reconnect: config.reconnect.clone(),
        };
        let task = tokio::spawn(task.run());

        Self {
            room_id,
            state,
            outbound,
            queue,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Hand an encoded frame to the channel without waiting.
    ///
    /// The queue lock is held while the state is read so the task cannot
    /// flip `Connecting → Open` (and drain the queue) in between.
    pub fn send_frame(&self, frame: String) -> Result<SendStatus, SendError> {
        let mut queue = self.queue.lock();
        match self.state() {
            ConnectionState::Open => match self.outbound.try_send(frame) {
                Ok(()) => Ok(SendStatus::Sent),
                Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Backpressure),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::NotConnected),
            },
            state if state.is_pending() && queue.is_enabled() => {
                if queue.enqueue(frame) {
                    Ok(SendStatus::Queued)
                } else {
                    Err(SendError::QueueFull)
                }
            }
            _ => Err(SendError::NotConnected),
        }
    }

    /// Request close and wait for the task to finish.
    pub async fn shutdown(self) {
        let room_id = self.room_id.clone();
        let state = self.state.clone();
        let task = self.begin_close();
        if let Err(e) = task.await {
            error!(room = %room_id, error = %e, "chat channel task failed");
        }
        advance(&state, ConnectionState::Closed);
    }

    /// Request close and let the task finish in the background.
    pub fn close_detached(self) {
        drop(self.begin_close());
    }

    fn begin_close(self) -> JoinHandle<()> {
        advance(&self.state, ConnectionState::Closing);
        self.queue.lock().clear();
        self.cancel.cancel();
        self.task
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Move to `next` if the transition is legal. Returns whether it changed.
fn advance(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

enum ChannelEnd {
    /// Closed by `leave` / room switch.
    Local,
    /// Closed by the server or lost to a transport error.
    Remote,
}

/// Owns the socket for one room across reconnects.
struct ChannelTask {
    room_id: String,
    url: Url,
    handler: MessageHandler,
    state: Arc<watch::Sender<ConnectionState>>,
    out_rx: mpsc::Receiver<String>,
    queue: Arc<Mutex<OutboundQueue>>,
    cancel: CancellationToken,
    reconnect: ReconnectPolicy,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut attempt = 0u32;

        loop {
            debug!(room = %self.room_id, url = %self.url, "connecting chat channel");
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = tokio_tungstenite::connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((ws, _)) => {
                    attempt = 0;
                    if let ChannelEnd::Local = self.pump(ws).await {
                        break;
                    }
                }
                Err(e) if is_connect_failure(&e) => {
                    warn!(room = %self.room_id, error = %e, "chat channel unreachable");
                }
                Err(e) => {
                    error!(room = %self.room_id, error = %e, "chat channel handshake failed");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            if !self.reconnect.allows(attempt) {
                break;
            }

            attempt += 1;
            self.enter_reconnecting(attempt);
            let delay = self.reconnect.delay_for(attempt);
            info!(
                room = %self.room_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting chat channel"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run one connected session until it ends.
    async fn pump(&mut self, ws: WsStream) -> ChannelEnd {
        let (mut sink, mut stream) = ws.split();

        let pending = {
            let mut queue = self.queue.lock();
            if !advance(&self.state, ConnectionState::Open) {
                // Closing won the race with the handshake.
                return ChannelEnd::Local;
            }
            queue.drain()
        };
        info!(room = %self.room_id, "chat channel open");

        if !pending.is_empty() {
            debug!(room = %self.room_id, count = pending.len(), "flushing queued messages");
        }
        for frame in pending {
            if let Err(e) = sink.send(WsFrame::Text(frame.into())).await {
                error!(room = %self.room_id, error = %e, "chat channel write failed");
                return ChannelEnd::Remote;
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close_gracefully(&self.room_id, sink, stream).await;
                    return ChannelEnd::Local;
                }
                Some(frame) = self.out_rx.recv() => {
                    if let Err(e) = sink.send(WsFrame::Text(frame.into())).await {
                        error!(room = %self.room_id, error = %e, "chat channel write failed");
                        return ChannelEnd::Remote;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(WsFrame::Text(text))) => {
                        deliver(&self.room_id, &self.handler, Message::decode(text.as_str()));
                    }
                    Some(Ok(WsFrame::Binary(bytes))) => {
                        deliver(&self.room_id, &self.handler, Message::decode_bytes(&bytes));
                    }
                    Some(Ok(WsFrame::Close(frame))) => {
                        info!(room = %self.room_id, frame = ?frame, "chat channel closed by server");
                        return ChannelEnd::Remote;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(room = %self.room_id, error = %e, "chat channel transport error");
                        return ChannelEnd::Remote;
                    }
                    None => {
                        info!(room = %self.room_id, "chat channel stream ended");
                        return ChannelEnd::Remote;
                    }
                },
            }
        }
    }

    /// Flip to `Reconnecting` and move frames the dead connection never wrote
    /// back to the head of the queue.
    fn enter_reconnecting(&mut self, attempt: u32) {
        let mut queue = self.queue.lock();
        advance(&self.state, ConnectionState::Reconnecting { attempt });
        let unsent = drain_receiver(&mut self.out_rx);
        let dropped = queue.requeue_front(unsent);
        if dropped > 0 {
            warn!(room = %self.room_id, dropped, "unsent messages lost with the connection");
        }
    }
}

/// Runs on every exit of the task, including a panic in the message handler.
/// `Closed` is published under the queue lock, so no send can be accepted
/// after the last frame has been drained.
impl Drop for ChannelTask {
    fn drop(&mut self) {
        let mut queue = self.queue.lock();
        advance(&self.state, ConnectionState::Closed);
        let dropped = queue.drain().len() + drain_receiver(&mut self.out_rx).len();
        drop(queue);

        if dropped > 0 {
            warn!(room = %self.room_id, dropped, "unsent messages lost with the connection");
        }
        info!(room = %self.room_id, "chat channel closed");
    }
}

fn drain_receiver(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn deliver(room_id: &str, handler: &MessageHandler, decoded: Result<Message, DecodeError>) {
    match decoded {
        Ok(message) => {
            debug!(
                room = %room_id,
                id = message.id.as_deref().unwrap_or_default(),
                sender = %message.sender_id,
                "inbound chat message"
            );
            handler(message);
        }
        Err(e) => {
            warn!(room = %room_id, error = %e, "dropping malformed chat frame");
        }
    }
}

async fn close_gracefully(
    room_id: &str,
    mut sink: futures::stream::SplitSink<WsStream, WsFrame>,
    mut stream: futures::stream::SplitStream<WsStream>,
) {
    if let Err(e) = sink.close().await {
        debug!(room = %room_id, error = %e, "close frame not sent");
        return;
    }
    let ack = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(frame)) = stream.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
    if ack.is_err() {
        debug!(room = %room_id, "server did not acknowledge close");
    }
}
