//! ConnectionManager: the per-room real-time channels of one chat client.
//!
//! Channels are tracked in an explicit room → handle map. Only one room is
//! active at a time; joining another room closes the previous channel before
//! the new one is tracked.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::channel::{RoomChannel, SendStatus};
use super::state::ConnectionState;
use crate::config::ChatConfig;
use crate::error::{JoinError, SendError};
use crate::models::{Message, OutboundMessage};

#[derive(Default)]
struct Slots {
    active: Option<String>,
    channels: HashMap<String, RoomChannel>,
    /// Reported when no channel is active: `Idle` before the first join,
    /// `Closed` after a leave.
    detached: ConnectionState,
}

impl Slots {
    fn active_channel(&self) -> Option<(&str, &RoomChannel)> {
        let room = self.active.as_deref()?;
        self.channels.get(room).map(|ch| (room, ch))
    }
}

/// Owns the real-time chat channels for one client.
///
/// Construct one per process at the composition root and share it behind an
/// `Arc`. All methods except [`leave`](Self::leave) and
/// [`disconnect`](Self::disconnect) are synchronous and never wait on the
/// network.
pub struct ConnectionManager {
    config: ChatConfig,
    slots: Mutex<Slots>,
}

impl ConnectionManager {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Open the channel for `room_id` and make it the active room.
    ///
    /// Returns as soon as the channel is `Connecting`; `on_message` is called
    /// from the channel task for every inbound frame that decodes into a full
    /// [`Message`]. Malformed frames are logged and dropped. If `on_message`
    /// panics the channel ends and reports `Closed`.
    ///
    /// Any channel already tracked (for this or another room) is closed first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn join<F>(&self, room_id: &str, on_message: F) -> Result<(), JoinError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if room_id.is_empty() {
            return Err(JoinError::EmptyRoom);
        }
        let url = self.config.channel_url(room_id)?;

        let mut slots = self.slots.lock();
        for (room, previous) in slots.channels.drain() {
            info!(room = %room, next = %room_id, "closing previous room channel");
            previous.close_detached();
        }

        info!(room = %room_id, "joining chat room");
        let channel = RoomChannel::open(room_id.to_string(), url, Arc::new(on_message), &self.config);
        slots.channels.insert(room_id.to_string(), channel);
        slots.active = Some(room_id.to_string());
        Ok(())
    }

    /// Send a message on the active room's channel.
    ///
    /// If the payload names a room it must be the active one; otherwise the
    /// active room is filled in. Only an `Open` channel transmits; a pending
    /// channel queues the frame when the outbound queue is enabled.
    pub fn send(&self, payload: &Message) -> Result<SendStatus, SendError> {
        let slots = self.slots.lock();
        let Some((room, channel)) = slots.active_channel() else {
            debug!("send rejected: no room joined");
            return Err(SendError::NotConnected);
        };

        if let Some(target) = payload.room_id.as_deref() {
            if target != room {
                return Err(SendError::RoomMismatch {
                    payload: target.to_string(),
                    joined: room.to_string(),
                });
            }
        }

        let frame = serde_json::to_string(&OutboundMessage::new(room, payload))?;
        let result = channel.send_frame(frame);
        match &result {
            Ok(status) => debug!(room = %room, ?status, "chat message accepted"),
            Err(e) => debug!(room = %room, state = %channel.state(), error = %e, "send rejected"),
        }
        result
    }

    /// Close the active room's channel and wait for it to finish.
    /// A no-op when nothing is joined.
    pub async fn leave(&self) {
        let channel = {
            let mut slots = self.slots.lock();
            let Some(room) = slots.active.take() else {
                return;
            };
            slots.detached = ConnectionState::Closed;
            slots.channels.remove(&room)
        };

        if let Some(channel) = channel {
            let room = channel.room_id.clone();
            channel.shutdown().await;
            info!(room = %room, "left chat room");
        }
    }

    /// Close every tracked channel. Idempotent.
    pub async fn disconnect(&self) {
        let channels: Vec<RoomChannel> = {
            let mut slots = self.slots.lock();
            if slots.active.take().is_some() || !slots.channels.is_empty() {
                slots.detached = ConnectionState::Closed;
            }
            slots.channels.drain().map(|(_, ch)| ch).collect()
        };
        if channels.is_empty() {
            return;
        }
        let count = channels.len();
        futures::future::join_all(channels.into_iter().map(RoomChannel::shutdown)).await;
        info!(count, "chat channels disconnected");
    }

    /// Current state of the active room's channel.
    pub fn state(&self) -> ConnectionState {
        let slots = self.slots.lock();
        match slots.active_channel() {
            Some((_, channel)) => channel.state(),
            None => slots.detached,
        }
    }

    /// Watch the active room's channel state. With no active room the
    /// receiver holds the current detached state and never changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        let slots = self.slots.lock();
        match slots.active_channel() {
            Some((_, channel)) => channel.subscribe(),
            None => watch::channel(slots.detached).1,
        }
    }

    pub fn active_room(&self) -> Option<String> {
        self.slots.lock().active.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for channel in self.slots.get_mut().channels.values() {
            channel.cancel();
        }
    }
}
