//! gym_chat - real-time chat transport for the gym dashboard
//!
//! Two independent components, coordinated by the caller:
//!
//! - [`ConnectionManager`] keeps one WebSocket channel per chat room
//!   (`ws://<host>/ws/chat/{room}`), delivers decoded inbound messages to a
//!   handler, and accepts or rejects outbound sends based on channel state.
//! - [`ConversationStore`] talks to the history API: persisting messages,
//!   listing and searching conversations.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gym_chat::{ChatConfig, ConnectionManager, ConversationStore, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ChatConfig::new("127.0.0.1:8000");
//!     let manager = Arc::new(ConnectionManager::new(config.clone()));
//!     let store = ConversationStore::new(config);
//!
//!     let history = store.list().await;
//!     println!("{} conversations", history.len());
//!
//!     manager
//!         .join("r1", |msg| println!("{}: {}", msg.sender_id, msg.content))
//!         .unwrap();
//!
//!     // Rejected with NotConnected until the channel is open.
//!     let _ = manager.send(&Message::draft("u1", "hello"));
//!
//!     manager.leave().await;
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod models;

pub use config::{ChatConfig, ReconnectPolicy};
pub use connection::{ConnectionManager, ConnectionState, SendStatus};
pub use error::{AddressError, DecodeError, HistoryError, JoinError, SendError};
pub use history::ConversationStore;
pub use models::{Conversation, Message};
