//! Real-time chat channels.
//!
//! - `state`: per-room connection state machine
//! - `queue`: bounded outbound queue for sends made before a channel opens
//! - `channel`: one room's socket task and its manager-side handle
//! - `manager`: the `ConnectionManager` that tracks room channels

mod channel;
mod manager;
mod queue;
mod state;

pub use channel::SendStatus;
pub use manager::ConnectionManager;
pub use state::ConnectionState;
