//! Error types for the channel and history halves of the chat core.

use tokio_tungstenite::tungstenite;

/// An inbound frame (or history response body) that does not decode into a
/// complete [`Message`](crate::Message).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message field `{0}` is empty")]
    EmptyField(&'static str),

    #[error("binary frame is not utf-8")]
    NotUtf8,
}

/// The configured host does not form a valid URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chat server address {0}")]
pub struct AddressError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("room id must not be empty")]
    EmptyRoom,

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}

/// Why a [`ConnectionManager::send`](crate::ConnectionManager::send) was refused.
///
/// Always returned synchronously; a refused send is never retried by the manager.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("message is addressed to room {payload} but the joined room is {joined}")]
    RoomMismatch { payload: String, joined: String },

    #[error("outbound queue is full")]
    QueueFull,

    #[error("channel writer is saturated")]
    Backpressure,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of a single history request.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history service is unavailable")]
    Unavailable,

    #[error("history request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("history service responded {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed history response: {0}")]
    Decode(#[from] DecodeError),

    #[error("message has no room id")]
    MissingRoom,

    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
}

impl HistoryError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Request(err)
        }
    }
}

/// Classify a tungstenite failure for logging: connection-level failures are
/// expected during network instability, everything else is a protocol fault.
pub(crate) fn is_connect_failure(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Io(io_err) => matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
        ),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        _ => false,
    }
}
