use std::fmt;

/// Lifecycle of one room's channel.
///
/// `Idle → Connecting → Open → Closed`, with `Closing` in between on a local
/// leave. `Reconnecting` only appears when automatic reconnection is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting {
        attempt: u32,
    },
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Handshake in flight: a send now could be queued instead of rejected.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    /// `Closed` is final for a channel; `Closing` may only become `Closed`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        match (*self, next) {
            (ConnectionState::Closed, _) => false,
            (ConnectionState::Closing, ConnectionState::Closed) => true,
            (ConnectionState::Closing, _) => false,
            (current, next) => current != next,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}
