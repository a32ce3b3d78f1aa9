use std::fmt;

/// Lifecycle of the remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What moved the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connect,
    Opened,
    Closed,
    Failed,
    Disconnect,
}

impl SessionState {
    /// Next state, or `None` when the transition is not allowed from here.
    pub fn apply(self, transition: Transition) -> Option<SessionState> {
        use SessionState::*;
        match (self, transition) {
            (Disconnected | Error, Transition::Connect) => Some(Connecting),
            (Connecting, Transition::Opened) => Some(Connected),
            (Connecting | Connected, Transition::Closed) => Some(Disconnected),
            (Connecting | Connected, Transition::Failed) => Some(Error),
            (_, Transition::Disconnect) => Some(Disconnected),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}
