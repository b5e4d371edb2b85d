use std::fmt;

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleKind;

/// Session lifecycle state.
///
/// Transitions are a pure function of the current state and the input; the
/// session owns the only mutable copy and applies what these methods return.
/// `None` means "no transition" (the notification may still reach its observer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Booting,
    Connected,
    Disconnected,
    Reconnecting,
    Errored,
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Booting => "booting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Errored => "errored",
            Self::Closed => "closed",
        }
    }

    /// Session creation requested.
    pub fn on_boot_started(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Booting),
            _ => None,
        }
    }

    /// Engine could not be obtained or the client factory yielded nothing usable.
    pub fn on_boot_failed(self) -> Option<Self> {
        match self {
            Self::Idle | Self::Booting => Some(Self::Errored),
            _ => None,
        }
    }

    /// Explicit close. `Closed` is absorbing.
    pub fn on_close(self) -> Option<Self> {
        match self {
            Self::Closed => None,
            _ => Some(Self::Closed),
        }
    }

    /// Engine-originated lifecycle notification.
    ///
    /// `Errored` is not terminal: the protocol library keeps retrying on its
    /// own, so a later attempt or successful reconnect moves the session on.
    pub fn on_lifecycle(self, kind: LifecycleKind, auto_reconnect: bool) -> Option<Self> {
        use LifecycleKind as K;
        let next = match (self, kind) {
            (Self::Closed | Self::Idle, _) => return None,

            (Self::Booting | Self::Disconnected | Self::Reconnecting | Self::Errored, K::Connect) => {
                Self::Connected
            }
            (Self::Disconnected | Self::Reconnecting | Self::Errored, K::Reconnect) => Self::Connected,

            (Self::Connected | Self::Reconnecting, K::Disconnect) => Self::Disconnected,

            (Self::Disconnected | Self::Errored, K::ReconnectAttempt) if auto_reconnect => {
                Self::Reconnecting
            }

            (Self::Disconnected | Self::Reconnecting, K::ReconnectError | K::ReconnectFailed) => {
                Self::Errored
            }

            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
