//! Process-wide chat flags and the shared topic.

use std::fmt;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Not logged on.
    #[default]
    Offline,
    /// Logged on, waiting for the network or for the settle delay.
    Connecting,
    /// Logged on and settled.
    Online,
    /// Logged on, but the network went away.
    Suspended,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offline => "offline",
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Suspended => "connection lost",
        };
        f.write_str(name)
    }
}

/// Flags reset on every logoff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    /// LOGON was sent and no LOGOFF since.
    pub logged_on: bool,
    /// The settle delay after logon has passed with the network up.
    pub logon_completed: bool,
    /// The local user is typing.
    pub wrote: bool,
    /// Lifecycle phase.
    pub phase: ConnectionPhase,
}

impl ChatState {
    /// Back to the logged-off state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The channel topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    /// Topic text. Empty when no topic is set.
    pub text: String,
    /// Nick of whoever set it.
    pub nick: String,
    /// When it was set, in milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Topic {
    /// Creates a topic.
    pub fn new(text: impl Into<String>, nick: impl Into<String>, timestamp: i64) -> Self {
        Self {
            text: text.into(),
            nick: nick.into(),
            timestamp,
        }
    }

    /// Whether a topic is set.
    #[must_use]
    pub const fn is_set(&self) -> bool {
        !self.text.is_empty()
    }

    /// Apply `other` if it is newer, or equally old with different content.
    /// Returns whether anything changed.
    pub fn change(&mut self, other: &Self) -> bool {
        let newer = other.timestamp > self.timestamp;
        let same_time_different = other.timestamp == self.timestamp
            && (other.text != self.text || other.nick != self.nick);
        if newer || same_time_different {
            self.clone_from(other);
            true
        } else {
            false
        }
    }

    /// Clear to no topic.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "{} ({})", self.text, self.nick)
        } else {
            Ok(())
        }
    }
}
