//! WebSocket-side types: connection identity, send results, and the
//! application-facing [`Handler`], [`Senders`] and [`Receivers`] handles.

pub(crate) mod connection;
pub mod handler;
pub mod receivers;
pub mod senders;

pub use handler::{Connection, Handler};
pub use receivers::Receivers;
pub use senders::Senders;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter shared by every `Server` in the process; never reset, so ids are
/// unique process-wide.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier for an accepted WebSocket connection.
///
/// Assigned at upgrade time, before any bytes of the connection reach the
/// application, and never reused within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a [`Senders`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The frame (or every fragment of it) was written.
    Success,
    /// The write failed or the arguments were unusable.
    Failure,
    /// The close handshake has started; nothing further can be sent.
    Closed,
    /// The handle was never bound to a connection.
    NoImplementation,
}

/// Kind of a complete data message delivered to [`Receivers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOpCode {
    Text,
    Binary,
}

/// Kind of a control frame delivered to [`Receivers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOpCode {
    Close,
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_monotonic_and_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let c = ConnectionId::next();
        assert!(a < b && b < c);
        assert_ne!(a.as_u64(), c.as_u64());
    }
}
