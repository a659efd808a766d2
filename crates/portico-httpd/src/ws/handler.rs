//! Application entry point for accepting WebSocket connections.

use super::receivers::Receivers;
use super::senders::Senders;
use super::ConnectionId;
use parking_lot::Mutex;
use std::sync::Arc;

type IsHandled = Box<dyn Fn(&str) -> bool + Send>;
type ConnectionEstablished = Box<dyn FnMut(Connection) -> Receivers + Send>;

/// An established connection, handed to the application.
pub struct Connection {
    pub id: ConnectionId,
    /// URL path of the original upgrade request.
    pub url: String,
    /// Sending half; keep a clone of this for as long as you want to write.
    pub senders: Senders,
}

struct HandlerFns {
    is_handled: Option<IsHandled>,
    connection_established: Option<ConnectionEstablished>,
}

/// Decides which URLs may upgrade and receives established connections.
///
/// Install one on the server at construction time. When an upgrade request
/// arrives, `is_handled` is consulted with the URL path; if it accepts and
/// the handshake validates, the upgrade is performed and
/// `connection_established` is called with a [`Connection`] carrying the
/// [`Senders`] for that connection. Its return value is the [`Receivers`]
/// through which inbound traffic is delivered.
///
/// A lightweight handle to shared state: keep a clone after passing it to
/// the server. Call [`stop_handling`](Handler::stop_handling) once the
/// callbacks are no longer safe to invoke; upgrade attempts from then on
/// are refused.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<Mutex<HandlerFns>>,
}

impl Handler {
    pub fn new(
        is_handled: impl Fn(&str) -> bool + Send + 'static,
        connection_established: impl FnMut(Connection) -> Receivers + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HandlerFns {
                is_handled: Some(Box::new(is_handled)),
                connection_established: Some(Box::new(connection_established)),
            })),
        }
    }

    /// Whether an upgrade request for `url` should be accepted.
    pub fn is_handled(&self, url: &str) -> bool {
        match self.inner.lock().is_handled.as_ref() {
            Some(callback) => callback(url),
            None => false,
        }
    }

    /// Invoke the connection-established callback. After `stop_handling`
    /// the connection still comes up, but with disabled receivers.
    pub(crate) fn connection_established(&self, connection: Connection) -> Receivers {
        match self.inner.lock().connection_established.as_mut() {
            Some(callback) => callback(connection),
            None => Receivers::disabled(),
        }
    }

    /// Clear both callbacks so they are never invoked again.
    pub fn stop_handling(&self) {
        let mut fns = self.inner.lock();
        fns.is_handled = None;
        fns.connection_established = None;
    }
}
