//! The application's outbound interface for one WebSocket connection.

use super::SendResult;
use parking_lot::Mutex;
use portico_codec::CloseStatus;
use std::sync::Arc;

pub(crate) type DataSender = Box<dyn Fn(&str, usize) -> SendResult + Send + Sync>;
pub(crate) type CloseSender = Box<dyn Fn(CloseStatus, &str) -> SendResult + Send + Sync>;
pub(crate) type PingSender = Box<dyn Fn(&[u8]) -> SendResult + Send + Sync>;
pub(crate) type PongSender = PingSender;

/// The four send slots, cleared together when the close handshake starts.
pub(crate) struct SenderCallbacks {
    pub data: DataSender,
    pub close: CloseSender,
    pub ping: PingSender,
    pub pong: PongSender,
}

struct SendersImpl {
    callbacks: Mutex<Option<Arc<SenderCallbacks>>>,
}

/// The means of writing to a WebSocket.
///
/// Handed to the application inside the `Connection` value when a
/// connection is established. A lightweight handle: clone it freely and
/// keep a copy wherever sends happen.
///
/// A default-constructed `Senders` was never bound to a connection and
/// returns [`SendResult::NoImplementation`] from every method. A bound
/// handle returns [`SendResult::Closed`] once the close handshake has
/// started (in either direction).
#[derive(Clone, Default)]
pub struct Senders {
    inner: Option<Arc<SendersImpl>>,
}

impl Senders {
    pub(crate) fn bound(callbacks: SenderCallbacks) -> Self {
        Self {
            inner: Some(Arc::new(SendersImpl {
                callbacks: Mutex::new(Some(Arc::new(callbacks))),
            })),
        }
    }

    /// Invalidate all four slots. Called by the connection when the close
    /// handshake starts; subsequent sends return `Closed`.
    pub(crate) fn close_senders(&self) {
        if let Some(inner) = &self.inner {
            inner.callbacks.lock().take();
        }
    }

    /// Take a snapshot of the callbacks without holding the lock across the
    /// send itself, so a send may invalidate the handle it was called on.
    fn snapshot(&self) -> Result<Arc<SenderCallbacks>, SendResult> {
        match &self.inner {
            None => Err(SendResult::NoImplementation),
            Some(inner) => inner
                .callbacks
                .lock()
                .clone()
                .ok_or(SendResult::Closed),
        }
    }

    /// Send a complete text message.
    ///
    /// With `max_frame_size == 0` the message goes out as a single frame.
    /// Otherwise it is split so no frame (header included) exceeds
    /// `max_frame_size` bytes; a limit smaller than the header itself fails.
    pub fn send_data(&self, message: &str, max_frame_size: usize) -> SendResult {
        match self.snapshot() {
            Ok(callbacks) => (callbacks.data)(message, max_frame_size),
            Err(result) => result,
        }
    }

    /// Send a close frame and start the close handshake. All four send
    /// methods return `Closed` from this point on.
    pub fn send_close(&self, status: CloseStatus, reason: &str) -> SendResult {
        match self.snapshot() {
            Ok(callbacks) => (callbacks.close)(status, reason),
            Err(result) => result,
        }
    }

    /// Send a ping control frame (payload at most 125 bytes).
    pub fn send_ping(&self, payload: &[u8]) -> SendResult {
        match self.snapshot() {
            Ok(callbacks) => (callbacks.ping)(payload),
            Err(result) => result,
        }
    }

    /// Send a pong control frame (payload at most 125 bytes).
    ///
    /// Rarely needed: pings from the peer are answered automatically.
    pub fn send_pong(&self, payload: &[u8]) -> SendResult {
        match self.snapshot() {
            Ok(callbacks) => (callbacks.pong)(payload),
            Err(result) => result,
        }
    }
}
