//! The application's inbound callbacks for one WebSocket connection.

use super::{ConnectionId, ControlOpCode, DataOpCode};
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives complete (reassembled) data messages.
pub type DataReceiver = Box<dyn FnMut(ConnectionId, DataOpCode, Vec<u8>) + Send>;

/// Receives control frame payloads. Control frames are informational: the
/// protocol-level reply (pong, close echo) has already been handled.
pub type ControlReceiver = Box<dyn FnMut(ConnectionId, ControlOpCode, Vec<u8>) + Send>;

#[derive(Default)]
struct Callbacks {
    data: Option<DataReceiver>,
    control: Option<ControlReceiver>,
}

/// The means of receiving from a WebSocket.
///
/// Returned by the application from the `Handler`'s connection-established
/// callback. This is a lightweight handle to shared state; clones observe
/// the same callbacks.
///
/// Fragmented messages are reassembled before delivery: `receive_data` gets
/// the complete message, never individual frames.
///
/// Call [`stop_receiving`](Receivers::stop_receiving) when the callbacks
/// are no longer safe to invoke (typically before tearing down whatever
/// state they capture); deliveries after that are silently dropped and the
/// connection itself stays up.
#[derive(Clone, Default)]
pub struct Receivers {
    inner: Arc<Mutex<Callbacks>>,
}

impl Receivers {
    /// A receiver for both data and control messages.
    pub fn new(
        data: impl FnMut(ConnectionId, DataOpCode, Vec<u8>) + Send + 'static,
        control: impl FnMut(ConnectionId, ControlOpCode, Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Callbacks {
                data: Some(Box::new(data)),
                control: Some(Box::new(control)),
            })),
        }
    }

    /// A receiver for data messages only; control receipts are dropped.
    pub fn with_data(
        data: impl FnMut(ConnectionId, DataOpCode, Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Callbacks {
                data: Some(Box::new(data)),
                control: None,
            })),
        }
    }

    /// A receiver for control receipts only; data messages are dropped.
    pub fn with_control(
        control: impl FnMut(ConnectionId, ControlOpCode, Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Callbacks {
                data: None,
                control: Some(Box::new(control)),
            })),
        }
    }

    /// A receiver that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Deliver a data message. Returns whether a callback was invoked.
    pub fn receive_data(&self, id: ConnectionId, kind: DataOpCode, payload: Vec<u8>) -> bool {
        match self.inner.lock().data.as_mut() {
            Some(callback) => {
                callback(id, kind, payload);
                true
            }
            None => false,
        }
    }

    /// Deliver a control payload. Returns whether a callback was invoked.
    pub fn receive_control(
        &self,
        id: ConnectionId,
        kind: ControlOpCode,
        payload: Vec<u8>,
    ) -> bool {
        match self.inner.lock().control.as_mut() {
            Some(callback) => {
                callback(id, kind, payload);
                true
            }
            None => false,
        }
    }

    /// Clear both callbacks so they are never invoked again.
    pub fn stop_receiving(&self) {
        let mut callbacks = self.inner.lock();
        callbacks.data = None;
        callbacks.control = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> (Receivers, Arc<Mutex<Vec<(ConnectionId, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receivers = Receivers::with_data(move |id, _kind, payload| {
            sink.lock().push((id, payload));
        });
        (receivers, seen)
    }

    #[test]
    fn bound_data_callback_is_invoked() {
        let (receivers, seen) = capture();
        let id = ConnectionId::next();
        assert!(receivers.receive_data(id, DataOpCode::Text, b"hi".to_vec()));
        assert_eq!(seen.lock().as_slice(), &[(id, b"hi".to_vec())]);
    }

    #[test]
    fn clones_share_state() {
        let (receivers, seen) = capture();
        let clone = receivers.clone();
        clone.receive_data(ConnectionId::next(), DataOpCode::Text, b"x".to_vec());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn stop_receiving_silences_both() {
        let (receivers, seen) = capture();
        receivers.stop_receiving();
        let id = ConnectionId::next();
        assert!(!receivers.receive_data(id, DataOpCode::Text, b"hi".to_vec()));
        assert!(!receivers.receive_control(id, ControlOpCode::Ping, Vec::new()));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn disabled_receiver_drops_everything() {
        let receivers = Receivers::disabled();
        let id = ConnectionId::next();
        assert!(!receivers.receive_data(id, DataOpCode::Binary, Vec::new()));
        assert!(!receivers.receive_control(id, ControlOpCode::Close, Vec::new()));
    }
}
