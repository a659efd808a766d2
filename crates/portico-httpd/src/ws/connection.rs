//! Per-connection WebSocket state machine.
//!
//! One [`WsConnection`] manages a single established WebSocket: it turns
//! inbound bytes into application-level messages (reassembling fragmented
//! ones), answers control frames, runs the bidirectional close handshake,
//! and carries the synchronous send path used by the [`Senders`] handle.
//!
//! Reads happen on the server's WebSocket I/O thread when the poller
//! reports the fd readable; sends happen on whatever thread the
//! application calls from. Inbound dispatch state (decoder, assembly
//! buffer) is only ever touched by the I/O thread; the close phase and the
//! socket write path are shared and carry their own locks.

use super::handler::Connection;
use super::receivers::Receivers;
use super::senders::{SenderCallbacks, Senders};
use super::{ConnectionId, ControlOpCode, DataOpCode, SendResult};
use crate::http::upgrade::UpgradedSocket;
use log::{debug, warn};
use parking_lot::Mutex;
use portico_codec::{close_payload, CloseStatus, Decoder, FrameHeader, OpCode};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How long a server-initiated close waits for the peer's confirmation
/// before the connection is torn down unilaterally.
pub(crate) const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Progress of the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClosePhase {
    None,
    ServerInitiated,
    ClientInitiated,
    Complete,
}

struct CloseState {
    phase: ClosePhase,
    /// Stamped when the server sends its close frame.
    sent_at: Option<Instant>,
}

/// A fragmented data message in progress.
struct Assembly {
    kind: DataOpCode,
    payload: Vec<u8>,
}

/// Inbound state, touched only on the WebSocket I/O thread.
struct RecvState {
    decoder: Decoder,
    assembly: Option<Assembly>,
}

/// Asks the server to destroy this connection on the next sweep.
pub(crate) type CloseCallback = Box<dyn Fn(ConnectionId) + Send + Sync>;

pub(crate) struct WsConnection {
    id: ConnectionId,
    url: String,
    fd: RawFd,
    max_recv: usize,
    socket: Mutex<Option<Box<dyn UpgradedSocket>>>,
    /// Serializes writes so frames from different threads never interleave.
    write_lock: Mutex<()>,
    recv: Mutex<RecvState>,
    close: Mutex<CloseState>,
    /// Set when the connection must be destroyed regardless of close phase.
    destroy_now: AtomicBool,
    receivers: Mutex<Receivers>,
    senders: Senders,
    close_callback: CloseCallback,
}

impl WsConnection {
    pub(crate) fn new(
        id: ConnectionId,
        url: String,
        max_recv: usize,
        socket: Box<dyn UpgradedSocket>,
        close_callback: CloseCallback,
    ) -> Arc<Self> {
        let fd = socket.raw_fd();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            // The send slots hold the connection weakly: a handle kept by
            // the application must not keep a torn-down connection alive.
            let data: super::senders::DataSender = {
                let weak = weak.clone();
                Box::new(move |message: &str, max_frame_size: usize| {
                    weak.upgrade().map_or(SendResult::Closed, |conn| {
                        conn.send_message(message, max_frame_size)
                    })
                })
            };
            let close: super::senders::CloseSender = {
                let weak = weak.clone();
                Box::new(move |status: CloseStatus, reason: &str| {
                    weak.upgrade()
                        .map_or(SendResult::Closed, |conn| conn.send_close(status, reason))
                })
            };
            let ping: super::senders::PingSender = {
                let weak = weak.clone();
                Box::new(move |payload: &[u8]| {
                    weak.upgrade()
                        .map_or(SendResult::Closed, |conn| conn.send_control(OpCode::Ping, payload))
                })
            };
            let pong: super::senders::PongSender = {
                let weak = weak.clone();
                Box::new(move |payload: &[u8]| {
                    weak.upgrade()
                        .map_or(SendResult::Closed, |conn| conn.send_control(OpCode::Pong, payload))
                })
            };

            Self {
                id,
                url,
                fd,
                max_recv,
                socket: Mutex::new(Some(socket)),
                write_lock: Mutex::new(()),
                recv: Mutex::new(RecvState {
                    decoder: Decoder::new(),
                    assembly: None,
                }),
                close: Mutex::new(CloseState {
                    phase: ClosePhase::None,
                    sent_at: None,
                }),
                destroy_now: AtomicBool::new(false),
                receivers: Mutex::new(Receivers::disabled()),
                senders: Senders::bound(SenderCallbacks {
                    data,
                    close,
                    ping,
                    pong,
                }),
                close_callback,
            }
        })
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// The `Connection` value handed to the application.
    pub(crate) fn app_connection(&self) -> Connection {
        Connection {
            id: self.id,
            url: self.url.clone(),
            senders: self.senders.clone(),
        }
    }

    /// Install the receivers returned by the application.
    pub(crate) fn set_receivers(&self, receivers: Receivers) {
        *self.receivers.lock() = receivers;
    }

    fn receivers(&self) -> Receivers {
        self.receivers.lock().clone()
    }

    // ------------------------------------------------------------------
    // Inbound path (WebSocket I/O thread)
    // ------------------------------------------------------------------

    /// Poller callback: the socket is readable. Returns `false` when the
    /// fd should leave the poll set.
    pub(crate) fn on_readable(&self) -> bool {
        // One recv per readiness event; anything left over wakes the next
        // poll immediately, so a bounded buffer costs only an extra tick.
        let mut buf = vec![0u8; self.max_recv];
        #[allow(unsafe_code)]
        let received = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };

        if received < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code)
                    if code == libc::EAGAIN
                        || code == libc::EWOULDBLOCK
                        || code == libc::EINTR =>
                {
                    true
                }
                _ => {
                    warn!("connection {}: recv failed: {err}", self.id);
                    self.request_destroy();
                    false
                }
            };
        }

        if received == 0 {
            debug!("connection {}: closed by peer", self.id);
            self.request_destroy();
            return false;
        }

        self.handle_bytes(&buf[..received as usize])
    }

    /// Feed raw socket bytes through the decoder and dispatch every
    /// complete frame. Returns `false` when the connection is done reading.
    pub(crate) fn handle_bytes(&self, bytes: &[u8]) -> bool {
        let mut recv = self.recv.lock();
        let decoded = recv.decoder.decode(bytes);

        for frame in decoded.frames {
            if !self.dispatch_frame(&mut recv.assembly, frame) {
                return false;
            }
        }

        if let Some(error) = decoded.error {
            warn!("connection {}: {error}", self.id);
            self.protocol_error_close(&error.to_string());
            return false;
        }

        true
    }

    fn dispatch_frame(
        &self,
        assembly: &mut Option<Assembly>,
        frame: portico_codec::Frame,
    ) -> bool {
        // RFC 6455 §5.1: every client frame must be masked.
        if !frame.header.masked() {
            self.protocol_error_close("client frames must be masked");
            return false;
        }

        match frame.header.opcode {
            OpCode::Text => {
                self.on_data_frame(assembly, DataOpCode::Text, frame.header.fin, frame.payload)
            }
            OpCode::Binary => self.on_data_frame(
                assembly,
                DataOpCode::Binary,
                frame.header.fin,
                frame.payload,
            ),
            OpCode::Continuation => {
                self.on_continuation_frame(assembly, frame.header.fin, frame.payload)
            }
            OpCode::Close => self.on_close_frame(frame.payload),
            OpCode::Ping => {
                self.receivers()
                    .receive_control(self.id, ControlOpCode::Ping, frame.payload.clone());
                let header = FrameHeader::new(OpCode::Pong, frame.payload.len() as u64);
                if self.send_frame(&header, &frame.payload) != SendResult::Success {
                    warn!("connection {}: failed to answer ping", self.id);
                }
                true
            }
            OpCode::Pong => {
                // Unsolicited pongs are permitted; nothing to do beyond
                // letting the application observe them.
                self.receivers()
                    .receive_control(self.id, ControlOpCode::Pong, frame.payload);
                true
            }
        }
    }

    fn on_data_frame(
        &self,
        assembly: &mut Option<Assembly>,
        kind: DataOpCode,
        fin: bool,
        payload: Vec<u8>,
    ) -> bool {
        if assembly.is_some() {
            let reason = match kind {
                DataOpCode::Text => "Unexpected text frame received, expected continuation.",
                DataOpCode::Binary => "Unexpected binary frame received, expected continuation.",
            };
            self.protocol_error_close(reason);
            return false;
        }

        if fin {
            self.receivers().receive_data(self.id, kind, payload);
        } else {
            *assembly = Some(Assembly { kind, payload });
        }
        true
    }

    fn on_continuation_frame(
        &self,
        assembly: &mut Option<Assembly>,
        fin: bool,
        payload: Vec<u8>,
    ) -> bool {
        let Some(mut message) = assembly.take() else {
            self.protocol_error_close("Unexpected continuation frame received.");
            return false;
        };

        message.payload.extend_from_slice(&payload);
        if fin {
            self.receivers()
                .receive_data(self.id, message.kind, message.payload);
        } else {
            *assembly = Some(message);
        }
        true
    }

    fn on_close_frame(&self, payload: Vec<u8>) -> bool {
        // Pass the receipt out even when we are awaiting a confirmation;
        // the application may want to see the peer's code and reason.
        self.receivers()
            .receive_control(self.id, ControlOpCode::Close, payload.clone());

        let mut close = self.close.lock();
        match close.phase {
            ClosePhase::None => {
                close.phase = ClosePhase::ClientInitiated;
                drop(close);

                self.senders.close_senders();

                // Parrot the payload back unmasked, status code and reason
                // included (RFC 6455 §5.5.1).
                let header = FrameHeader::new(OpCode::Close, payload.len() as u64);
                if self.send_frame(&header, &payload) != SendResult::Success {
                    warn!("connection {}: failed to echo close frame", self.id);
                }
                self.request_destroy();
            }
            ClosePhase::ServerInitiated => {
                close.phase = ClosePhase::Complete;
                drop(close);
                self.request_destroy();
            }
            ClosePhase::ClientInitiated | ClosePhase::Complete => {
                // Already answered; nothing more to send.
            }
        }

        false
    }

    // ------------------------------------------------------------------
    // Outbound path (any thread, via Senders)
    // ------------------------------------------------------------------

    /// Send a complete text message, split into `max_frame_size`-bounded
    /// frames when a limit is given.
    fn send_message(&self, message: &str, max_frame_size: usize) -> SendResult {
        if self.close.lock().phase != ClosePhase::None {
            return SendResult::Closed;
        }

        let payload = message.as_bytes();
        // Computed from the whole payload, which bounds the header size of
        // any slice of it.
        let header_len = FrameHeader::encoded_len_for(payload.len() as u64, false);
        if max_frame_size != 0 && max_frame_size <= header_len {
            warn!(
                "connection {}: max frame size {max_frame_size} cannot fit a frame header",
                self.id
            );
            return SendResult::Failure;
        }

        let mut remaining = payload;
        let mut first = true;

        if max_frame_size > 0 {
            while remaining.len() + header_len > max_frame_size {
                let slice_len = max_frame_size - header_len;
                let opcode = if first { OpCode::Text } else { OpCode::Continuation };
                let mut header = FrameHeader::new(opcode, slice_len as u64);
                header.fin = false;

                let result = self.send_frame(&header, &remaining[..slice_len]);
                if result != SendResult::Success {
                    return result;
                }
                remaining = &remaining[slice_len..];
                first = false;
            }
        }

        let opcode = if first { OpCode::Text } else { OpCode::Continuation };
        let header = FrameHeader::new(opcode, remaining.len() as u64);
        self.send_frame(&header, remaining)
    }

    /// Application-initiated close: send the close frame, invalidate the
    /// senders, and wait (bounded) for the peer's confirmation.
    fn send_close(&self, status: CloseStatus, reason: &str) -> SendResult {
        {
            let mut close = self.close.lock();
            if close.phase != ClosePhase::None {
                return SendResult::Closed;
            }
            close.phase = ClosePhase::ServerInitiated;
            close.sent_at = Some(Instant::now());
        }

        self.senders.close_senders();

        let payload = close_payload(status, reason);
        let header = FrameHeader::new(OpCode::Close, payload.len() as u64);
        let result = self.send_frame(&header, &payload);

        // Not destroy_now: the sweep waits for the confirmation close (or
        // the timeout) before tearing the connection down.
        (self.close_callback)(self.id);

        result
    }

    fn send_control(&self, opcode: OpCode, payload: &[u8]) -> SendResult {
        if self.close.lock().phase != ClosePhase::None {
            return SendResult::Closed;
        }
        if payload.len() > 125 {
            warn!(
                "connection {}: control payload of {} bytes exceeds 125",
                self.id,
                payload.len()
            );
            return SendResult::Failure;
        }
        let header = FrameHeader::new(opcode, payload.len() as u64);
        self.send_frame(&header, payload)
    }

    /// Encode and write one frame, looping over partial and interrupted
    /// sends until every byte is out.
    fn send_frame(&self, header: &FrameHeader, payload: &[u8]) -> SendResult {
        let mut frame = header.encode();
        frame.extend_from_slice(payload);

        let _write = self.write_lock.lock();
        let mut sent = 0;
        while sent < frame.len() {
            #[allow(unsafe_code)]
            let n = unsafe {
                libc::send(
                    self.fd,
                    frame[sent..].as_ptr().cast(),
                    frame.len() - sent,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(code)
                        if code == libc::EAGAIN
                            || code == libc::EWOULDBLOCK
                            || code == libc::EINTR =>
                    {
                        continue;
                    }
                    _ => {
                        warn!(
                            "connection {}: failed to send {} bytes: {err}",
                            self.id,
                            frame.len()
                        );
                        return SendResult::Failure;
                    }
                }
            }
            sent += n as usize;
        }

        SendResult::Success
    }

    // ------------------------------------------------------------------
    // Close handshake and teardown
    // ------------------------------------------------------------------

    /// Protocol violation: send Close 1002 with `reason` and request
    /// immediate destruction.
    fn protocol_error_close(&self, reason: &str) {
        {
            let mut close = self.close.lock();
            if close.phase != ClosePhase::None {
                self.request_destroy();
                return;
            }
            close.phase = ClosePhase::ServerInitiated;
        }

        self.senders.close_senders();

        let payload = close_payload(CloseStatus::ProtocolError, reason);
        let header = FrameHeader::new(OpCode::Close, payload.len() as u64);
        if self.send_frame(&header, &payload) != SendResult::Success {
            warn!("connection {}: failed to send protocol error close", self.id);
        }

        self.request_destroy();
    }

    fn request_destroy(&self) {
        self.destroy_now.store(true, Ordering::Release);
        (self.close_callback)(self.id);
    }

    /// Whether the sweep may destroy this connection now. A
    /// server-initiated close holds the connection until the confirmation
    /// arrives or [`CLOSE_HANDSHAKE_TIMEOUT`] passes.
    pub(crate) fn ready_to_destroy(&self, now: Instant) -> bool {
        if self.destroy_now.load(Ordering::Acquire) {
            return true;
        }

        let close = self.close.lock();
        match (close.phase, close.sent_at) {
            (ClosePhase::ServerInitiated, Some(sent_at)) => {
                let expired = now.duration_since(sent_at) >= CLOSE_HANDSHAKE_TIMEOUT;
                if expired {
                    warn!(
                        "connection {}: no close confirmation within {} ms, destroying",
                        self.id,
                        CLOSE_HANDSHAKE_TIMEOUT.as_millis()
                    );
                }
                expired
            }
            _ => true,
        }
    }

    /// Close-handshake teardown used by server shutdown: sends Close 1001
    /// to any connection that has not started closing yet.
    pub(crate) fn send_going_away(&self) {
        {
            let mut close = self.close.lock();
            if close.phase != ClosePhase::None {
                return;
            }
            close.phase = ClosePhase::ServerInitiated;
        }
        self.senders.close_senders();

        let payload = close_payload(CloseStatus::GoingAway, "Going Away");
        let header = FrameHeader::new(OpCode::Close, payload.len() as u64);
        let _ = self.send_frame(&header, &payload);
    }

    /// Close the socket through the HTTP layer's upgrade-close affordance.
    /// Safe to call more than once; only the first call does anything.
    pub(crate) fn close_socket(&self) {
        if let Some(mut socket) = self.socket.lock().take() {
            socket.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn close_phase(&self) -> ClosePhase {
        self.close.lock().phase
    }

    #[cfg(test)]
    pub(crate) fn senders(&self) -> Senders {
        self.senders.clone()
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close_socket();
    }
}
