//! RFC 6455 WebSocket wire encoding.
//!
//! This crate provides the protocol-level building blocks used by
//! `portico-httpd`:
//!
//! - [`frame`] — frame header encode/decode and a stateful streaming
//!   [`Decoder`] that assembles frames from arbitrary read chunks
//! - [`closestatus`] — typed close status codes and close payload helpers
//! - [`handshake`] — the `Sec-WebSocket-Accept` digest
//!
//! Nothing here performs I/O; callers feed bytes in and write bytes out.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

pub mod closestatus;
pub mod frame;
pub mod handshake;

pub use closestatus::{CloseStatus, close_payload, parse_close_payload};
pub use frame::{DecodeResult, Decoder, Frame, FrameError, FrameHeader, OpCode};
pub use handshake::{WS_GUID, accept_key};
