//! An embeddable HTTP(S) server that also speaks WebSocket.
//!
//! The embedder supplies a request handler returning a [`Response`] for
//! every regular HTTP request, and optionally a [`Handler`] that decides
//! which URLs may upgrade to WebSocket and then exchanges framed messages
//! on the accepted connections.
//!
//! # Architecture
//!
//! Two long-lived threads cooperate per server instance:
//!
//! 1. The HTTP daemon thread parses requests, answers them through the
//!    request handler, and performs the RFC 6455 upgrade negotiation.
//! 2. The WebSocket I/O thread multiplexes every upgraded socket through
//!    one `poll(2)` loop, decoding frames, reassembling fragmented
//!    messages, answering pings, and running the close handshake.
//!
//! Application callbacks run on whichever of these threads owns the
//! event. Callbacks for one connection never run concurrently, but be
//! prepared for callbacks on either thread.
//!
//! # Sending and receiving
//!
//! Each accepted connection yields a [`Connection`] carrying a
//! [`Senders`] handle; the application returns a [`Receivers`] with its
//! inbound callbacks. Both are lock-guarded shared handles that can be
//! cloned and carried across threads, and both fall silent once the close
//! handshake starts ([`Senders`] calls then return
//! [`SendResult::Closed`]).

#![deny(unsafe_code)]
// recv/send/poll on raw fds are the one sanctioned exception.
#![allow(clippy::cast_possible_truncation)]

pub mod http;
pub mod poller;
pub mod server;
pub mod ws;

pub use http::{Headers, HttpVersion, Method, PostKeyValues, TlsError, UpgradedSocket};
pub use portico_codec::CloseStatus;
pub use server::{Config, Response, Server, ServerError};
pub use ws::{
    Connection, ConnectionId, ControlOpCode, DataOpCode, Handler, Receivers, SendResult, Senders,
};
