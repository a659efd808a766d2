//! The HTTP/1.1 side of the server: request parsing, the daemon thread,
//! upgrade negotiation, and TLS termination.
//!
//! The WebSocket core consumes this layer through a narrow contract: a
//! parsed-request notification (to negotiate the upgrade) and the
//! [`upgrade::UpgradedSocket`] handover after the 101 response.

pub(crate) mod daemon;
pub mod parser;
pub(crate) mod response;
pub mod tls;
pub(crate) mod upgrade;

pub use parser::{Headers, HttpVersion, Method, PostKeyValues, Request};
pub use tls::TlsError;
pub use upgrade::UpgradedSocket;
