//! Opening handshake digest (RFC 6455 §4.2.2).

use base64::prelude::*;
use sha1::{Digest, Sha1};

/// The GUID concatenated with `Sec-WebSocket-Key` before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// The key is used as sent, surrounding whitespace aside; the server does
/// not validate its decoded contents.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_example_vector() {
        // RFC 6455 §4.2.2
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(
            accept_key("  dGhlIHNhbXBsZSBub25jZQ==  "),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
