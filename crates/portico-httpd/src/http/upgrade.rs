//! HTTP → WebSocket upgrade negotiation and the raw-socket handover.
//!
//! Negotiation validates the handshake headers (RFC 6455 §4.2.1) and
//! produces the `Sec-WebSocket-Accept` value; any precondition failure
//! means the request is NOT an upgrade and falls through to the regular
//! request handler.
//!
//! After the 101 response the daemon hands the connection to the WebSocket
//! core as an [`UpgradedSocket`]: a raw fd to recv/send on plus a one-shot
//! close. Plaintext connections hand over the TCP socket itself. TLS
//! connections hand over one end of a socketpair with a relay thread
//! pumping cleartext between the pair and the TLS session, so the core
//! always reads and writes cleartext frames on a plain fd.

use crate::http::parser::{Method, Request};
use crate::ws::Handler;
use log::{debug, warn};
use portico_codec::accept_key;
use rustls::{ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;

/// A socket handed over by the HTTP layer after a 101 response.
///
/// The fd carries cleartext WebSocket frames and is assumed blocking.
/// `close` releases the connection through the HTTP layer exactly once.
pub trait UpgradedSocket: Send {
    fn raw_fd(&self) -> RawFd;
    fn close(&mut self);
}

// ---------------------------------------------------------------------
// Negotiation
// ---------------------------------------------------------------------

/// Decide whether `request` is an acceptable upgrade.
///
/// Returns the `Sec-WebSocket-Accept` value when every precondition holds:
/// a handler that claims the URL, method GET, HTTP >= 1.1, a `Host`
/// header, `Upgrade: websocket` and `Connection: Upgrade` (as token lists,
/// case-insensitive), `Sec-WebSocket-Version: 13`, and a
/// `Sec-WebSocket-Key`. The key's decoded contents are not validated.
pub(crate) fn negotiate(request: &Request, handler: Option<&Handler>) -> Option<String> {
    let handler = handler?;
    if !handler.is_handled(&request.url) {
        return None;
    }

    if request.method != Method::Get {
        return None;
    }
    if !request.version.at_least(1, 1) {
        return None;
    }

    let headers = &request.headers;
    if !headers.contains("host") {
        return None;
    }
    if !header_has_token(headers.get("upgrade")?, "websocket") {
        return None;
    }
    if !header_has_token(headers.get("connection")?, "upgrade") {
        return None;
    }
    if headers.get("sec-websocket-version")?.trim() != "13" {
        return None;
    }

    let key = headers.get("sec-websocket-key")?;
    if key.trim().is_empty() {
        return None;
    }

    Some(accept_key(key))
}

/// Case-insensitive token match against a comma-separated header value.
fn header_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// The 101 response completing the handshake.
pub(crate) fn switching_protocols_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    )
    .into_bytes()
}

// ---------------------------------------------------------------------
// Handover sockets
// ---------------------------------------------------------------------

/// A plaintext connection handed over directly.
pub(crate) struct PlainUpgraded {
    fd: RawFd,
    stream: Option<TcpStream>,
}

impl PlainUpgraded {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            fd: stream.as_raw_fd(),
            stream: Some(stream),
        }
    }
}

impl UpgradedSocket for PlainUpgraded {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// A TLS connection handed over through a cleartext socketpair.
///
/// Closing our end makes the relay see EOF, send the TLS close_notify,
/// and drop the session.
pub(crate) struct TlsUpgraded {
    fd: RawFd,
    local: Option<UnixStream>,
}

impl UpgradedSocket for TlsUpgraded {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn close(&mut self) {
        if let Some(local) = self.local.take() {
            let _ = local.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Start the relay for an upgraded TLS connection and return the
/// cleartext end for the WebSocket core.
pub(crate) fn upgrade_tls(
    tls: StreamOwned<ServerConnection, TcpStream>,
) -> io::Result<TlsUpgraded> {
    let (local, remote) = UnixStream::pair()?;
    let fd = local.as_raw_fd();

    thread::Builder::new()
        .name("tls-relay".into())
        .spawn(move || relay(tls, remote))?;

    Ok(TlsUpgraded {
        fd,
        local: Some(local),
    })
}

/// Pump bytes between the TLS session and the cleartext pair until either
/// side closes.
fn relay(mut tls: StreamOwned<ServerConnection, TcpStream>, mut pair: UnixStream) {
    let tcp_fd = tls.sock.as_raw_fd();
    let pair_fd = pair.as_raw_fd();
    let readable = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
    let mut buf = [0u8; 8192];

    loop {
        let mut fds = [
            libc::pollfd {
                fd: tcp_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: pair_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        #[allow(unsafe_code)]
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            warn!("tls relay poll failed: {err}");
            return;
        }

        if (fds[0].revents & readable) != 0 {
            match tls.read(&mut buf) {
                Ok(0) => {
                    debug!("tls relay: peer closed");
                    return;
                }
                Ok(n) => {
                    if pair.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("tls relay: read failed: {err}");
                    return;
                }
            }
        }

        if (fds[1].revents & readable) != 0 {
            match pair.read(&mut buf) {
                Ok(0) => {
                    // The WebSocket core closed its end; finish the TLS
                    // session cleanly.
                    tls.conn.send_close_notify();
                    let _ = tls.flush();
                    return;
                }
                Ok(n) => {
                    if tls.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("tls relay: pair read failed: {err}");
                    return;
                }
            }
        }
    }
}
