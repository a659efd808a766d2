//! The internal HTTP daemon thread.
//!
//! One long-lived thread multiplexes the listener and every request socket
//! through a [`Poller`]; there is no thread per request. Sockets stay
//! blocking and are read once per readiness event into a per-connection
//! buffer that is re-offered to the request parser.
//!
//! A successfully negotiated upgrade is answered with the 101 response
//! here, then the socket leaves this poller and is handed to the WebSocket
//! glue together with any bytes that were read past the request head.

use crate::http::parser::{Method, ParseStatus, Parser, Request};
use crate::http::response;
use crate::http::tls::TlsContext;
use crate::http::upgrade::{self, PlainUpgraded, UpgradedSocket};
use crate::poller::Poller;
use crate::server::Response;
use log::{debug, warn};
use rustls::{ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Everything the WebSocket glue needs to adopt an upgraded connection.
pub(crate) struct UpgradeHandover {
    pub socket: Box<dyn UpgradedSocket>,
    /// URL path of the upgrade request.
    pub url: String,
    /// Bytes already read past the request head, if the client pipelined
    /// frames behind the handshake.
    pub residual: Vec<u8>,
}

/// Produces the response for a regular (non-upgrade) request.
pub(crate) type RequestSink = Box<dyn Fn(Request) -> Response + Send + Sync>;
/// Decides whether a request upgrades; returns the accept value if so.
pub(crate) type UpgradeDecision = Box<dyn Fn(&Request) -> Option<String> + Send + Sync>;
/// Receives the socket of an upgraded connection.
pub(crate) type UpgradeSink = Box<dyn Fn(UpgradeHandover) + Send + Sync>;

struct Sinks {
    parser: Parser,
    tls: Option<TlsContext>,
    request: RequestSink,
    upgrade_decision: UpgradeDecision,
    upgrade: UpgradeSink,
}

/// Handle to the daemon thread.
pub(crate) struct Daemon {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Daemon {
    /// Bind the port and start the daemon thread. Binding failures surface
    /// here, at construction.
    pub(crate) fn start(
        port: u16,
        tls: Option<TlsContext>,
        request: RequestSink,
        upgrade_decision: UpgradeDecision,
        upgrade: UpgradeSink,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));
        let sinks = Arc::new(Sinks {
            parser: Parser::new(),
            tls,
            request,
            upgrade_decision,
            upgrade,
        });

        let loop_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("http-daemon".into())
            .spawn(move || daemon_loop(listener, loop_running, sinks))?;

        Ok(Self {
            running,
            thread: Some(thread),
            local_addr,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the thread to exit and wait for it.
    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_loop(listener: TcpListener, running: Arc<AtomicBool>, sinks: Arc<Sinks>) {
    let poller = Arc::new(Poller::new());
    let listener_fd = listener.as_raw_fd();

    let accept_poller = Arc::clone(&poller);
    let accept_sinks = Arc::clone(&sinks);
    poller.add(listener_fd, move || {
        accept_ready(&listener, &accept_poller, &accept_sinks);
        true
    });

    while running.load(Ordering::Acquire) {
        if poller.poll(500).is_err() {
            thread::sleep(Duration::from_secs(2));
        }
    }
    // Dropping the poller drops every connection callback, which closes
    // the sockets and the listener.
}

/// Drain the accept queue; the listener is non-blocking.
fn accept_ready(listener: &TcpListener, poller: &Arc<Poller>, sinks: &Arc<Sinks>) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                warn!("accept failed: {err}");
                break;
            }
        };
        debug!("accepted connection from {peer}");

        // Request sockets are served blocking; readiness comes from poll.
        if let Err(err) = stream.set_nonblocking(false) {
            warn!("failed to configure socket for {peer}: {err}");
            continue;
        }

        let transport = match &sinks.tls {
            None => Transport::Plain(stream),
            Some(context) => match ServerConnection::new(context.server_config()) {
                Ok(session) => Transport::Tls(Box::new(StreamOwned::new(session, stream))),
                Err(err) => {
                    warn!("TLS session setup failed for {peer}: {err}");
                    continue;
                }
            },
        };

        register_connection(poller, sinks, transport);
    }
}

fn register_connection(poller: &Arc<Poller>, sinks: &Arc<Sinks>, transport: Transport) {
    let fd = transport.raw_fd();
    let sinks = Arc::clone(sinks);
    let mut conn = Some(HttpConn {
        transport,
        buf: Vec::new(),
    });

    poller.add(fd, move || {
        let action = match conn.as_mut() {
            None => return false,
            Some(active) => active.on_readable(&sinks),
        };

        match action {
            ConnAction::Keep => true,
            ConnAction::Close => {
                conn = None;
                false
            }
            ConnAction::Upgrade { url, residual } => {
                if let Some(finished) = conn.take() {
                    match finished.transport.into_upgraded() {
                        Ok(socket) => (sinks.upgrade)(UpgradeHandover {
                            socket,
                            url,
                            residual,
                        }),
                        Err(err) => warn!("upgrade handover failed: {err}"),
                    }
                }
                false
            }
        }
    });
}

enum ConnAction {
    Keep,
    Close,
    Upgrade { url: String, residual: Vec<u8> },
}

struct HttpConn {
    transport: Transport,
    buf: Vec<u8>,
}

impl HttpConn {
    fn on_readable(&mut self, sinks: &Sinks) -> ConnAction {
        let mut tmp = [0u8; 8192];
        match self.transport.read(&mut tmp) {
            Ok(0) => return ConnAction::Close,
            Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return ConnAction::Keep;
            }
            Err(err) => {
                debug!("connection read failed: {err}");
                return ConnAction::Close;
            }
        }

        // Serve every complete request in the buffer (clients may pipeline).
        loop {
            let (request, consumed) = match sinks.parser.parse(&self.buf) {
                Ok(ParseStatus::Incomplete) => return ConnAction::Keep,
                Ok(ParseStatus::Complete { request, consumed }) => (request, consumed),
                Err(err) => {
                    debug!("rejecting malformed request: {err}");
                    let body = err.to_string();
                    let bytes = response::serialize(err.status_code(), body.as_bytes(), false);
                    let _ = self.transport.write_all(&bytes);
                    return ConnAction::Close;
                }
            };
            self.buf.drain(..consumed);

            if let Some(accept) = (sinks.upgrade_decision)(&request) {
                let bytes = upgrade::switching_protocols_response(&accept);
                if self.transport.write_all(&bytes).is_err() {
                    return ConnAction::Close;
                }
                return ConnAction::Upgrade {
                    url: request.url,
                    residual: std::mem::take(&mut self.buf),
                };
            }

            let keep_alive = should_keep_alive(&request);
            let head_only = request.method == Method::Head;
            let reply = (sinks.request)(request);
            let body = if head_only {
                &[][..]
            } else {
                reply.content.as_bytes()
            };
            let bytes = response::serialize(reply.code, body, keep_alive);
            if self.transport.write_all(&bytes).is_err() {
                return ConnAction::Close;
            }
            if !keep_alive {
                return ConnAction::Close;
            }
        }
    }
}

/// HTTP/1.1 defaults to keep-alive unless the client asked to close;
/// HTTP/1.0 requires an explicit keep-alive.
fn should_keep_alive(request: &Request) -> bool {
    if let Some(connection) = request.headers.get("connection") {
        let value = connection.to_ascii_lowercase();
        if value.split(',').any(|token| token.trim() == "close") {
            return false;
        }
        if value.split(',').any(|token| token.trim() == "keep-alive") {
            return true;
        }
    }
    request.version.at_least(1, 1)
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Plain(stream) => stream.as_raw_fd(),
            Self::Tls(tls) => tls.sock.as_raw_fd(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(tls) => tls.read(buf),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(bytes),
            Self::Tls(tls) => tls.write_all(bytes),
        }
    }

    fn into_upgraded(self) -> io::Result<Box<dyn UpgradedSocket>> {
        match self {
            Self::Plain(stream) => Ok(Box::new(PlainUpgraded::new(stream))),
            Self::Tls(tls) => Ok(Box::new(upgrade::upgrade_tls(*tls)?)),
        }
    }
}
