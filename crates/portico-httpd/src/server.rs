//! The embeddable server: configuration, construction, and the WebSocket
//! I/O thread.
//!
//! A `Server` owns two long-lived threads. The HTTP daemon thread (in
//! [`crate::http::daemon`]) parses requests and performs upgrade
//! negotiation; this module supplies it the request handler and adopts
//! upgraded sockets into the connection table. The WebSocket I/O thread
//! runs `poll(500 ms)` over every adopted socket and then sweeps the
//! pending-close set, destroying connections whose close handshake has
//! finished or timed out.

use crate::http::daemon::{Daemon, RequestSink, UpgradeDecision, UpgradeHandover, UpgradeSink};
use crate::http::parser::{
    Headers, HttpVersion, Method, PostKeyValues, Request, parse_form_urlencoded,
};
use crate::http::tls::{TlsContext, TlsError};
use crate::http::upgrade;
use crate::poller::Poller;
use crate::ws::connection::WsConnection;
use crate::ws::{ConnectionId, Handler};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on, 1 through 65535.
    pub port: u16,
    /// Upper bound on the bytes taken from a WebSocket in one `recv(2)`.
    pub max_socket_bytes_to_receive: usize,
}

impl Config {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            max_socket_bytes_to_receive: 1024,
        }
    }

    #[must_use]
    pub fn with_max_socket_bytes_to_receive(mut self, max: usize) -> Self {
        self.max_socket_bytes_to_receive = max;
        self
    }
}

/// Response returned by the request handler for a regular HTTP request.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub content: String,
}

impl Response {
    pub fn new(code: u16, content: impl Into<String>) -> Self {
        Self {
            code,
            content: content.into(),
        }
    }
}

/// Fatal construction error.
#[derive(Debug)]
pub enum ServerError {
    /// Port 0 is not a listening port.
    InvalidPort,
    /// `max_socket_bytes_to_receive` must be greater than zero.
    InvalidMaxReceiveBytes,
    /// Certificate or key material was unusable.
    Tls(TlsError),
    /// Bind, listen, or thread spawn failure.
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPort => {
                write!(f, "invalid port number; needs to be in the range 1 to 65535")
            }
            Self::InvalidMaxReceiveBytes => {
                write!(f, "invalid maximum socket bytes to receive; needs to be greater than zero")
            }
            Self::Tls(e) => write!(f, "TLS configuration error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tls(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<TlsError> for ServerError {
    fn from(e: TlsError) -> Self {
        Self::Tls(e)
    }
}

/// Shared state of the WebSocket side.
struct WsShared {
    running: AtomicBool,
    poller: Poller,
    connections: Mutex<HashMap<ConnectionId, Arc<WsConnection>>>,
    /// Connections whose destruction has been requested; swept each tick.
    pending_close: Mutex<HashSet<ConnectionId>>,
    max_recv: usize,
    handler: Option<Handler>,
}

/// An embeddable HTTP(S) server with WebSocket support.
///
/// The server starts on construction and stops when dropped. Every
/// non-upgrade request is answered through the supplied request handler;
/// requests that negotiate a WebSocket upgrade are adopted by the
/// WebSocket subsystem and serviced through the [`Handler`]'s callbacks.
///
/// # Example
///
/// ```no_run
/// use portico_httpd::{Config, Handler, Receivers, Response, Server};
///
/// let handler = Handler::new(
///     |url| url == "/echo",
///     |connection| {
///         let senders = connection.senders.clone();
///         Receivers::with_data(move |_id, _kind, payload| {
///             let text = String::from_utf8_lossy(&payload);
///             senders.send_data(&text, 0);
///         })
///     },
/// );
///
/// let server = Server::new(
///     Config::new(8080),
///     |_url, _method, _version, _headers, _body, _post| Response::new(404, "websocket only"),
///     Some(handler),
/// )
/// .expect("server failed to start");
/// # drop(server);
/// ```
pub struct Server {
    shared: Arc<WsShared>,
    daemon: Daemon,
    ws_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Start a plaintext HTTP server.
    pub fn new<H>(
        config: Config,
        request_handler: H,
        ws_handler: Option<Handler>,
    ) -> Result<Self, ServerError>
    where
        H: Fn(String, Method, HttpVersion, Headers, Vec<u8>, PostKeyValues) -> Response
            + Send
            + Sync
            + 'static,
    {
        Self::start(config, None, request_handler, ws_handler)
    }

    /// Start an HTTPS server from in-memory certificate and key PEM data.
    pub fn new_tls<H>(
        config: Config,
        cert_pem: &str,
        key_pem: &str,
        request_handler: H,
        ws_handler: Option<Handler>,
    ) -> Result<Self, ServerError>
    where
        H: Fn(String, Method, HttpVersion, Headers, Vec<u8>, PostKeyValues) -> Response
            + Send
            + Sync
            + 'static,
    {
        let tls = TlsContext::from_pem(cert_pem, key_pem)?;
        Self::start(config, Some(tls), request_handler, ws_handler)
    }

    fn start<H>(
        config: Config,
        tls: Option<TlsContext>,
        request_handler: H,
        ws_handler: Option<Handler>,
    ) -> Result<Self, ServerError>
    where
        H: Fn(String, Method, HttpVersion, Headers, Vec<u8>, PostKeyValues) -> Response
            + Send
            + Sync
            + 'static,
    {
        if config.port == 0 {
            return Err(ServerError::InvalidPort);
        }
        if config.max_socket_bytes_to_receive == 0 {
            return Err(ServerError::InvalidMaxReceiveBytes);
        }

        let shared = Arc::new(WsShared {
            running: AtomicBool::new(true),
            poller: Poller::new(),
            connections: Mutex::new(HashMap::new()),
            pending_close: Mutex::new(HashSet::new()),
            max_recv: config.max_socket_bytes_to_receive,
            handler: ws_handler.clone(),
        });

        let request_sink: RequestSink =
            Box::new(move |request| dispatch_request(&request_handler, request));

        let upgrade_decision: UpgradeDecision =
            Box::new(move |request| upgrade::negotiate(request, ws_handler.as_ref()));

        let adopt_shared = Arc::clone(&shared);
        let upgrade_sink: UpgradeSink = Box::new(move |handover| adopt_shared.adopt(handover));

        let daemon = Daemon::start(
            config.port,
            tls,
            request_sink,
            upgrade_decision,
            upgrade_sink,
        )?;

        let ws_thread = if shared.handler.is_some() {
            let loop_shared = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("websocket-io".into())
                    .spawn(move || loop_shared.websocket_loop())?,
            )
        } else {
            None
        };

        info!("server listening on {}", daemon.local_addr());

        Ok(Self {
            shared,
            daemon,
            ws_thread,
        })
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.daemon.local_addr()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Stop polling for data.
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.ws_thread.take() {
            let _ = thread.join();
        }

        // Close any WebSocket connection the client has not closed.
        let connections: Vec<Arc<WsConnection>> = {
            let mut table = self.shared.connections.lock();
            table.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.send_going_away();
            self.shared.poller.remove(conn.raw_fd());
            conn.close_socket();
        }

        self.daemon.stop();
    }
}

/// Decode POST form data and hand the request to the application.
fn dispatch_request<H>(handler: &H, request: Request) -> Response
where
    H: Fn(String, Method, HttpVersion, Headers, Vec<u8>, PostKeyValues) -> Response,
{
    let is_form = request
        .headers
        .get("content-type")
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("application/x-www-form-urlencoded"));

    let post = if request.method == Method::Post && is_form {
        parse_form_urlencoded(&request.body)
    } else {
        PostKeyValues::new()
    };

    handler(
        request.url,
        request.method,
        request.version,
        request.headers,
        request.body,
        post,
    )
}

impl WsShared {
    /// Adopt an upgraded socket: assign its id, notify the application,
    /// feed any bytes read past the handshake, and start polling it.
    fn adopt(self: &Arc<Self>, handover: UpgradeHandover) {
        let Some(handler) = &self.handler else {
            return;
        };
        if !self.running.load(Ordering::Acquire) {
            debug!("dropping upgrade for {}: server stopping", handover.url);
            return;
        }

        let id = ConnectionId::next();
        let sweep = Arc::downgrade(self);
        let conn = WsConnection::new(
            id,
            handover.url,
            self.max_recv,
            handover.socket,
            Box::new(move |closed| {
                if let Some(shared) = sweep.upgrade() {
                    shared.pending_close.lock().insert(closed);
                }
            }),
        );

        self.connections.lock().insert(id, Arc::clone(&conn));
        debug!("connection {id} established for {}", conn.url());

        let receivers = handler.connection_established(conn.app_connection());
        conn.set_receivers(receivers);

        let mut reading = true;
        if !handover.residual.is_empty() {
            reading = conn.handle_bytes(&handover.residual);
        }
        if reading {
            let poll_conn = Arc::clone(&conn);
            self.poller.add(conn.raw_fd(), move || poll_conn.on_readable());
        }
    }

    /// The WebSocket I/O thread: one poll, then sweep the pending closes.
    fn websocket_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            if self.poller.poll(500).is_err() {
                // Keep trying every two seconds.
                thread::sleep(Duration::from_secs(2));
                continue;
            }
            self.sweep_pending_close();
        }
    }

    fn sweep_pending_close(&self) {
        let pending: Vec<ConnectionId> = {
            let set = self.pending_close.lock();
            if set.is_empty() {
                return;
            }
            set.iter().copied().collect()
        };

        let now = Instant::now();
        for id in pending {
            let conn = self.connections.lock().get(&id).cloned();
            let Some(conn) = conn else {
                warn!("unknown connection {id} in pending-close set");
                self.pending_close.lock().remove(&id);
                continue;
            };

            // A server-initiated close stays here until the confirmation
            // arrives or the handshake times out.
            if conn.ready_to_destroy(now) {
                self.connections.lock().remove(&id);
                self.pending_close.lock().remove(&id);
                self.poller.remove(conn.raw_fd());
                conn.close_socket();
                debug!("connection {id} destroyed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::Receivers;

    fn not_found(
        _url: String,
        _method: Method,
        _version: HttpVersion,
        _headers: Headers,
        _body: Vec<u8>,
        _post: PostKeyValues,
    ) -> Response {
        Response::new(404, "")
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn port_zero_is_rejected() {
        let result = Server::new(Config::new(0), not_found, None);
        assert!(matches!(result, Err(ServerError::InvalidPort)));
    }

    #[test]
    fn zero_receive_size_is_rejected() {
        let config = Config::new(free_port()).with_max_socket_bytes_to_receive(0);
        let result = Server::new(config, not_found, None);
        assert!(matches!(result, Err(ServerError::InvalidMaxReceiveBytes)));
    }

    #[test]
    fn invalid_tls_material_is_rejected() {
        let result = Server::new_tls(
            Config::new(free_port()),
            "garbage",
            "garbage",
            not_found,
            None,
        );
        assert!(matches!(result, Err(ServerError::Tls(_))));
    }

    #[test]
    fn server_starts_and_stops() {
        let handler = Handler::new(|_| true, |_| Receivers::disabled());
        let server = Server::new(Config::new(free_port()), not_found, Some(handler))
            .expect("server must start");
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);
        drop(server);
    }

    #[test]
    fn error_messages_are_descriptive() {
        assert!(ServerError::InvalidPort.to_string().contains("port"));
        assert!(
            ServerError::InvalidMaxReceiveBytes
                .to_string()
                .contains("greater than zero")
        );
    }
}
