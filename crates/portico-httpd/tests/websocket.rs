//! End-to-end WebSocket tests over real sockets.
//!
//! The client side is built by hand: raw `TcpStream`s, handshake bytes,
//! and masked frames, so the server's wire behavior is checked against
//! RFC 6455 rather than against another WebSocket library.

use parking_lot::Mutex;
use portico_httpd::{
    CloseStatus, Config, Connection, ConnectionId, ControlOpCode, DataOpCode, Handler, Headers,
    HttpVersion, Method, PostKeyValues, Receivers, Response, SendResult, Senders, Server,
};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn not_found(
    _url: String,
    _method: Method,
    _version: HttpVersion,
    _headers: Headers,
    _body: Vec<u8>,
    _post: PostKeyValues,
) -> Response {
    Response::new(404, "websocket only")
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe port");
    listener.local_addr().expect("probe addr").port()
}

/// Events observed by the server-side application callbacks.
#[derive(Default)]
struct Observed {
    data: Vec<(ConnectionId, DataOpCode, Vec<u8>)>,
    control: Vec<(ConnectionId, ControlOpCode, Vec<u8>)>,
}

struct EchoServer {
    server: Server,
    observed: Arc<Mutex<Observed>>,
    senders: Arc<Mutex<HashMap<ConnectionId, Senders>>>,
}

/// Start a server that accepts upgrades on `/ws`, records every delivery,
/// and echoes text messages.
fn echo_server() -> EchoServer {
    let observed: Arc<Mutex<Observed>> = Arc::default();
    let senders: Arc<Mutex<HashMap<ConnectionId, Senders>>> = Arc::default();

    let established = {
        let observed = Arc::clone(&observed);
        let senders = Arc::clone(&senders);
        move |connection: Connection| {
            senders
                .lock()
                .insert(connection.id, connection.senders.clone());

            let data_log = Arc::clone(&observed);
            let data_senders = Arc::clone(&senders);
            let control_log = Arc::clone(&observed);
            Receivers::new(
                move |id, kind, payload| {
                    data_log.lock().data.push((id, kind, payload.clone()));
                    if kind == DataOpCode::Text {
                        if let Some(out) = data_senders.lock().get(&id).cloned() {
                            out.send_data(&String::from_utf8_lossy(&payload), 0);
                        }
                    }
                },
                move |id, kind, payload| {
                    control_log.lock().control.push((id, kind, payload));
                },
            )
        }
    };

    let handler = Handler::new(|url| url == "/ws", established);
    let server = Server::new(Config::new(free_port()), not_found, Some(handler))
        .expect("server must start");

    EchoServer {
        server,
        observed,
        senders,
    }
}

fn connect(server: &Server) -> TcpStream {
    let addr = ("127.0.0.1", server.local_addr().port());
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .expect("set write timeout");
    stream
}

fn read_until_double_crlf(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    while buf.len() < 16 * 1024 {
        let n = stream.read(&mut tmp).expect("read handshake response");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buf).expect("utf8 response")
}

/// Perform the opening handshake on `/ws` and assert the 101 response.
fn handshake(stream: &mut TcpStream) -> String {
    let request = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).expect("write handshake");

    let response = read_until_double_crlf(stream);
    assert!(
        response.starts_with("HTTP/1.1 101"),
        "expected 101 switching protocols, got:\n{response}"
    );
    response
}

fn masked_frame_with_fin(fin: bool, opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    assert!(payload.len() <= 125, "helper only builds small frames");
    let fin_bit = if fin { 0x80 } else { 0x00 };
    let mut out = Vec::with_capacity(6 + payload.len());
    out.push(fin_bit | (opcode & 0x0F));
    out.push(0x80 | payload.len() as u8);
    out.extend_from_slice(&mask);
    for (i, &b) in payload.iter().enumerate() {
        out.push(b ^ mask[i & 3]);
    }
    out
}

fn masked_frame(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    masked_frame_with_fin(true, opcode, payload, mask)
}

fn read_unmasked_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).expect("read frame header");
    let opcode = header[0] & 0x0F;
    assert_eq!(header[1] & 0x80, 0, "server->client frames must not be masked");

    let mut len = u64::from(header[1] & 0x7F);
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).expect("read ext16");
        len = u64::from(u16::from_be_bytes(ext));
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).expect("read ext64");
        len = u64::from_be_bytes(ext);
    }

    let mut payload = vec![0u8; usize::try_from(len).expect("len fits usize")];
    stream.read_exact(&mut payload).expect("read payload");
    (opcode, payload)
}

/// Wait until the observed log satisfies `ready`, with a bounded spin.
fn wait_for(observed: &Arc<Mutex<Observed>>, ready: impl Fn(&Observed) -> bool) {
    for _ in 0..200 {
        if ready(&observed.lock()) {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("server never observed the expected event");
}

#[test]
fn handshake_yields_rfc_accept_value() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);

    let response = handshake(&mut stream);
    let lower = response.to_ascii_lowercase();
    assert!(lower.contains("upgrade: websocket\r\n"));
    assert!(lower.contains("connection: upgrade\r\n"));
    assert!(lower.contains(&format!("sec-websocket-accept: {ACCEPT}").to_ascii_lowercase()));
}

#[test]
fn text_frame_is_delivered_and_echoed() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    let frame = masked_frame(0x1, b"hello", [0x05, 0x06, 0x07, 0x08]);
    stream.write_all(&frame).expect("write text frame");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x1, "expected text opcode");
    assert_eq!(payload, b"hello");

    let observed = fixture.observed.lock();
    assert_eq!(observed.data.len(), 1);
    let (_, kind, delivered) = &observed.data[0];
    assert_eq!(*kind, DataOpCode::Text);
    assert_eq!(delivered, b"hello");
}

#[test]
fn ping_gets_pong_before_subsequent_frames() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    stream
        .write_all(&masked_frame(0x9, b"abc", [0x01, 0x02, 0x03, 0x04]))
        .expect("write ping");
    stream
        .write_all(&masked_frame(0x1, b"after", [0x0A, 0x0B, 0x0C, 0x0D]))
        .expect("write text");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0xA, "expected pong first");
    assert_eq!(payload, b"abc");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"after");

    wait_for(&fixture.observed, |o| !o.control.is_empty());
    let observed = fixture.observed.lock();
    assert_eq!(observed.control[0].1, ControlOpCode::Ping);
    assert_eq!(observed.control[0].2, b"abc");
}

#[test]
fn fragmented_message_is_delivered_once() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    stream
        .write_all(&masked_frame_with_fin(false, 0x1, b"he", [0x11, 0x12, 0x13, 0x14]))
        .expect("write first fragment");
    stream
        .write_all(&masked_frame_with_fin(false, 0x0, b"ll", [0x21, 0x22, 0x23, 0x24]))
        .expect("write middle fragment");
    stream
        .write_all(&masked_frame_with_fin(true, 0x0, b"o", [0x31, 0x32, 0x33, 0x34]))
        .expect("write final fragment");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"hello");

    let observed = fixture.observed.lock();
    assert_eq!(observed.data.len(), 1, "one delivery for the whole message");
    assert_eq!(observed.data[0].2, b"hello");
}

#[test]
fn unexpected_continuation_gets_close_1002() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    stream
        .write_all(&masked_frame(0x0, b"x", [0x01, 0x01, 0x01, 0x01]))
        .expect("write stray continuation");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8, "expected close opcode");
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
    assert_eq!(&payload[2..], b"Unexpected continuation frame received.");

    // The connection is torn down: subsequent reads see EOF.
    let mut tail = [0u8; 1];
    assert_eq!(stream.read(&mut tail).unwrap_or(0), 0);

    assert!(fixture.observed.lock().data.is_empty());
}

#[test]
fn reserved_bits_get_close_1002() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    // RSV1 set on a text frame without any negotiated extension.
    let mut frame = masked_frame(0x1, b"boom", [0x0A, 0x0B, 0x0C, 0x0D]);
    frame[0] |= 0x40;
    stream.write_all(&frame).expect("write invalid frame");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
    assert!(fixture.observed.lock().data.is_empty());
}

#[test]
fn unmasked_frame_gets_close_1002() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    // fin + text, no mask bit.
    stream
        .write_all(&[0x81, 0x01, b'x'])
        .expect("write unmasked frame");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1002u16.to_be_bytes());
    assert!(fixture.observed.lock().data.is_empty());
}

#[test]
fn client_close_is_echoed_and_connection_removed() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    let mut close_payload = 1000u16.to_be_bytes().to_vec();
    close_payload.extend_from_slice(b"bye");
    stream
        .write_all(&masked_frame(0x8, &close_payload, [0x09, 0x08, 0x07, 0x06]))
        .expect("write close");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, close_payload, "close payload echoed verbatim");

    // Server closes the socket after answering.
    let mut tail = [0u8; 1];
    assert_eq!(stream.read(&mut tail).unwrap_or(0), 0);

    wait_for(&fixture.observed, |o| !o.control.is_empty());
    let observed = fixture.observed.lock();
    let closes: Vec<_> = observed
        .control
        .iter()
        .filter(|(_, kind, _)| *kind == ControlOpCode::Close)
        .collect();
    assert_eq!(closes.len(), 1, "close receipt fires exactly once");
    assert_eq!(closes[0].2, close_payload);
}

#[test]
fn empty_close_payload_is_echoed_empty() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    stream
        .write_all(&masked_frame(0x8, b"", [0x04, 0x03, 0x02, 0x01]))
        .expect("write close");

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert!(payload.is_empty());
}

#[test]
fn server_initiated_close_times_out_without_confirmation() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    // Get the connection established and grab its senders.
    stream
        .write_all(&masked_frame(0x1, b"hi", [0x01, 0x02, 0x03, 0x04]))
        .expect("write text");
    let (_, _) = read_unmasked_frame(&mut stream);
    wait_for(&fixture.observed, |o| !o.data.is_empty());

    let senders = {
        let map = fixture.senders.lock();
        map.values().next().cloned().expect("one connection")
    };
    assert_eq!(senders.send_close(CloseStatus::GoingAway, ""), SendResult::Success);
    assert_eq!(senders.send_data("x", 0), SendResult::Closed);

    // The close frame arrives; we deliberately never confirm it.
    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1001u16.to_be_bytes());

    // Within the 2000 ms window the socket stays open, afterwards the
    // server destroys the connection unilaterally.
    stream
        .set_read_timeout(Some(Duration::from_secs(4)))
        .expect("read timeout");
    let start = std::time::Instant::now();
    let mut tail = [0u8; 1];
    let n = stream.read(&mut tail).unwrap_or(0);
    assert_eq!(n, 0, "expected EOF after the close timeout");
    let waited = start.elapsed();
    assert!(
        waited >= Duration::from_millis(1500),
        "connection was torn down too early ({waited:?})"
    );

    let data_before = fixture.observed.lock().data.len();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fixture.observed.lock().data.len(), data_before);
}

#[test]
fn server_initiated_close_completes_on_confirmation() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    stream
        .write_all(&masked_frame(0x1, b"hi", [0x01, 0x02, 0x03, 0x04]))
        .expect("write text");
    let (_, _) = read_unmasked_frame(&mut stream);
    wait_for(&fixture.observed, |o| !o.data.is_empty());

    let senders = {
        let map = fixture.senders.lock();
        map.values().next().cloned().expect("one connection")
    };
    assert_eq!(senders.send_close(CloseStatus::Normal, "done"), SendResult::Success);

    let (opcode, _) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x8);

    // Confirm promptly; the server should close the socket well inside
    // the timeout window.
    stream
        .write_all(&masked_frame(0x8, &1000u16.to_be_bytes(), [0x05, 0x05, 0x05, 0x05]))
        .expect("write confirmation");

    let start = std::time::Instant::now();
    let mut tail = [0u8; 1];
    assert_eq!(stream.read(&mut tail).unwrap_or(0), 0, "expected EOF");
    assert!(start.elapsed() < Duration::from_millis(1900));
}

#[test]
fn frames_pipelined_behind_the_handshake_are_processed() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);

    // Handshake and a text frame in a single write.
    let mut bytes = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         \r\n"
    )
    .into_bytes();
    bytes.extend(masked_frame(0x1, b"early", [0x0E, 0x0D, 0x0C, 0x0B]));
    stream.write_all(&bytes).expect("write handshake + frame");

    let response = read_until_double_crlf(&mut stream);
    assert!(response.starts_with("HTTP/1.1 101"));

    let (opcode, payload) = read_unmasked_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"early");
}

#[test]
fn binary_messages_are_delivered_but_not_echoed() {
    let fixture = echo_server();
    let mut stream = connect(&fixture.server);
    handshake(&mut stream);

    stream
        .write_all(&masked_frame(0x2, &[1, 2, 3], [0x0F, 0x0E, 0x0D, 0x0C]))
        .expect("write binary frame");

    wait_for(&fixture.observed, |o| !o.data.is_empty());
    let observed = fixture.observed.lock();
    assert_eq!(observed.data[0].1, DataOpCode::Binary);
    assert_eq!(observed.data[0].2, vec![1, 2, 3]);
}
