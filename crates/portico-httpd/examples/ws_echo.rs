//! WebSocket text echo server.
//!
//! Accepts upgrades on every URL and echoes text messages back verbatim;
//! binary messages are ignored. Regular HTTP requests get a 404.
//!
//! ```text
//! cargo run --example ws_echo
//! websocat ws://localhost:2345/anything
//! ```

use log::{error, info};
use parking_lot::Mutex;
use portico_httpd::{
    Config, Connection, ConnectionId, DataOpCode, Handler, Receivers, Response, SendResult,
    Senders, Server,
};
use std::collections::HashMap;
use std::sync::Arc;

fn main() {
    env_logger::init();

    let connections: Arc<Mutex<HashMap<ConnectionId, Senders>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let established = {
        let connections = Arc::clone(&connections);
        move |connection: Connection| {
            info!(
                "connection {} established for {}",
                connection.id, connection.url
            );
            connections
                .lock()
                .insert(connection.id, connection.senders.clone());

            let lookup = Arc::clone(&connections);
            Receivers::with_data(move |id, kind, payload| {
                if kind == DataOpCode::Binary {
                    // Only echo back text messages.
                    return;
                }
                let Some(senders) = lookup.lock().get(&id).cloned() else {
                    error!("unrecognised WebSocket connection {id}");
                    return;
                };
                let text = String::from_utf8_lossy(&payload);
                if senders.send_data(&text, 0) != SendResult::Success {
                    error!("failed to send echo on connection {id}");
                }
            })
        }
    };

    let handler = Handler::new(|_url| true, established);

    let server = match Server::new(
        Config::new(2345),
        |_url, _method, _version, _headers, _body, _post| {
            Response::new(
                404,
                "This is a websocket echo server only. Regular http ignored.",
            )
        },
        Some(handler),
    ) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to start echo server: {err}");
            std::process::exit(1);
        }
    };

    info!("echo server listening on {}", server.local_addr());

    loop {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}
