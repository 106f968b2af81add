//! frameline: a length-prefixed TCP message server
//!
//! Every message received is logged and answered with a fixed greeting.
//! Configuration via CLI arguments or TOML file.

use frameline::config::Config;
use frameline::{Connection, Message, ServerOptions, ServerState, TcpServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const GREETING: &[u8] = b"Hello, client!\0";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        max_connections = config.max_connections,
        keepalive = ?config.keepalive,
        "Starting frameline server"
    );

    let server = TcpServer::new(ServerOptions::from(&config), on_message)
        .on_connect(|conn: &Connection| {
            info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Client connected");
        })
        .on_disconnect(|conn: &Connection| {
            info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Client disconnected");
        });

    match server.start() {
        ServerState::Up => {
            info!(addr = ?server.local_addr(), "Listening");
            server.join();
            Ok(())
        }
        state => {
            let reason = server.last_error().unwrap_or_default();
            error!(state = ?state, reason = %reason, "Server failed to start");
            std::process::exit(1);
        }
    }
}

fn on_message(msg: Message, conn: &Connection) {
    info!(
        peer = %conn.peer_addr(),
        len = msg.len(),
        payload = %String::from_utf8_lossy(msg.payload()),
        "Message received"
    );
    if !conn.send(GREETING) {
        error!(peer = %conn.peer_addr(), "Failed to send reply");
    }
}
