//! frameline: a multi-connection TCP server engine.
//!
//! Peers exchange messages framed as a 4-byte big-endian length followed by
//! the payload (at most 1 MiB). The server accepts peers on one thread,
//! scans them for pending data on another, and runs user handlers on
//! short-lived worker threads, never two at once for the same peer.
//!
//! ```no_run
//! use frameline::{ServerOptions, ServerState, TcpServer};
//!
//! let server = TcpServer::new(ServerOptions::with_port(8080), |msg, conn| {
//!     conn.send(msg.payload());
//! });
//! assert_eq!(server.start(), ServerState::Up);
//! server.join();
//! ```

#[cfg(not(unix))]
compile_error!("frameline supports unix platforms only");

pub mod codec;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod runtime;
pub mod server;
pub mod socket;

pub use codec::{Message, MAX_MESSAGE_SIZE};
pub use error::{ConfigError, FrameError, SocketError};
pub use keepalive::KeepAliveConfig;
pub use runtime::{Connection, ConnectionId, ConnectionStatus};
pub use server::{ServerOptions, ServerState, TcpServer};
