//! Error types shared across the server.
//!
//! Socket failures from every platform call are folded into one
//! `SocketError` enum so the lifecycle code never inspects raw OS codes.

use crate::server::ServerState;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a raw socket operation.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),

    #[error("failed to set address reuse: {0}")]
    ReuseAddress(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to enable keep-alive: {0}")]
    KeepAlive(#[source] io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to set up readiness polling: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] io::Error),

    #[error("connection limit of {0} reached")]
    LimitReached(usize),
}

impl SocketError {
    /// Server state a failed `start()` settles in for this error.
    pub fn state(&self) -> ServerState {
        match self {
            SocketError::Create(_) | SocketError::Poll(_) | SocketError::Spawn(..) => {
                ServerState::ErrInit
            }
            SocketError::ReuseAddress(_) | SocketError::Bind { .. } => ServerState::ErrBind,
            SocketError::KeepAlive(_) => ServerState::ErrKeepAlive,
            SocketError::Listen { .. } => ServerState::ErrListen,
            SocketError::Connect { .. } | SocketError::LimitReached(_) => ServerState::ErrInit,
        }
    }

    /// Underlying OS error kind.
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            SocketError::Create(e)
            | SocketError::ReuseAddress(e)
            | SocketError::KeepAlive(e)
            | SocketError::Poll(e)
            | SocketError::Spawn(_, e) => e.kind(),
            SocketError::Bind { source, .. }
            | SocketError::Listen { source, .. }
            | SocketError::Connect { source, .. } => source.kind(),
            SocketError::LimitReached(_) => io::ErrorKind::Other,
        }
    }
}

/// Reasons a frame could not be read off a connection.
///
/// Every variant ends the connection; none of them deliver a payload.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed by peer")]
    Closed,

    #[error("frame declares zero length")]
    ZeroLength,

    #[error("frame length {0} exceeds maximum of 1048576 bytes")]
    TooLarge(u32),

    #[error("i/o error while reading frame: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => FrameError::Closed,
            _ => FrameError::Io(e),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid bind address '{0}'")]
    InvalidHost(String),
}
