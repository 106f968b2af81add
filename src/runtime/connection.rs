//! A single peer connection.
//!
//! The socket sits behind an `RwLock<Option<Socket>>`: reads and writes
//! share the read side, and only `disconnect` takes the write side to
//! replace the socket with `None`. Once `None`, the descriptor is closed
//! and can never be closed twice.

use super::{lock, read, write};
use crate::codec::{self, Message};
use crate::socket::{self, DeadlineReader, Readiness};
use socket2::Socket;
use std::fmt;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Process-unique connection identifier.
///
/// Never reused, so a stale id held by a worker cannot match a newer peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// One live peer socket plus its addressing and status.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    socket: RwLock<Option<Socket>>,
    connected: AtomicBool,
    /// Longest time one frame may take to arrive once its first byte has.
    frame_timeout: Option<Duration>,
    /// Set while a worker owns the read side.
    reading: AtomicBool,
    /// Set once a teardown task has been scheduled for this connection.
    teardown_claimed: AtomicBool,
    /// Keeps concurrent `send` calls from interleaving frame bytes.
    write_lock: Mutex<()>,
    /// Held for the full duration of every handler call.
    handler_lock: Mutex<()>,
}

impl Connection {
    /// Wrap an already connected socket.
    pub(crate) fn new(socket: Socket, peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            socket: RwLock::new(Some(socket)),
            connected: AtomicBool::new(true),
            frame_timeout: None,
            reading: AtomicBool::new(false),
            teardown_claimed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            handler_lock: Mutex::new(()),
        }
    }

    pub(crate) fn with_frame_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn host(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn port(&self) -> u16 {
        self.peer.port()
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_connected() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send one length-prefixed message.
    ///
    /// Returns `false` if the connection is already down or the write
    /// fails. A failed write does not disconnect; the next read will.
    pub fn send(&self, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }

        let guard = read(&self.socket);
        let Some(socket) = guard.as_ref() else {
            return false;
        };

        let _writing = lock(&self.write_lock);
        match codec::write_frame(socket, payload) {
            Ok(()) => {
                trace!(conn_id = %self.id, len = payload.len(), "Sent frame");
                true
            }
            Err(e) => {
                debug!(conn_id = %self.id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Read exactly one message.
    ///
    /// Any framing or I/O failure disconnects and returns `None`, including
    /// a frame that does not complete within the frame timeout.
    pub fn receive(&self) -> Option<Message> {
        if !self.is_connected() {
            return None;
        }

        let result = {
            let guard = read(&self.socket);
            let socket = guard.as_ref()?;
            codec::read_frame(DeadlineReader::new(socket, self.frame_timeout))
        };

        match result {
            Ok(message) => {
                trace!(conn_id = %self.id, len = message.len(), "Received frame");
                Some(message)
            }
            Err(e) => {
                debug!(conn_id = %self.id, peer = %self.peer, reason = %e, "Dropping connection");
                self.disconnect();
                None
            }
        }
    }

    /// Non-blocking check for pending data or a closed peer.
    pub(crate) fn readiness(&self) -> Readiness {
        if !self.is_connected() {
            return Readiness::Closed;
        }
        match read(&self.socket).as_ref() {
            Some(socket) => socket::probe(socket),
            None => Readiness::Closed,
        }
    }

    /// Shut down and close the socket.
    ///
    /// Only the first call has side effects; every call returns
    /// `Disconnected`.
    pub fn disconnect(&self) -> ConnectionStatus {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return ConnectionStatus::Disconnected;
        }

        // Shut down under the shared lock first so that any thread blocked in
        // a read or write on this socket returns and releases its guard.
        if let Some(socket) = read(&self.socket).as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }

        // Dropping the socket closes the descriptor.
        drop(write(&self.socket).take());

        debug!(conn_id = %self.id, peer = %self.peer, "Connection closed");
        ConnectionStatus::Disconnected
    }

    /// Returns `true` if the caller now owns the read side.
    pub(crate) fn try_begin_read(&self) -> bool {
        !self.reading.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_read(&self) {
        self.reading.store(false, Ordering::Release);
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Make a blocked `receive` return without closing the write side.
    pub(crate) fn interrupt_read(&self) {
        if let Some(socket) = read(&self.socket).as_ref() {
            let _ = socket.shutdown(Shutdown::Read);
        }
    }

    /// Serialize handler execution for this peer.
    pub(crate) fn lock_handler(&self) -> MutexGuard<'_, ()> {
        lock(&self.handler_lock)
    }

    /// Returns `true` exactly once, to the caller that gets to schedule teardown.
    pub(crate) fn claim_teardown(&self) -> bool {
        !self.teardown_claimed.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn has_socket(&self) -> bool {
        read(&self.socket).is_some()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("status", &self.status())
            .finish()
    }
}
