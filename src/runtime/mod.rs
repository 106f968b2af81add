//! Connection lifecycle and concurrency engine.
//!
//! Thread layout while the server is up:
//! - one acceptor thread (`acceptor`) turning new peers into registered connections
//! - one poll thread (`poller`) scanning the registry on a fixed interval
//! - short-lived worker threads (`dispatch`), one per received message or teardown
//!
//! Shared between them:
//! - `ConnectionRegistry`: membership, guarded by a single mutex that is never
//!   held across I/O
//! - `Handlers`: the user callbacks
//! - per-connection handler lock: at most one callback per peer at a time

mod acceptor;
mod connection;
mod dispatch;
mod poller;
mod registry;

pub use connection::{Connection, ConnectionId, ConnectionStatus};
pub use registry::ConnectionRegistry;

pub(crate) use acceptor::{Acceptor, AcceptorHandle};
pub(crate) use dispatch::Dispatcher;
pub(crate) use poller::Poller;

use crate::codec::Message;
use crate::error::SocketError;
use crate::keepalive::KeepAliveConfig;
use socket2::Socket;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback for each delivered message.
pub type DataHandler = Arc<dyn Fn(Message, &Connection) + Send + Sync>;

/// Callback for connect and disconnect events.
pub type ConnectionHandler = Arc<dyn Fn(&Connection) + Send + Sync>;

fn noop() -> ConnectionHandler {
    Arc::new(|_: &Connection| {})
}

/// The user callbacks, swappable while the server runs.
pub(crate) struct Handlers {
    data: RwLock<DataHandler>,
    connect: RwLock<ConnectionHandler>,
    disconnect: RwLock<ConnectionHandler>,
}

impl Handlers {
    pub fn new(data: DataHandler) -> Self {
        Self {
            data: RwLock::new(data),
            connect: RwLock::new(noop()),
            disconnect: RwLock::new(noop()),
        }
    }

    pub fn set_data(&self, handler: DataHandler) {
        *write(&self.data) = handler;
    }

    pub fn set_connect(&self, handler: ConnectionHandler) {
        *write(&self.connect) = handler;
    }

    pub fn set_disconnect(&self, handler: ConnectionHandler) {
        *write(&self.disconnect) = handler;
    }

    /// Deliver `message` to the data handler under the peer's handler lock.
    pub fn deliver(&self, message: Message, conn: &Connection) {
        // Clone out so a concurrent `set_data` is not blocked by a slow handler.
        let handler = read(&self.data).clone();
        let _serial = conn.lock_handler();
        handler(message, conn);
    }

    /// Run a connect handler for a connection not yet visible in the registry.
    ///
    /// `handler` overrides the server-wide one (outbound connects pass their own).
    pub fn connected(&self, conn: &Connection, handler: Option<&ConnectionHandler>) {
        let handler = match handler {
            Some(handler) => handler.clone(),
            None => read(&self.connect).clone(),
        };
        let _serial = conn.lock_handler();
        handler(conn);
    }

    /// Run the disconnect handler for a connection already removed from the
    /// registry. Waits for any in-flight data handler on the same peer.
    pub fn disconnected(&self, conn: &Connection) {
        let handler = read(&self.disconnect).clone();
        let _serial = conn.lock_handler();
        handler(conn);
        debug!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Connection torn down");
    }
}

/// State shared by the lifecycle, acceptor, poller and workers.
pub(crate) struct Shared {
    pub registry: ConnectionRegistry,
    pub handlers: Handlers,
    pub dispatcher: Dispatcher,
    pub keepalive: KeepAliveConfig,
    pub read_timeout: Option<Duration>,
}

impl Shared {
    pub fn new(
        data: DataHandler,
        max_connections: usize,
        keepalive: KeepAliveConfig,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(max_connections),
            handlers: Handlers::new(data),
            dispatcher: Dispatcher::new(),
            keepalive,
            read_timeout,
        }
    }

    /// Turn a freshly accepted or connected socket into a registered connection.
    ///
    /// Keep-alive failure closes the socket (fail-closed). The connect handler
    /// runs before the connection becomes visible in the registry.
    pub fn admit(
        &self,
        socket: Socket,
        peer: SocketAddr,
        on_connect: Option<&ConnectionHandler>,
    ) -> Result<Arc<Connection>, SocketError> {
        if let Err(e) = self.keepalive.apply(&socket) {
            let _ = socket.shutdown(Shutdown::Both);
            return Err(SocketError::KeepAlive(e));
        }
        let conn = Arc::new(Connection::new(socket, peer).with_frame_timeout(self.read_timeout));
        self.handlers.connected(&conn, on_connect);

        if let Err(conn) = self.registry.insert(conn.clone()) {
            warn!(
                conn_id = %conn.id(),
                peer = %peer,
                limit = self.registry.capacity(),
                "Connection limit reached, closing"
            );
            conn.disconnect();
            self.handlers.disconnected(&conn);
            return Err(SocketError::LimitReached(self.registry.capacity()));
        }

        Ok(conn)
    }

    /// Hand `conn` to a teardown worker, at most once per connection.
    ///
    /// Returns `false` if teardown was already scheduled.
    pub fn schedule_teardown(self: &Arc<Self>, conn: &Arc<Connection>) -> bool {
        if !conn.claim_teardown() {
            return false;
        }
        let shared = Arc::clone(self);
        let id = conn.id();
        self.dispatcher.spawn("teardown", id, move || shared.teardown(id));
        true
    }

    /// Take `id` out of the registry and fire its disconnect handler.
    ///
    /// Does nothing if another path already took it out.
    pub fn teardown(&self, id: ConnectionId) {
        if let Some(conn) = self.registry.remove_and_take(id) {
            conn.disconnect();
            self.handlers.disconnected(&conn);
        }
    }

    /// Unblock every worker still waiting on a partial frame.
    ///
    /// Only called once the poll loop has exited, so no new reads start.
    pub fn interrupt_reads(&self) -> usize {
        let mut interrupted = 0;
        for conn in self.registry.snapshot() {
            if conn.is_reading() {
                conn.interrupt_read();
                interrupted += 1;
            }
        }
        interrupted
    }

    /// Remove every connection, closing each and firing its disconnect handler.
    pub fn clear(&self) -> usize {
        let drained = self.registry.drain();
        for conn in &drained {
            conn.disconnect();
            self.handlers.disconnected(conn);
        }
        drained.len()
    }
}

/// Lock a mutex, recovering the guard if a panicking handler poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
