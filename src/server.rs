//! TCP server lifecycle.
//!
//! `TcpServer` owns the listener/acceptor thread, the poll thread and the
//! shared connection registry, and exposes the operations callers use to
//! talk to connected peers.
//!
//! ```text
//! Down --start()--> Up --stop()--> Down
//!   \--start() fails--> ErrInit | ErrBind | ErrKeepAlive | ErrListen
//! ```
//!
//! Error states only describe the last `start()` attempt; calling
//! `start()` again retries from scratch.

use crate::codec::Message;
use crate::error::SocketError;
use crate::keepalive::KeepAliveConfig;
use crate::runtime::{
    lock, Acceptor, AcceptorHandle, Connection, ConnectionHandler, DataHandler, Poller, Shared,
};
use crate::socket;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a `TcpServer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not running (initial state, and after `stop()`).
    Down,
    /// Listening and serving peers.
    Up,
    /// Socket creation or loop setup failed.
    ErrInit,
    /// Address reuse or bind failed.
    ErrBind,
    /// Keep-alive could not be enabled.
    ErrKeepAlive,
    /// `listen()` failed.
    ErrListen,
}

impl ServerState {
    pub fn is_error(self) -> bool {
        !matches!(self, ServerState::Down | ServerState::Up)
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind to (all interfaces by default).
    pub host: IpAddr,
    pub port: u16,
    /// Listen backlog.
    pub backlog: i32,
    /// Interval between registry scans.
    pub poll_interval: Duration,
    /// Registry capacity (0 = unlimited).
    pub max_connections: usize,
    /// Longest stall tolerated while a frame is partially received.
    pub read_timeout: Option<Duration>,
    /// Timeout for outbound `connect_to` (None = block).
    pub connect_timeout: Option<Duration>,
    pub keepalive: KeepAliveConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            backlog: 1024,
            poll_interval: Duration::from_millis(50),
            max_connections: 10_000,
            read_timeout: Some(Duration::from_secs(5)),
            connect_timeout: None,
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl ServerOptions {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

/// The two long-lived loops of a running server.
struct Loops {
    running: Arc<AtomicBool>,
    acceptor: Option<AcceptorHandle>,
    poller: Option<Poller>,
}

impl Loops {
    fn shutdown(self) {
        self.running.store(false, Ordering::Release);
        if let Some(acceptor) = self.acceptor {
            acceptor.shutdown();
        }
        if let Some(poller) = self.poller {
            poller.join();
        }
    }
}

/// Multi-connection TCP server speaking length-prefixed frames.
pub struct TcpServer {
    options: Mutex<ServerOptions>,
    shared: Arc<Shared>,
    state: Mutex<ServerState>,
    /// Serializes `start`/`stop`; `Some` while the loops run.
    loops: Mutex<Option<Loops>>,
    local_addr: Mutex<Option<SocketAddr>>,
    last_error: Mutex<Option<String>>,
    /// Set when the loops have been stopped; `join` waits on it.
    stopped: (Mutex<bool>, Condvar),
}

impl TcpServer {
    /// Create a server with a data handler and no-op connect/disconnect handlers.
    pub fn new<F>(options: ServerOptions, handler: F) -> Self
    where
        F: Fn(Message, &Connection) + Send + Sync + 'static,
    {
        let shared = Shared::new(
            Arc::new(handler),
            options.max_connections,
            options.keepalive,
            options.read_timeout,
        );

        Self {
            options: Mutex::new(options),
            shared: Arc::new(shared),
            state: Mutex::new(ServerState::Down),
            loops: Mutex::new(None),
            local_addr: Mutex::new(None),
            last_error: Mutex::new(None),
            stopped: (Mutex::new(true), Condvar::new()),
        }
    }

    /// Set the handler run after a peer connects, before it is registered.
    pub fn on_connect<F>(self, handler: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.handlers.set_connect(Arc::new(handler));
        self
    }

    /// Set the handler run once per connection after it leaves the registry.
    pub fn on_disconnect<F>(self, handler: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.handlers.set_disconnect(Arc::new(handler));
        self
    }

    /// Replace the data handler. Messages already dispatched keep the old one.
    pub fn set_data_handler<F>(&self, handler: F)
    where
        F: Fn(Message, &Connection) + Send + Sync + 'static,
    {
        let handler: DataHandler = Arc::new(handler);
        self.shared.handlers.set_data(handler);
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        lock(&self.options).port
    }

    /// Change the port and (re)start the server on it.
    pub fn set_port(&self, port: u16) -> ServerState {
        lock(&self.options).port = port;
        self.start()
    }

    /// Address the listener is actually bound to, while up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Description of the error behind the last failed `start()`.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Bind, listen and spawn the acceptor and poll loops.
    ///
    /// A running server is stopped first.
    pub fn start(&self) -> ServerState {
        let mut loops = lock(&self.loops);
        if let Some(running) = loops.take() {
            self.shutdown(running);
        }

        let options = lock(&self.options).clone();
        let addr = SocketAddr::new(options.host, options.port);

        let acceptor = match open_listener(addr, &options) {
            Ok(acceptor) => acceptor,
            Err(e) => return self.fail(e),
        };

        *lock(&self.local_addr) = acceptor.local_addr();
        *lock(&self.last_error) = None;
        *lock(&self.state) = ServerState::Up;
        *lock(&self.stopped.0) = false;

        let running = Arc::new(AtomicBool::new(true));
        let mut started = Loops {
            running: Arc::clone(&running),
            acceptor: None,
            poller: None,
        };

        let spawned = acceptor
            .spawn(Arc::clone(&self.shared), Arc::clone(&running), options.poll_interval)
            .and_then(|handle| {
                started.acceptor = Some(handle);
                Poller::spawn(Arc::clone(&self.shared), running, options.poll_interval)
            });

        match spawned {
            Ok(poller) => started.poller = Some(poller),
            Err(e) => {
                self.shutdown(started);
                return self.fail(e);
            }
        }

        *loops = Some(started);
        info!(
            addr = %addr,
            bound = ?self.local_addr(),
            backlog = options.backlog,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            "Server up"
        );
        ServerState::Up
    }

    /// Stop both loops, wait for outstanding workers, then clear the registry.
    ///
    /// Workers still waiting on a partial frame are interrupted, which drops
    /// those peers. Every connection still registered is closed and gets its
    /// disconnect handler. Safe to call repeatedly. Must not be called from inside a
    /// handler, which would wait on itself.
    pub fn stop(&self) {
        let mut loops = lock(&self.loops);
        if let Some(running) = loops.take() {
            self.shutdown(running);
        }
    }

    fn shutdown(&self, loops: Loops) {
        *lock(&self.state) = ServerState::Down;
        loops.shutdown();
        let interrupted = self.shared.interrupt_reads();
        let pending = self.shared.dispatcher.in_flight();
        if pending > 0 {
            debug!(pending, interrupted, "Waiting for workers");
        }
        self.shared.dispatcher.join_all();
        let cleared = self.shared.clear();
        *lock(&self.local_addr) = None;

        let (stopped, cvar) = &self.stopped;
        *lock(stopped) = true;
        cvar.notify_all();

        info!(cleared, "Server stopped");
    }

    fn fail(&self, e: SocketError) -> ServerState {
        let state = e.state();
        error!(error = %e, state = ?state, "Server start failed");
        *lock(&self.last_error) = Some(e.to_string());
        *lock(&self.state) = state;
        state
    }

    /// Block until the server is stopped.
    pub fn join(&self) {
        let (stopped, cvar) = &self.stopped;
        let mut done = lock(stopped);
        while !*done {
            done = cvar
                .wait(done)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Send `payload` to every registered connection.
    pub fn send_to_all(&self, payload: &[u8]) {
        for conn in self.shared.registry.snapshot() {
            conn.send(payload);
        }
    }

    /// Send `payload` to every connection whose peer is `host:port`.
    ///
    /// Returns `true` if at least one connection matched and a write was
    /// attempted.
    pub fn send_to(&self, host: IpAddr, port: u16, payload: &[u8]) -> bool {
        let matches = self.shared.registry.find_by(host, port);
        for conn in &matches {
            conn.send(payload);
        }
        !matches.is_empty()
    }

    /// Disconnect every connection whose peer is `host:port`.
    ///
    /// Returns `true` if at least one connection matched.
    pub fn disconnect_by(&self, host: IpAddr, port: u16) -> bool {
        let matches = self.shared.registry.find_by(host, port);
        for conn in &matches {
            conn.disconnect();
            self.shared.schedule_teardown(conn);
        }
        !matches.is_empty()
    }

    /// Disconnect every registered connection.
    pub fn disconnect_all(&self) {
        for conn in self.shared.registry.snapshot() {
            conn.disconnect();
            self.shared.schedule_teardown(&conn);
        }
    }

    /// Open an outbound connection and serve it like an accepted peer.
    ///
    /// `on_connect` runs instead of the server-wide connect handler.
    pub fn connect_to<F>(&self, host: IpAddr, port: u16, on_connect: F) -> bool
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        let addr = SocketAddr::new(host, port);
        let timeout = lock(&self.options).connect_timeout;

        let socket = match socket::connect(addr, timeout) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "Outbound connect failed");
                return false;
            }
        };

        let on_connect: ConnectionHandler = Arc::new(on_connect);
        match self.shared.admit(socket, addr, Some(&on_connect)) {
            Ok(conn) => {
                info!(conn_id = %conn.id(), peer = %addr, "Outbound connection established");
                true
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "Outbound connection rejected");
                false
            }
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_listener(addr: SocketAddr, options: &ServerOptions) -> Result<Acceptor, SocketError> {
    let listener = socket::listen(addr, options.backlog)?;
    options
        .keepalive
        .apply(&listener)
        .map_err(SocketError::KeepAlive)?;
    Acceptor::new(listener)
}
