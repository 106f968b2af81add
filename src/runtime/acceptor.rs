//! Listener/acceptor loop.
//!
//! The listening socket is non-blocking and registered with a mio `Poll`
//! alongside a `Waker`. `shutdown` flips the shared running flag and wakes
//! the poll, so the loop exits without waiting for another peer to arrive.
//! The listener is closed when the loop thread drops it.

use super::Shared;
use crate::error::SocketError;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Poll and waker set up for a listener, ready to be spawned.
pub(crate) struct Acceptor {
    listener: Socket,
    poll: Poll,
    waker: Arc<Waker>,
}

/// Handle to a running acceptor thread.
pub(crate) struct AcceptorHandle {
    waker: Arc<Waker>,
    handle: JoinHandle<()>,
}

impl Acceptor {
    /// Register `listener` for readiness. Fails before any thread exists.
    pub fn new(listener: Socket) -> Result<Self, SocketError> {
        listener.set_nonblocking(true).map_err(SocketError::Poll)?;

        let poll = Poll::new().map_err(SocketError::Poll)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER_TOKEN,
                Interest::READABLE,
            )
            .map_err(SocketError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(SocketError::Poll)?);

        Ok(Self {
            listener,
            poll,
            waker,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok().and_then(|addr| addr.as_socket())
    }

    /// Start the accept loop on its own thread.
    ///
    /// `interval` bounds how long the loop can sleep without re-checking
    /// `running`, even if a wake-up is lost.
    pub fn spawn(
        self,
        shared: Arc<Shared>,
        running: Arc<AtomicBool>,
        interval: Duration,
    ) -> Result<AcceptorHandle, SocketError> {
        let waker = Arc::clone(&self.waker);
        let handle = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || self.run(&shared, &running, interval))
            .map_err(|e| SocketError::Spawn("acceptor", e))?;

        Ok(AcceptorHandle { waker, handle })
    }

    fn run(mut self, shared: &Arc<Shared>, running: &AtomicBool, interval: Duration) {
        let mut events = Events::with_capacity(64);
        debug!("Acceptor started");

        while running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(interval)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(error = %e, "Acceptor poll failed");
                    thread::sleep(interval);
                }
                continue;
            }

            // Readiness is edge-triggered, so drain the backlog on every
            // wake-up rather than only on a listener event.
            self.accept_pending(shared, running);
        }

        debug!("Acceptor exiting");
    }

    fn accept_pending(&self, shared: &Arc<Shared>, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            let (socket, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient (EMFILE, ECONNABORTED, ...); retry next wake-up.
                    warn!(error = %e, "Accept error");
                    return;
                }
            };

            let Some(peer) = addr.as_socket() else {
                warn!("Accepted non-inet peer, closing");
                continue;
            };

            // BSD-derived kernels let accepted sockets inherit O_NONBLOCK.
            if let Err(e) = socket.set_nonblocking(false) {
                warn!(peer = %peer, error = %e, "Failed to switch peer to blocking mode, closing");
                continue;
            }

            match shared.admit(socket, peer, None) {
                Ok(conn) => {
                    debug!(conn_id = %conn.id(), peer = %peer, "Accepted connection");
                }
                Err(SocketError::KeepAlive(e)) => {
                    warn!(peer = %peer, error = %e, "Keep-alive setup failed, closing");
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Connection rejected");
                }
            }
        }
    }
}

impl AcceptorHandle {
    /// Wake the loop and wait for it to exit. The caller clears `running` first.
    pub fn shutdown(self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake acceptor, waiting for poll timeout");
        }
        if self.handle.join().is_err() {
            error!("Acceptor thread panicked");
        }
    }
}
