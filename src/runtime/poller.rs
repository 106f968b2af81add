//! Poll/dispatch loop.
//!
//! Every `interval` the loop snapshots the registry and probes each
//! connection without blocking:
//! - data pending: claim the read side and hand the connection to a worker
//!   that reads one frame and runs the data handler
//! - peer gone or socket already disconnected: hand the connection to a
//!   teardown worker (once)
//!
//! The loop itself never reads, so a peer stalling mid-frame only holds up
//! its own worker. A connection whose read side is claimed is skipped until
//! the worker is done with it, which keeps one peer's messages in order.
//! Only the snapshot is taken under the registry lock.

use super::{Connection, Shared};
use crate::error::SocketError;
use crate::socket::Readiness;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Handle to a running poll thread.
pub(crate) struct Poller {
    handle: JoinHandle<()>,
}

impl Poller {
    pub fn spawn(
        shared: Arc<Shared>,
        running: Arc<AtomicBool>,
        interval: Duration,
    ) -> Result<Self, SocketError> {
        let handle = thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || run(&shared, &running, interval))
            .map_err(|e| SocketError::Spawn("poller", e))?;

        Ok(Self { handle })
    }

    /// Wait for the loop to exit. The caller clears `running` first.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Poll thread panicked");
        }
    }
}

fn run(shared: &Arc<Shared>, running: &AtomicBool, interval: Duration) {
    debug!(interval_ms = interval.as_millis() as u64, "Poll loop started");

    while running.load(Ordering::Acquire) {
        let dispatched = scan(shared, running);
        if dispatched > 0 {
            trace!(dispatched, "Poll tick");
        }
        thread::sleep(interval);
    }

    debug!("Poll loop exiting");
}

/// One pass over the registry. Returns the number of workers dispatched.
pub(crate) fn scan(shared: &Arc<Shared>, running: &AtomicBool) -> usize {
    let mut dispatched = 0;

    for conn in shared.registry.snapshot() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        if poll_connection(shared, &conn) {
            dispatched += 1;
        }
    }

    dispatched
}

fn poll_connection(shared: &Arc<Shared>, conn: &Arc<Connection>) -> bool {
    match conn.readiness() {
        Readiness::Idle => false,
        Readiness::Ready => {
            if !conn.try_begin_read() {
                return false;
            }
            let worker_shared = Arc::clone(shared);
            let worker_conn = Arc::clone(conn);
            shared.dispatcher.spawn("receive", conn.id(), move || {
                receive_one(&worker_shared, &worker_conn);
            });
            true
        }
        Readiness::Closed => {
            conn.disconnect();
            shared.schedule_teardown(conn)
        }
    }
}

/// Releases the read side when dropped, even if the handler panics.
struct ReadClaim<'a>(&'a Connection);

impl Drop for ReadClaim<'_> {
    fn drop(&mut self) {
        self.0.end_read();
    }
}

fn receive_one(shared: &Arc<Shared>, conn: &Arc<Connection>) {
    let _claim = ReadClaim(conn);
    match conn.receive() {
        Some(message) => shared.handlers.deliver(message, conn),
        // `receive` already disconnected.
        None => {
            shared.schedule_teardown(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::keepalive::KeepAliveConfig;
    use socket2::Socket;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    struct Harness {
        shared: Arc<Shared>,
        received: Arc<Mutex<Vec<Vec<u8>>>>,
        disconnects: Arc<AtomicUsize>,
        listener: TcpListener,
    }

    impl Harness {
        fn new() -> Self {
            let received = Arc::new(Mutex::new(Vec::new()));
            let sink = received.clone();
            let shared = Arc::new(Shared::new(
                Arc::new(move |msg: codec::Message, _conn: &Connection| {
                    sink.lock().unwrap().push(msg.payload().to_vec())
                }),
                0,
                KeepAliveConfig::default(),
                Some(Duration::from_secs(2)),
            ));
            let disconnects = Arc::new(AtomicUsize::new(0));
            let counter = disconnects.clone();
            shared.handlers.set_disconnect(Arc::new(move |_: &Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

            Self {
                shared,
                received,
                disconnects,
                listener: TcpListener::bind("127.0.0.1:0").unwrap(),
            }
        }

        fn connect(&self) -> (Arc<Connection>, TcpStream) {
            let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
            let (stream, peer) = self.listener.accept().unwrap();
            let conn = self.shared.admit(Socket::from(stream), peer, None).unwrap();
            (conn, client)
        }

        /// Scan until `done` holds or two seconds pass.
        fn scan_until(&self, done: impl Fn(&Self) -> bool) {
            let running = AtomicBool::new(true);
            let deadline = Instant::now() + Duration::from_secs(2);
            while !done(self) {
                assert!(Instant::now() < deadline, "condition not reached");
                scan(&self.shared, &running);
                thread::sleep(Duration::from_millis(5));
            }
            self.shared.dispatcher.join_all();
        }
    }

    #[test]
    fn test_idle_connection_untouched() {
        let h = Harness::new();
        let (_conn, _client) = h.connect();

        let running = AtomicBool::new(true);
        assert_eq!(scan(&h.shared, &running), 0);
        assert_eq!(h.shared.registry.len(), 1);
    }

    #[test]
    fn test_ready_frame_is_delivered() {
        let h = Harness::new();
        let (_conn, mut client) = h.connect();
        client.write_all(&codec::encode(b"hello").unwrap()).unwrap();

        h.scan_until(|h| !h.received.lock().unwrap().is_empty());
        assert_eq!(h.received.lock().unwrap()[0], b"hello");
    }

    #[test]
    fn test_peer_close_tears_down_once() {
        let h = Harness::new();
        let (conn, client) = h.connect();
        drop(client);

        h.scan_until(|h| h.shared.registry.is_empty());
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());

        // Further scans find nothing to tear down.
        let running = AtomicBool::new(true);
        assert_eq!(scan(&h.shared, &running), 0);
        h.shared.dispatcher.join_all();
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_frame_tears_down_without_delivery() {
        let h = Harness::new();
        let (_conn, mut client) = h.connect();
        client.write_all(&2_097_152u32.to_be_bytes()).unwrap();

        h.scan_until(|h| h.shared.registry.is_empty());
        assert!(h.received.lock().unwrap().is_empty());
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_disconnect_detected() {
        let h = Harness::new();
        let (conn, _client) = h.connect();
        conn.disconnect();

        h.scan_until(|h| h.shared.registry.is_empty());
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_scan_stops_early() {
        let h = Harness::new();
        let (_conn, client) = h.connect();
        drop(client);

        let running = AtomicBool::new(false);
        assert_eq!(scan(&h.shared, &running), 0);
        assert_eq!(h.shared.registry.len(), 1);
    }

    #[test]
    fn test_stalled_peer_does_not_block_scan() {
        let h = Harness::new();
        let (slow, mut slow_client) = h.connect();
        let (_fast, mut fast_client) = h.connect();

        // Header promises 100 bytes that never come.
        slow_client.write_all(&100u32.to_be_bytes()).unwrap();
        fast_client
            .write_all(&codec::encode(b"fast").unwrap())
            .unwrap();

        let running = AtomicBool::new(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.received.lock().unwrap().is_empty() || !slow.is_reading() {
            assert!(Instant::now() < deadline, "fast peer starved");
            let started = Instant::now();
            scan(&h.shared, &running);
            assert!(started.elapsed() < Duration::from_millis(500));
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.received.lock().unwrap()[0], b"fast");

        // The claimed connection is skipped, not read twice.
        scan(&h.shared, &running);

        assert_eq!(h.shared.interrupt_reads(), 1);
        h.shared.dispatcher.join_all();
        assert!(!slow.is_connected());
        assert_eq!(h.disconnects.load(Ordering::SeqCst), 1);
    }
}
