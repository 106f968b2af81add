//! Raw socket operations.
//!
//! Everything that touches the OS socket API directly lives here:
//! creating the listener, outbound connects, and the non-blocking
//! readiness probe used by the poll loop. Errors come back as
//! `SocketError`, so callers never look at raw OS error codes.

use crate::error::SocketError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::mem::MaybeUninit;
use std::time::{Duration, Instant};

/// What a connection has waiting for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one byte can be read without blocking.
    Ready,
    /// Nothing to read yet.
    Idle,
    /// Peer closed the stream or the socket errored.
    Closed,
}

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

/// Create a listening socket bound to `addr` with address reuse enabled.
///
/// The socket is left in blocking mode; the acceptor switches it as needed.
pub fn listen(addr: SocketAddr, backlog: i32) -> Result<Socket, SocketError> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(SocketError::Create)?;

    socket
        .set_reuse_address(true)
        .map_err(SocketError::ReuseAddress)?;
    socket
        .bind(&addr.into())
        .map_err(|source| SocketError::Bind { addr, source })?;
    socket
        .listen(backlog)
        .map_err(|source| SocketError::Listen { addr, source })?;

    Ok(socket)
}

/// Open a blocking outbound connection to `addr`.
pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<Socket, SocketError> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(SocketError::Create)?;

    let target = SockAddr::from(addr);
    let result = match timeout {
        Some(timeout) => socket.connect_timeout(&target, timeout),
        None => socket.connect(&target),
    };
    result.map_err(|source| SocketError::Connect { addr, source })?;

    Ok(socket)
}

/// Peer address of an accepted or connected socket.
pub fn peer_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket
        .peer_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
}

/// Check whether `socket` has data without consuming it or blocking.
pub fn probe(socket: &Socket) -> Readiness {
    let mut byte = [MaybeUninit::<u8>::uninit(); 1];
    match socket.recv_with_flags(&mut byte, libc::MSG_PEEK | libc::MSG_DONTWAIT) {
        Ok(0) => Readiness::Closed,
        Ok(_) => Readiness::Ready,
        Err(ref e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Readiness::Idle
        }
        Err(_) => Readiness::Closed,
    }
}

/// `Read` adapter that gives everything read through it one shared deadline.
///
/// Before each read the socket timeout is cut to the time left, so a peer
/// trickling bytes cannot stretch a frame past the deadline.
pub struct DeadlineReader<'a> {
    socket: &'a Socket,
    deadline: Option<Instant>,
}

impl<'a> DeadlineReader<'a> {
    /// `None` reads without any deadline.
    pub fn new(socket: &'a Socket, timeout: Option<Duration>) -> Self {
        Self {
            socket,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            self.socket.set_read_timeout(Some(remaining))?;
        }

        let mut socket = self.socket;
        match socket.read(buf) {
            // SO_RCVTIMEO expiry surfaces as EAGAIN.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(timed_out()),
            result => result,
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "frame read deadline expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn bound_addr(socket: &Socket) -> SocketAddr {
        socket.local_addr().unwrap().as_socket().unwrap()
    }

    #[test]
    fn test_listen_and_connect() {
        let listener = listen(loopback(), 16).unwrap();
        let addr = bound_addr(&listener);

        let client = connect(addr, Some(Duration::from_secs(2))).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        assert_eq!(peer_addr(&server_side).unwrap(), bound_addr(&client));
    }

    #[test]
    fn test_bind_conflict_reports_bind() {
        let first = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = first.local_addr().unwrap();

        // A socket in LISTEN state holds the port even with address reuse.
        let err = listen(addr, 16).unwrap_err();
        assert!(matches!(err, SocketError::Bind { .. }), "got {err:?}");
    }

    #[test]
    fn test_connect_refused() {
        let addr = {
            let l = std::net::TcpListener::bind(loopback()).unwrap();
            l.local_addr().unwrap()
        };
        let err = connect(addr, Some(Duration::from_secs(2))).unwrap_err();
        assert!(matches!(err, SocketError::Connect { .. }));
    }

    #[test]
    fn test_probe_states() {
        let listener = listen(loopback(), 16).unwrap();
        let mut client = TcpStream::connect(bound_addr(&listener)).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        assert_eq!(probe(&server_side), Readiness::Idle);

        client.write_all(b"x").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while probe(&server_side) != Readiness::Ready {
            assert!(std::time::Instant::now() < deadline, "data never became ready");
            std::thread::sleep(Duration::from_millis(5));
        }
        // Peeking does not consume.
        assert_eq!(probe(&server_side), Readiness::Ready);

        let mut buf = [0u8; 1];
        (&server_side).read_exact(&mut buf).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while probe(&server_side) != Readiness::Closed {
            assert!(std::time::Instant::now() < deadline, "close never observed");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_deadline_bounds_trickling_peer() {
        let listener = listen(loopback(), 16).unwrap();
        let mut client = TcpStream::connect(bound_addr(&listener)).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        // Each byte arrives well inside the deadline; the total never does.
        let writer = std::thread::spawn(move || {
            for _ in 0..20 {
                if client.write_all(b"x").is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        });

        let started = Instant::now();
        let mut reader = DeadlineReader::new(&server_side, Some(Duration::from_millis(200)));
        let mut buf = [0u8; 20];
        let err = reader.read_exact(&mut buf).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(700));
        writer.join().unwrap();
    }

    #[test]
    fn test_expired_deadline_reads_nothing() {
        let listener = listen(loopback(), 16).unwrap();
        let mut client = TcpStream::connect(bound_addr(&listener)).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        client.write_all(b"x").unwrap();

        let mut reader = DeadlineReader::new(&server_side, Some(Duration::ZERO));
        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
