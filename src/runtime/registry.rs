//! Registry of live connections.
//!
//! One mutex guards the whole collection. It is held only for bookkeeping
//! (push, search, remove, clone of the `Arc`s), never while doing socket
//! I/O, so callers work on snapshots.

use super::{lock, Connection, ConnectionId};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

/// Shared collection of live connections.
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry holding at most `max_connections` peers (0 = no limit).
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            max_connections,
        }
    }

    /// Publish a connection.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&self, conn: Arc<Connection>) -> Result<(), Arc<Connection>> {
        let mut connections = lock(&self.connections);
        if self.max_connections != 0 && connections.len() >= self.max_connections {
            return Err(conn);
        }
        connections.push(conn);
        Ok(())
    }

    /// Detach a connection and give the caller the registry's reference.
    ///
    /// Search and removal happen under one lock acquisition, so exactly one
    /// caller can ever get `Some` for a given id.
    pub fn remove_and_take(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = lock(&self.connections);
        let pos = connections.iter().position(|c| c.id() == id)?;
        Some(connections.swap_remove(pos))
    }

    /// Look up a connection by id.
    #[cfg(test)]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        lock(&self.connections)
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// All connections whose peer is `host:port`.
    pub fn find_by(&self, host: IpAddr, port: u16) -> Vec<Arc<Connection>> {
        lock(&self.connections)
            .iter()
            .filter(|c| c.host() == host && c.port() == port)
            .cloned()
            .collect()
    }

    /// Consistent copy of the current membership.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        lock(&self.connections).clone()
    }

    /// Remove every connection, handing them all to the caller.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut *lock(&self.connections))
    }

    /// Check if a connection is registered.
    #[cfg(test)]
    pub fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.connections).iter().any(|c| c.id() == id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        lock(&self.connections).is_empty()
    }

    /// Maximum number of connections allowed (0 = no limit).
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::Socket;
    use std::net::{TcpListener, TcpStream};

    struct Peer {
        conn: Arc<Connection>,
        _client: TcpStream,
    }

    fn peer(listener: &TcpListener) -> Peer {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, addr) = listener.accept().unwrap();
        Peer {
            conn: Arc::new(Connection::new(Socket::from(stream), addr)),
            _client: client,
        }
    }

    #[test]
    fn test_connection_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new(2);

        let p1 = peer(&listener);
        let p2 = peer(&listener);
        let p3 = peer(&listener);

        registry.insert(p1.conn.clone()).unwrap();
        registry.insert(p2.conn.clone()).unwrap();

        // At capacity
        let rejected = registry.insert(p3.conn.clone()).unwrap_err();
        assert_eq!(rejected.id(), p3.conn.id());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        assert!(registry.contains(p1.conn.id()));
        assert_eq!(registry.get(p2.conn.id()).unwrap().id(), p2.conn.id());

        let taken = registry.remove_and_take(p1.conn.id()).unwrap();
        assert!(Arc::ptr_eq(&taken, &p1.conn));
        assert!(!registry.contains(p1.conn.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_take_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new(0);
        let p = peer(&listener);
        registry.insert(p.conn.clone()).unwrap();

        assert!(registry.remove_and_take(p.conn.id()).is_some());
        assert!(registry.remove_and_take(p.conn.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_by_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new(0);
        let p1 = peer(&listener);
        let p2 = peer(&listener);
        registry.insert(p1.conn.clone()).unwrap();
        registry.insert(p2.conn.clone()).unwrap();

        let found = registry.find_by(p2.conn.host(), p2.conn.port());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), p2.conn.id());

        let missing = registry.find_by("10.255.255.1".parse().unwrap(), p2.conn.port());
        assert!(missing.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new(0);
        let p = peer(&listener);
        registry.insert(p.conn.clone()).unwrap();

        let snapshot = registry.snapshot();
        registry.remove_and_take(p.conn.id());

        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = ConnectionRegistry::new(0);
        let peers: Vec<Peer> = (0..3).map(|_| peer(&listener)).collect();
        for p in &peers {
            registry.insert(p.conn.clone()).unwrap();
        }

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let registry = Arc::new(ConnectionRegistry::new(0));
        let peers: Vec<Peer> = (0..16).map(|_| peer(&listener)).collect();

        std::thread::scope(|s| {
            for p in &peers {
                let registry = registry.clone();
                let conn = p.conn.clone();
                s.spawn(move || registry.insert(conn).unwrap());
            }
        });

        assert_eq!(registry.len(), 16);
    }
}
