//! Connection state machine: recv -> parse -> match -> invoke -> send ->
//! reset, all synchronous within one worker's event loop.

use crate::buffer::RingBuffer;
use slab::Slab;
use std::os::unix::io::RawFd;

/// Current state of a connection, mirroring the state table: `Reading`
/// covers both the initial accept state and post-reset keep-alive reads;
/// `Writing` covers the four `Writing…` rows (400/404/500/200, they differ
/// only in the bytes already staged in `write_buf`). `Closed` has no
/// representation here: a closed connection is removed from the registry
/// and its fd closed immediately rather than left in a terminal state.
#[derive(Debug, Clone, Copy)]
pub enum ConnState {
    Reading,
    Writing { written: usize, total: usize },
}

/// A single client connection and everything owned for its lifetime.
pub struct Connection {
    pub fd: RawFd,
    pub state: ConnState,
    pub read_buf: RingBuffer,
    pub write_buf: Vec<u8>,
    /// Response headers accumulated by the current request's handler.
    /// Cleared (capacity retained) on reset.
    pub response_headers: Vec<(String, String)>,
    /// Response body staged by the current request's handler before
    /// serialization. Cleared (capacity retained) before each request and
    /// on reset, so a keep-alive connection never reallocates this once
    /// its capacity has grown to cover the handler's usual response size.
    pub response_body: Vec<u8>,
    /// Set when the in-flight write's response (400/500-not-callable)
    /// must close the connection once it completes, instead of
    /// resetting for keep-alive. Kept separate from `state` so the
    /// `Writing { written, total }` byte counters survive until the
    /// write actually finishes.
    pub close_after_write: bool,
}

impl Connection {
    pub fn new(fd: RawFd, read_buffer_size: usize) -> Self {
        Self {
            fd,
            state: ConnState::Reading,
            read_buf: RingBuffer::new(read_buffer_size),
            write_buf: Vec::new(),
            response_headers: Vec::new(),
            response_body: Vec::new(),
            close_after_write: false,
        }
    }

    pub fn start_writing(&mut self, total: usize) {
        self.state = ConnState::Writing { written: 0, total };
    }

    /// Resetting discipline: ring buffer reset, write buffer
    /// cleared retaining capacity, response header list cleared retaining
    /// capacity, socket stays open, state returns to Reading for
    /// keep-alive.
    pub fn reset_for_next_request(&mut self) {
        self.read_buf.reset();
        self.write_buf.clear();
        self.response_headers.clear();
        self.response_body.clear();
        self.close_after_write = false;
        self.state = ConnState::Reading;
    }
}

/// O(1) connection pool, indexed by slab id (the `conn_id` used in
/// completion tokens).
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_reading_with_empty_buffer() {
        let conn = Connection::new(7, 8192);
        assert!(matches!(conn.state, ConnState::Reading));
        assert_eq!(conn.read_buf.readable().len(), 0);
    }

    #[test]
    fn state_transitions() {
        let mut conn = Connection::new(7, 8192);
        conn.start_writing(42);
        assert!(matches!(
            conn.state,
            ConnState::Writing { written: 0, total: 42 }
        ));

        conn.reset_for_next_request();
        assert!(matches!(conn.state, ConnState::Reading));
    }

    #[test]
    fn close_after_write_survives_reset_is_false() {
        let mut conn = Connection::new(7, 8192);
        conn.close_after_write = true;
        conn.reset_for_next_request();
        assert!(!conn.close_after_write);
    }

    #[test]
    fn reset_clears_but_retains_capacity() {
        let mut conn = Connection::new(7, 64);
        conn.write_buf.extend_from_slice(b"some bytes");
        conn.response_headers.push(("X-A".into(), "1".into()));
        conn.response_body.extend_from_slice(b"pong");
        let write_cap_before = conn.write_buf.capacity();
        let body_cap_before = conn.response_body.capacity();

        conn.reset_for_next_request();

        assert!(conn.write_buf.is_empty());
        assert!(conn.response_headers.is_empty());
        assert!(conn.response_body.is_empty());
        assert_eq!(conn.write_buf.capacity(), write_cap_before);
        assert_eq!(conn.response_body.capacity(), body_cap_before);
    }

    #[test]
    fn registry_enforces_capacity() {
        let mut registry = ConnectionRegistry::new(1);
        let id1 = registry.insert(Connection::new(1, 64)).unwrap();
        assert!(registry.insert(Connection::new(2, 64)).is_none());

        registry.remove(id1);
        assert!(registry.insert(Connection::new(3, 64)).is_some());
    }
}
