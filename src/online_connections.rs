//! Per-owner registry holding the canonical strong reference to each live
//! [`TcpConnection`]. Scoped to one `TcpClient` or `TcpServer` rather than
//! process-wide, per the design note that a single global registry would
//! force cross-loop locking for no benefit — each owner only ever touches
//! its own registry from its own loop thread.
//!
//! Its purpose is solely to keep a connection alive even if a user callback
//! drops every other reference it's holding; lookups by name are a
//! convenience, not the registry's main job (that's
//! [`crate::tcp_connection::TcpConnectionHandle`]'s id-based lookup).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::tcp_connection::TcpConnection;

#[derive(Default)]
pub struct OnlineConnections {
    connections: RefCell<HashMap<String, Rc<TcpConnection>>>,
}

impl OnlineConnections {
    pub fn new() -> OnlineConnections {
        OnlineConnections::default()
    }

    pub fn insert(&self, conn: Rc<TcpConnection>) {
        self.connections
            .borrow_mut()
            .insert(conn.name().to_string(), conn);
    }

    pub fn remove(&self, name: &str) -> Option<Rc<TcpConnection>> {
        self.connections.borrow_mut().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Rc<TcpConnection>> {
        self.connections.borrow().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::sys::socket::Socket;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::{FromRawFd, IntoRawFd};

    fn connected_pair(ev: &Rc<EventLoop>, name: &str) -> Rc<TcpConnection> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let socket = unsafe { Socket::from_raw_fd(server.into_raw_fd()) };
        // Leak the client stream for the test's duration so the fd stays open.
        std::mem::forget(_client);
        TcpConnection::new(ev.clone(), name.to_string(), socket).unwrap()
    }

    #[test]
    fn insert_then_get_then_remove_round_trips() {
        let ev = EventLoop::new().unwrap();
        let registry = OnlineConnections::new();
        let conn = connected_pair(&ev, "conn-a");

        registry.insert(conn.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("conn-a").is_some());

        let removed = registry.remove("conn-a");
        assert!(removed.is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_keeps_connection_alive_after_caller_drops_its_reference() {
        let ev = EventLoop::new().unwrap();
        let registry = OnlineConnections::new();
        let conn = connected_pair(&ev, "conn-b");
        let weak = Rc::downgrade(&conn);

        registry.insert(conn);
        assert!(weak.upgrade().is_some());
    }
}
