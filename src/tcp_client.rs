//! Orchestrates one [`Connector`] plus at most one live [`TcpConnection`].
//! User callbacks are stored once and shared across however many
//! connections the client cycles through (forwarded via a shared
//! `Rc<RefCell<Option<Box<dyn FnMut…>>>>` per callback, since closures
//! aren't generally `Clone` and each reconnect gets a freshly constructed
//! `TcpConnection`).

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::buffer::Buffer;
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::sockaddr::SockAddr;
use crate::sys::socket::Socket;
use crate::tcp_connection::{TcpConnection, TcpConnectionHandle};

type ConnCallback = Box<dyn FnMut(&Rc<TcpConnection>)>;
type MessageCallback = Box<dyn FnMut(&Rc<TcpConnection>, &mut Buffer)>;

/// `Send + Sync` observer onto whichever `TcpConnection` a `TcpClient`
/// currently holds, so code on another thread can grab one, stash it, and
/// poll or `send` through it without ever touching the client's `Rc`.
#[derive(Clone)]
pub struct ConnPtr(Arc<Mutex<Option<TcpConnectionHandle>>>);

impl ConnPtr {
    pub fn get(&self) -> Option<TcpConnectionHandle> {
        self.0.lock().unwrap().clone()
    }
}

pub struct TcpClient {
    event_loop: Rc<EventLoop>,
    name: String,
    connector: Rc<Connector>,
    retry_enabled: Cell<bool>,
    current: RefCell<Option<Rc<TcpConnection>>>,
    conn_slot: ConnPtr,
    connection_cb: Rc<RefCell<Option<ConnCallback>>>,
    message_cb: Rc<RefCell<Option<MessageCallback>>>,
    write_complete_cb: Rc<RefCell<Option<ConnCallback>>>,
    close_cb: Rc<RefCell<Option<ConnCallback>>>,
    self_ref: RefCell<Weak<TcpClient>>,
}

impl TcpClient {
    pub fn new(event_loop: Rc<EventLoop>, server_addr: SockAddr, name: String) -> Rc<TcpClient> {
        let connector = Connector::new(event_loop.clone(), server_addr);
        Self::from_connector(event_loop, name, connector)
    }

    /// Same as [`TcpClient::new`] but with the retry backoff bounds
    /// overridden, so a test can exercise the full retry schedule without
    /// waiting out the real 1s/30s defaults.
    pub fn with_retry_bounds(
        event_loop: Rc<EventLoop>,
        server_addr: SockAddr,
        name: String,
        init_retry: std::time::Duration,
        max_retry: std::time::Duration,
    ) -> Rc<TcpClient> {
        let connector =
            Connector::with_retry_bounds(event_loop.clone(), server_addr, init_retry, max_retry);
        Self::from_connector(event_loop, name, connector)
    }

    fn from_connector(event_loop: Rc<EventLoop>, name: String, connector: Rc<Connector>) -> Rc<TcpClient> {
        let client = Rc::new(TcpClient {
            event_loop,
            name,
            connector,
            retry_enabled: Cell::new(false),
            current: RefCell::new(None),
            conn_slot: ConnPtr(Arc::new(Mutex::new(None))),
            connection_cb: Rc::new(RefCell::new(None)),
            message_cb: Rc::new(RefCell::new(None)),
            write_complete_cb: Rc::new(RefCell::new(None)),
            close_cb: Rc::new(RefCell::new(None)),
            self_ref: RefCell::new(Weak::new()),
        });
        *client.self_ref.borrow_mut() = Rc::downgrade(&client);

        let weak = client.weak_self();
        client.connector.set_new_connection_callback(move |socket, _peer| {
            if let Some(this) = weak.upgrade() {
                this.new_connection(socket);
            }
        });

        client
    }

    fn weak_self(&self) -> Weak<TcpClient> {
        self.self_ref.borrow().clone()
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Rc<TcpConnection>) + 'static) {
        *self.connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl FnMut(&Rc<TcpConnection>, &mut Buffer) + 'static) {
        *self.message_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Rc<TcpConnection>) + 'static) {
        *self.write_complete_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Fires once the connection has fully closed (after `Disconnected`),
    /// whether the peer hung up or a local `shutdown()`/`force_close()` did.
    pub fn set_close_callback(&self, cb: impl FnMut(&Rc<TcpConnection>) + 'static) {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// When set, a connection closed by the peer triggers an automatic
    /// `Connector::restart` rather than leaving the client idle.
    pub fn enable_retry(&self) {
        self.retry_enabled.set(true);
    }

    pub fn connect(&self) {
        self.event_loop.assert_in_loop();
        self.connector.start();
    }

    pub fn disconnect(&self) {
        self.event_loop.assert_in_loop();
        if let Some(conn) = self.current.borrow().clone() {
            conn.shutdown();
        }
    }

    pub fn stop(&self) {
        self.event_loop.assert_in_loop();
        self.connector.stop();
    }

    /// A cloneable, cross-thread-safe observer of whatever connection is
    /// currently live. Obtain it on the loop thread, then hand clones to
    /// other threads freely.
    pub fn conn_ptr(&self) -> ConnPtr {
        self.conn_slot.clone()
    }

    fn new_connection(self: &Rc<Self>, socket: Socket) {
        self.event_loop.assert_in_loop();
        let peer = socket
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let conn_name = format!("{}-{peer}", self.name);

        let conn = match TcpConnection::new(self.event_loop.clone(), conn_name, socket) {
            Ok(c) => c,
            Err(e) => {
                warn!("{}: failed to wrap accepted connection: {e}", self.name);
                return;
            }
        };

        let connection_cb = self.connection_cb.clone();
        conn.set_connection_callback(move |c| {
            if let Some(cb) = connection_cb.borrow_mut().as_mut() {
                cb(c);
            }
        });
        let message_cb = self.message_cb.clone();
        conn.set_message_callback(move |c, buf| {
            if let Some(cb) = message_cb.borrow_mut().as_mut() {
                cb(c, buf);
            }
        });
        let write_complete_cb = self.write_complete_cb.clone();
        conn.set_write_complete_callback(move |c| {
            if let Some(cb) = write_complete_cb.borrow_mut().as_mut() {
                cb(c);
            }
        });

        let weak = self.weak_self();
        conn.set_close_callback(move |c| {
            if let Some(this) = weak.upgrade() {
                this.connection_closed(c);
            }
        });

        *self.current.borrow_mut() = Some(conn.clone());
        *self.conn_slot.0.lock().unwrap() = Some(conn.handle());
        conn.establish();
    }

    fn connection_closed(self: &Rc<Self>, conn: &Rc<TcpConnection>) {
        *self.current.borrow_mut() = None;
        *self.conn_slot.0.lock().unwrap() = None;
        if let Some(cb) = self.close_cb.borrow_mut().as_mut() {
            cb(conn);
        }
        if self.retry_enabled.get() {
            self.connector.restart();
        }
    }
}
