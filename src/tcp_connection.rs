//! An established (or tearing-down) TCP connection: pumps bytes between a
//! [`Buffer`]-backed read/write pair and a nonblocking socket, through a
//! [`Dispatch`] wired the same way [`crate::connector::Connector`] wires its
//! own — weak `Rc` back-references captured by each callback closure, no
//! Dispatch `tie`.
//!
//! `TcpConnection` itself is `Rc`-based and loop-affine for everything
//! except `send`. Since `Rc<TcpConnection>` is never `Send`, "call `send`
//! from any thread" cannot mean handing the `Rc` across a thread boundary —
//! instead, [`TcpConnection::handle`] returns a [`TcpConnectionHandle`], a
//! small `Send + Sync + Clone` value carrying only a connection id and an
//! [`EventLoopHandle`]. Posting through it looks the connection back up by
//! id in a thread-local registry once the closure actually runs on the loop
//! thread, per the "arena keyed by a stable id" approach the design notes
//! call out for refcounted owners that can't cross threads directly.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::buffer::Buffer;
use crate::dispatch::Dispatch;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::sys::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

type ConnCallback = Box<dyn FnMut(&Rc<TcpConnection>)>;
type MessageCallback = Box<dyn FnMut(&Rc<TcpConnection>, &mut Buffer)>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id -> weak lookup used only to resolve a [`TcpConnectionHandle`]'s
    /// cross-thread `send` back to the live connection on the loop thread.
    /// Distinct from [`crate::online_connections::OnlineConnections`], which
    /// holds the canonical strong reference and is owned by a `TcpClient` or
    /// `TcpServer`, not by this module.
    static REGISTRY: RefCell<HashMap<u64, Weak<TcpConnection>>> = RefCell::new(HashMap::new());
}

fn register(id: u64, conn: Weak<TcpConnection>) {
    REGISTRY.with(|r| {
        r.borrow_mut().insert(id, conn);
    });
}

fn unregister(id: u64) {
    REGISTRY.with(|r| {
        r.borrow_mut().remove(&id);
    });
}

fn lookup(id: u64) -> Option<Rc<TcpConnection>> {
    REGISTRY.with(|r| r.borrow().get(&id).and_then(Weak::upgrade))
}

/// A `Send + Sync` handle that can reach a `TcpConnection` from any thread
/// by posting to its owning loop and resolving the connection there.
#[derive(Clone)]
pub struct TcpConnectionHandle {
    id: u64,
    loop_handle: EventLoopHandle,
}

impl TcpConnectionHandle {
    pub fn send(&self, data: &[u8]) {
        let id = self.id;
        let owned = data.to_vec();
        self.loop_handle.queue_in_loop(move || {
            if let Some(conn) = lookup(id) {
                conn.send_in_loop(&owned);
            }
        });
    }
}

pub struct TcpConnection {
    event_loop: Rc<EventLoop>,
    id: u64,
    name: String,
    socket: Socket,
    dispatch: Rc<RefCell<Dispatch>>,
    state: Cell<State>,
    read_buffer: RefCell<Buffer>,
    write_buffer: RefCell<Buffer>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    fault: Cell<bool>,
    context: RefCell<Option<Box<dyn Any>>>,
    connection_cb: RefCell<Option<ConnCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<ConnCallback>>,
    close_cb: RefCell<Option<ConnCallback>>,
    self_ref: RefCell<Weak<TcpConnection>>,
}

impl TcpConnection {
    /// Wraps an already-connected nonblocking `socket` (inbound from an
    /// accept, or outbound from a `Connector`) as a `Connecting` connection.
    /// Call `establish()` once the owner has wired its callbacks.
    pub fn new(event_loop: Rc<EventLoop>, name: String, socket: Socket) -> io::Result<Rc<TcpConnection>> {
        use std::os::unix::io::AsRawFd;

        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;
        let fd = socket.as_raw_fd();
        let dispatch = event_loop.new_dispatch(fd);
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        let conn = Rc::new(TcpConnection {
            event_loop,
            id,
            name,
            socket,
            dispatch,
            state: Cell::new(State::Connecting),
            read_buffer: RefCell::new(Buffer::new()),
            write_buffer: RefCell::new(Buffer::new()),
            local_addr,
            peer_addr,
            fault: Cell::new(false),
            context: RefCell::new(None),
            connection_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            write_complete_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            self_ref: RefCell::new(Weak::new()),
        });
        *conn.self_ref.borrow_mut() = Rc::downgrade(&conn);

        let weak = conn.weak_self();
        conn.dispatch.borrow_mut().set_read_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.handle_read();
            }
        });
        let weak = conn.weak_self();
        conn.dispatch.borrow_mut().set_write_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.handle_write();
            }
        });
        let weak = conn.weak_self();
        conn.dispatch.borrow_mut().set_close_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.handle_close();
            }
        });
        let weak = conn.weak_self();
        conn.dispatch.borrow_mut().set_error_callback(move || {
            if let Some(this) = weak.upgrade() {
                if let Err(e) = this.socket.check_error() {
                    warn!("{}: socket error: {e}", this.name);
                }
            }
        });

        register(id, Rc::downgrade(&conn));
        Ok(conn)
    }

    fn weak_self(&self) -> Weak<TcpConnection> {
        self.self_ref.borrow().clone()
    }

    pub fn handle(&self) -> TcpConnectionHandle {
        TcpConnectionHandle {
            id: self.id,
            loop_handle: self.event_loop.handle(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn set_context(&self, ctx: Box<dyn Any>) {
        *self.context.borrow_mut() = Some(ctx);
    }

    pub fn context(&self) -> Ref<'_, Option<Box<dyn Any>>> {
        self.context.borrow()
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

    /// Internal-only: wired by `TcpClient`/`TcpServer` to deregister this
    /// connection from their registry, not a user-facing callback.
    pub(crate) fn set_close_callback(&self, cb: impl FnMut(&Rc<TcpConnection>) + 'static) {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn establish(self: &Rc<Self>) {
        self.event_loop.assert_in_loop();
        assert_eq!(
            self.state.get(),
            State::Connecting,
            "establish called out of order"
        );
        self.state.set(State::Connected);
        let _ = self.dispatch.borrow_mut().enable_read();
        fire(self, |c| &c.connection_cb);
    }

    /// Same-thread entry point: posts an empty no-op close callback through
    /// the normal `HandleClose` path if called mid-teardown and does
    /// nothing once `Disconnected`. Cross-thread callers use
    /// `handle().send(...)` instead (see module docs — `Rc` cannot cross
    /// threads, so there is no cross-thread overload of this method).
    pub fn send(self: &Rc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop();
        self.send_in_loop(data);
    }

    fn send_in_loop(self: &Rc<Self>, data: &[u8]) {
        if self.state.get() != State::Connected {
            debug!(
                "{}: send called while not connected, dropping {} bytes",
                self.name,
                data.len()
            );
            return;
        }

        let mut wrote = 0;
        let mut fault = false;

        if !self.dispatch.borrow().is_writing() && self.write_buffer.borrow().is_empty() {
            match self.socket.write(data) {
                Ok(n) => wrote = n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e)
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) =>
                {
                    warn!("{}: send fault: {e}", self.name);
                    fault = true;
                }
                Err(e) => warn!("{}: send error: {e}", self.name),
            }

            if fault {
                self.fault.set(true);
                return;
            }

            if wrote == data.len() {
                fire(self, |c| &c.write_complete_cb);
                return;
            }
        }

        self.write_buffer.borrow_mut().append(&data[wrote..]);
        if !self.dispatch.borrow().is_writing() {
            let _ = self.dispatch.borrow_mut().enable_write();
        }
    }

    pub fn shutdown(self: &Rc<Self>) {
        self.event_loop.assert_in_loop();
        if self.state.get() != State::Connected {
            return;
        }
        self.state.set(State::Disconnecting);
        if !self.dispatch.borrow().is_writing() {
            let _ = self.socket.shutdown_write();
        }
    }

    pub fn force_close(self: &Rc<Self>) {
        self.event_loop.assert_in_loop();
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    pub fn start_read(&self) {
        self.event_loop.assert_in_loop();
        let _ = self.dispatch.borrow_mut().enable_read();
    }

    pub fn stop_read(&self) {
        self.event_loop.assert_in_loop();
        let _ = self.dispatch.borrow_mut().disable_read();
    }

    fn handle_read(self: &Rc<Self>) {
        let result = {
            let mut buf = self.read_buffer.borrow_mut();
            let socket = &self.socket;
            buf.read_from(&|slices| socket.read_vectored(slices))
        };

        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => fire_message(self),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("{}: read error: {e}", self.name),
        }
    }

    fn handle_write(self: &Rc<Self>) {
        if !self.dispatch.borrow().is_writing() {
            return;
        }

        let result = {
            let buf = self.write_buffer.borrow();
            self.socket.write(buf.readable())
        };

        match result {
            Ok(n) => {
                self.write_buffer.borrow_mut().consume(n);
                if self.write_buffer.borrow().is_empty() {
                    let _ = self.dispatch.borrow_mut().disable_write();
                    fire(self, |c| &c.write_complete_cb);
                    if self.state.get() == State::Disconnecting {
                        let _ = self.socket.shutdown_write();
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("{}: write error: {e}", self.name),
        }
    }

    fn handle_close(self: &Rc<Self>) {
        if !matches!(self.state.get(), State::Connected | State::Disconnecting) {
            return;
        }
        let _keep_alive = self.clone();
        self.state.set(State::Disconnected);
        let _ = self.dispatch.borrow_mut().disable_all();
        fire(self, |c| &c.close_cb);
        let _ = self.dispatch.borrow_mut().remove_events();
        self.event_loop.forget_dispatch(self.dispatch.borrow().token());
        unregister(self.id);
    }
}

/// Takes one connection-shaped callback out, runs it with no `RefCell`
/// borrow held, then restores it unless the callback replaced it — same
/// reentrancy-safe pattern as `Dispatch`'s own `fire` helper.
fn fire(this: &Rc<TcpConnection>, slot: impl Fn(&TcpConnection) -> &RefCell<Option<ConnCallback>>) {
    let cb = slot(this).borrow_mut().take();
    let Some(mut cb) = cb else { return };
    cb(this);
    let mut s = slot(this).borrow_mut();
    if s.is_none() {
        *s = Some(cb);
    }
}

fn fire_message(this: &Rc<TcpConnection>) {
    let cb = this.message_cb.borrow_mut().take();
    let Some(mut cb) = cb else { return };
    {
        let mut buf = this.read_buffer.borrow_mut();
        cb(this, &mut buf);
    }
    let mut s = this.message_cb.borrow_mut();
    if s.is_none() {
        *s = Some(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    use std::time::Duration;

    fn connected_pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let socket = unsafe { Socket::from_raw_fd(server.into_raw_fd()) };
        (socket, client)
    }

    #[test]
    fn establish_fires_connection_callback_and_enables_read() {
        let ev = EventLoop::new().unwrap();
        let (socket, _client) = connected_pair();
        let conn = TcpConnection::new(ev.clone(), "test-conn".into(), socket).unwrap();

        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        conn.set_connection_callback(move |_| f.set(true));

        conn.establish();

        assert!(fired.get());
        assert_eq!(conn.state(), State::Connected);
        assert!(conn.dispatch.borrow().is_reading());
    }

    #[test]
    fn send_small_payload_completes_immediately_and_fires_write_complete() {
        let ev = EventLoop::new().unwrap();
        let (socket, mut client) = connected_pair();
        let conn = TcpConnection::new(ev.clone(), "test-conn".into(), socket).unwrap();
        conn.establish();

        let completed = Rc::new(Cell::new(false));
        let c = completed.clone();
        conn.set_write_complete_callback(move |_| c.set(true));

        conn.send(b"ping");
        assert!(completed.get());

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn handle_close_on_peer_eof_fires_close_callback_once() {
        let ev = EventLoop::new().unwrap();
        let (socket, client) = connected_pair();
        let conn = TcpConnection::new(ev.clone(), "test-conn".into(), socket).unwrap();
        conn.establish();

        let closed = Rc::new(Cell::new(0));
        let c = closed.clone();
        conn.set_close_callback(move |_| {
            c.set(c.get() + 1);
        });

        drop(client);

        let quitter = ev.clone();
        ev.run_after(Duration::from_millis(150), move || quitter.quit());
        ev.run().unwrap();

        assert_eq!(closed.get(), 1);
        assert_eq!(conn.state(), State::Disconnected);
    }

    #[test]
    fn cross_thread_handle_send_reaches_the_peer() {
        let ev = EventLoop::new().unwrap();
        let (socket, mut client) = connected_pair();
        let conn = TcpConnection::new(ev.clone(), "test-conn".into(), socket).unwrap();
        conn.establish();

        let handle = conn.handle();
        let quitter = ev.clone();
        std::thread::spawn(move || {
            handle.send(b"from another thread");
        });

        ev.run_after(Duration::from_millis(150), move || quitter.quit());
        ev.run().unwrap();

        let mut buf = [0u8; "from another thread".len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"from another thread");
    }
}
