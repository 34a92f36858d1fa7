//! Accept-loop counterpart to [`TcpClient`](crate::tcp_client::TcpClient).
//! Not part of the distilled spec this crate started from — carried over
//! from the original implementation's paired client/server design since it
//! shares all of `TcpConnection`'s machinery and a listener is the natural
//! complement to an outbound connector.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use log::{error, warn};

use crate::buffer::Buffer;
use crate::dispatch::Dispatch;
use crate::event_loop::EventLoop;
use crate::online_connections::OnlineConnections;
use crate::sockaddr::SockAddr;
use crate::sys::socket::{classify_accept_error, AcceptFailure, Socket, SpareFd};
use crate::tcp_connection::TcpConnection;

type ConnCallback = Box<dyn FnMut(&Rc<TcpConnection>)>;
type MessageCallback = Box<dyn FnMut(&Rc<TcpConnection>, &mut Buffer)>;

pub struct TcpServer {
    event_loop: Rc<EventLoop>,
    name: String,
    listen_socket: Socket,
    dispatch: RefCell<Option<Rc<RefCell<Dispatch>>>>,
    spare_fd: RefCell<SpareFd>,
    next_id: Cell<u64>,
    started: Cell<bool>,
    registry: OnlineConnections,
    connection_cb: Rc<RefCell<Option<ConnCallback>>>,
    message_cb: Rc<RefCell<Option<MessageCallback>>>,
    write_complete_cb: Rc<RefCell<Option<ConnCallback>>>,
    close_cb: Rc<RefCell<Option<ConnCallback>>>,
    self_ref: RefCell<Weak<TcpServer>>,
}

impl TcpServer {
    pub fn new(event_loop: Rc<EventLoop>, listen_addr: &SockAddr, name: String) -> io::Result<Rc<TcpServer>> {
        let addr = *listen_addr
            .addrs()
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no listen address resolved"))?;

        let socket = Socket::create_for(&addr)?;
        socket.set_reuseaddr(true)?;
        socket.bind(&addr)?;
        socket.listen(1024)?;
        let spare_fd = SpareFd::new()?;

        let server = Rc::new(TcpServer {
            event_loop,
            name,
            listen_socket: socket,
            dispatch: RefCell::new(None),
            spare_fd: RefCell::new(spare_fd),
            next_id: Cell::new(1),
            started: Cell::new(false),
            registry: OnlineConnections::new(),
            connection_cb: Rc::new(RefCell::new(None)),
            message_cb: Rc::new(RefCell::new(None)),
            write_complete_cb: Rc::new(RefCell::new(None)),
            close_cb: Rc::new(RefCell::new(None)),
            self_ref: RefCell::new(Weak::new()),
        });
        *server.self_ref.borrow_mut() = Rc::downgrade(&server);
        Ok(server)
    }

    fn weak_self(&self) -> Weak<TcpServer> {
        self.self_ref.borrow().clone()
    }

    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.listen_socket.local_addr()
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

    pub fn set_close_callback(&self, cb: impl FnMut(&Rc<TcpConnection>) + 'static) {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Registers the listener's `Dispatch` on the loop. Idempotent.
    pub fn start(self: &Rc<Self>) {
        self.event_loop.assert_in_loop();
        if self.started.get() {
            return;
        }
        self.started.set(true);

        use std::os::unix::io::AsRawFd;
        let fd = self.listen_socket.as_raw_fd();
        let dispatch = self.event_loop.new_dispatch(fd);
        let weak = self.weak_self();
        dispatch.borrow_mut().set_read_callback(move || {
            if let Some(this) = weak.upgrade() {
                this.handle_accept();
            }
        });
        let _ = dispatch.borrow_mut().enable_read();
        *self.dispatch.borrow_mut() = Some(dispatch);
    }

    fn handle_accept(self: &Rc<Self>) {
        loop {
            match self.listen_socket.accept() {
                Ok((socket, peer)) => self.new_connection(socket, peer),
                Err(e) => {
                    match classify_accept_error(&e) {
                        AcceptFailure::OutOfFiles => {
                            warn!(
                                "{}: out of file descriptors accepting, applying spare-fd trick",
                                self.name
                            );
                            let listen = &self.listen_socket;
                            let res = self
                                .spare_fd
                                .borrow_mut()
                                .take_one(|| {
                                    let _ = listen.accept();
                                });
                            if let Err(e) = res {
                                error!("{}: failed to reopen spare fd: {e}", self.name);
                            }
                        }
                        AcceptFailure::Transient => {}
                        AcceptFailure::Fatal => {
                            error!(
                                "{}: fatal accept error, listener is no longer usable: {e}",
                                self.name
                            );
                            std::process::exit(1);
                        }
                    }
                    break;
                }
            }
        }
    }

    fn new_connection(self: &Rc<Self>, socket: Socket, peer: SocketAddr) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let conn_name = format!("{}-{peer}#{id}", self.name);

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

        let close_cb = self.close_cb.clone();
        let weak = self.weak_self();
        conn.set_close_callback(move |c| {
            if let Some(this) = weak.upgrade() {
                this.registry.remove(c.name());
            }
            if let Some(cb) = close_cb.borrow_mut().as_mut() {
                cb(c);
            }
        });

        self.registry.insert(conn.clone());
        conn.establish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn accepts_a_connection_and_echoes_a_message() {
        let ev = EventLoop::new().unwrap();
        let server = TcpServer::new(ev.clone(), &SockAddr::from_resolved("127.0.0.1:0".parse().unwrap()), "echo".into())
            .unwrap();
        let addr = server.listen_addr().unwrap();

        server.set_message_callback(|conn, buf| {
            let bytes = buf.readable().to_vec();
            conn.send(&bytes);
            buf.consume_all();
        });

        let accepted = Arc::new(AtomicUsize::new(0));
        let a = accepted.clone();
        server.set_connection_callback(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        server.start();

        let addr_for_thread = addr;
        let loop_handle = ev.handle();
        let handle = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr_for_thread).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            loop_handle.quit();
            buf
        });

        let timeout_quitter = ev.clone();
        ev.run_after(Duration::from_secs(2), move || timeout_quitter.quit());

        ev.run().unwrap();
        let echoed = handle.join().unwrap();

        assert_eq!(&echoed, b"ping");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn start_is_idempotent() {
        let ev = EventLoop::new().unwrap();
        let server = TcpServer::new(ev.clone(), &SockAddr::from_resolved("127.0.0.1:0".parse().unwrap()), "echo".into())
            .unwrap();
        server.start();
        server.start();
        assert!(server.dispatch.borrow().is_some());
    }
}
