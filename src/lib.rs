//! A reactor-driven TCP networking runtime: a single-threaded event loop
//! multiplexing nonblocking sockets, a connector that establishes outbound
//! connections with bounded exponential backoff, and a connection object
//! that pumps bytes between user buffers and the kernel with correct
//! shutdown ordering.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use reactor_net::{EventLoop, SockAddr, TcpClient};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = SockAddr::from_host_port("127.0.0.1", 9000).unwrap();
//! let client = TcpClient::new(event_loop.clone(), addr, "demo-client".to_string());
//!
//! client.set_connection_callback(|conn| {
//!     conn.send(b"hello");
//! });
//! client.set_message_callback(|conn, buf| {
//!     println!("{}: {} bytes", conn.name(), buf.readable_len());
//!     buf.consume_all();
//! });
//!
//! client.enable_retry();
//! client.connect();
//!
//! let quit = event_loop.clone();
//! event_loop.run_after(Duration::from_secs(30), move || quit.quit());
//! event_loop.run().unwrap();
//! ```

mod buffer;
mod connector;
mod dispatch;
mod event_loop;
mod online_connections;
mod poller;
mod sockaddr;
mod sys;
mod task_queue;
mod tcp_client;
mod tcp_connection;
mod tcp_server;
mod timer_queue;
mod waker;

pub use buffer::Buffer;
pub use connector::{Connector, NewConnectionCallback};
pub use dispatch::Dispatch;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use online_connections::OnlineConnections;
pub use poller::{DefaultPoller, Event, Poller, Ready, Token};
pub use sockaddr::SockAddr;
pub use sys::socket::{AcceptFailure, Family, Socket, SpareFd};
pub use tcp_client::{ConnPtr, TcpClient};
pub use tcp_connection::{State as ConnectionState, TcpConnection, TcpConnectionHandle};
pub use tcp_server::TcpServer;
pub use timer_queue::TimerId;
