//! The two interchangeable readiness backends: [`epoll`] (queued events,
//! default) and [`level`] (`poll(2)`, level-triggered, selected with
//! `--no-default-features --features poll`). [`Dispatch`](crate::dispatch::Dispatch)
//! and [`EventLoop`](crate::event_loop::EventLoop) only ever see the
//! [`Poller`] trait below, so swapping backends never touches them.

#[cfg(feature = "epoll")]
pub mod epoll;
#[cfg(feature = "poll")]
pub mod level;

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Identifies a registration. The event loop hands these out as slab keys
/// over the registered [`Dispatch`](crate::dispatch::Dispatch) table, so a
/// `Token` round-trips straight back to a fd's bookkeeping with no lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// Interest/readiness bitmask: readable, writable, a peer-closed half of the
/// connection, or an error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(0b0001);
    pub const WRITABLE: Ready = Ready(0b0010);
    pub const ERROR: Ready = Ready(0b0100);
    pub const HUP: Ready = Ready(0b1000);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl BitOr for Ready {
    type Output = Ready;
    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;
    fn bitand(self, rhs: Ready) -> Ready {
        Ready(self.0 & rhs.0)
    }
}

/// One reported event: which registration fired, and what it's ready for.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readiness: Ready,
}

/// Backend-agnostic readiness multiplexer.
///
/// Every registration is level-triggered: as long as interest includes
/// `READABLE`/`WRITABLE` and the fd has data/room, the backend keeps
/// reporting it on every `poll` call. [`Dispatch::handle_event`] is expected
/// to drain the fd each time, matching that contract.
pub trait Poller {
    fn new() -> io::Result<Self>
    where
        Self: Sized;

    fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()>;

    fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()>;

    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks until at least one registration is ready or `timeout` elapses
    /// (`None` blocks indefinitely), appending fired events to `events`.
    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()>;
}

#[cfg(feature = "epoll")]
pub type DefaultPoller = epoll::EpollPoller;

#[cfg(all(feature = "poll", not(feature = "epoll")))]
pub type DefaultPoller = level::PollPoller;
