//! The queued-event backend: Linux `epoll(7)`.
//!
//! Grounded on the raw `epoll_create1`/`epoll_ctl`/`epoll_wait` wrapper
//! retrieved from the prior generation's `sys/epoll.rs` — the syscall
//! sequencing and the `ioevent_to_epoll` bitmask conversion are carried over
//! almost unchanged, adapted to the new [`Poller`] trait and [`Ready`]
//! bitmask. The raw event buffer passed to `epoll_wait` starts at
//! `INITIAL_READY_CAPACITY` and doubles whenever a call comes back
//! completely full, rather than staying fixed-size forever.

use std::cell::RefCell;
use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::sys::syscall;

use super::{Event, Poller, Ready, Token};

const INITIAL_READY_CAPACITY: usize = 1024;

pub struct EpollPoller {
    epfd: RawFd,
    ready: RefCell<Vec<libc::epoll_event>>,
}

impl EpollPoller {
    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interest),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.epfd, op, fd, &mut info))?;
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn new() -> io::Result<EpollPoller> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let ready = vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_READY_CAPACITY];
        Ok(EpollPoller {
            epfd,
            ready: RefCell::new(ready),
        })
    }

    fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let mut raw = self.ready.borrow_mut();
        let cnt = match syscall!(epoll_wait(
            self.epfd,
            raw.as_mut_ptr(),
            raw.len() as i32,
            timeout_ms
        )) {
            Ok(cnt) => cnt,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        };

        for ev in &raw[..cnt as usize] {
            events.push(Event {
                token: Token(ev.u64 as usize),
                readiness: epoll_to_ioevent(ev.events as libc::c_int),
            });
        }

        // The buffer came back completely full: more fds may have been
        // ready than it could report in one call. Double it so the next
        // poll has more room, rather than silently dropping the rest to
        // the following (level-triggered) cycle.
        if cnt as usize == raw.len() {
            let new_len = raw.len() * 2;
            raw.resize(new_len, libc::epoll_event { events: 0, u64: 0 });
        }

        Ok(())
    }
}

impl AsRawFd for EpollPoller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

fn ioevent_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::EPOLLIN;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind |= libc::EPOLLRDHUP;
    kind as u32
}

fn epoll_to_ioevent(epoll: libc::c_int) -> Ready {
    let mut ready = Ready::EMPTY;
    if epoll & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready |= Ready::READABLE;
    }
    if epoll & libc::EPOLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if epoll & libc::EPOLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if epoll & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        ready |= Ready::HUP;
    }
    ready
}
