//! The level-triggered backend: plain `poll(2)`.
//!
//! `poll(2)` has no registration concept of its own — every call restates
//! every fd of interest. Grounded on the prior generation's `poll/mod.rs`
//! free functions (`poll`, `wait`) for the raw syscall plumbing; the
//! registration bookkeeping here is new, needed to present the same
//! [`Poller`] trait the epoll backend does.

use std::cell::RefCell;
use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Event, Poller, Ready, Token};

struct Entry {
    fd: RawFd,
    token: Token,
    interest: Ready,
}

pub struct PollPoller {
    entries: RefCell<Vec<Entry>>,
}

impl Poller for PollPoller {
    fn new() -> io::Result<PollPoller> {
        Ok(PollPoller {
            entries: RefCell::new(Vec::new()),
        })
    }

    fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.entries.borrow_mut().push(Entry { fd, token, interest });
        Ok(())
    }

    fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries
            .iter_mut()
            .find(|e| e.fd == fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        entry.token = token;
        entry.interest = interest;
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.entries.borrow_mut().retain(|e| e.fd != fd);
        Ok(())
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let entries = self.entries.borrow();
        let mut pollfds: Vec<libc::pollfd> = entries
            .iter()
            .map(|e| libc::pollfd {
                fd: e.fd,
                events: ioevent_to_poll(e.interest),
                revents: 0,
            })
            .collect();
        drop(entries);

        if pollfds.is_empty() {
            if let Some(to) = timeout {
                std::thread::sleep(to);
            }
            return Ok(());
        }

        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let entries = self.entries.borrow();
        for (entry, pfd) in entries.iter().zip(pollfds.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            events.push(Event {
                token: entry.token,
                readiness: poll_to_ioevent(pfd.revents),
            });
        }

        Ok(())
    }
}

fn ioevent_to_poll(interest: Ready) -> libc::c_short {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::POLLIN;
    }
    if interest.is_writable() {
        kind |= libc::POLLOUT;
    }
    kind as libc::c_short
}

fn poll_to_ioevent(revents: libc::c_short) -> Ready {
    let revents = revents as libc::c_int;
    let mut ready = Ready::EMPTY;
    if revents & libc::POLLIN != 0 {
        ready |= Ready::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Ready::WRITABLE;
    }
    if revents & libc::POLLERR != 0 {
        ready |= Ready::ERROR;
    }
    if revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
        ready |= Ready::HUP;
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::eventfd::EventFd;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn registers_and_reports_readable() {
        let poller = PollPoller::new().unwrap();
        let efd = EventFd::new().unwrap();
        poller
            .register(efd.as_raw_fd(), Token(3), Ready::READABLE)
            .unwrap();
        efd.write(1).unwrap();

        let mut events = Vec::new();
        poller
            .poll(&mut events, Some(Duration::from_millis(200)))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token(3));
    }

    #[test]
    fn deregister_stops_reporting() {
        let poller = PollPoller::new().unwrap();
        let efd = EventFd::new().unwrap();
        poller
            .register(efd.as_raw_fd(), Token(1), Ready::READABLE)
            .unwrap();
        efd.write(1).unwrap();
        poller.deregister(efd.as_raw_fd()).unwrap();

        let mut events = Vec::new();
        poller
            .poll(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());
    }
}
