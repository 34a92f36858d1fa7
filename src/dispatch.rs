//! Per-fd binding of interest mask, revents, and the four callbacks a
//! [`Connector`](crate::connector::Connector) or
//! [`TcpConnection`](crate::tcp_connection::TcpConnection) hangs off one fd.
//!
//! One `Dispatch` is owned by exactly one owner for its lifetime. It never
//! reaches across threads: every method here runs on the
//! [`EventLoop`](crate::event_loop::EventLoop) thread that created it.

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::poller::{Poller, Ready, Token};

type Callback = Box<dyn FnMut()>;

pub struct Dispatch {
    fd: RawFd,
    token: Token,
    interest: Ready,
    revents: Ready,
    registered: bool,
    tie: Option<Weak<dyn Any>>,
    read_cb: Option<Callback>,
    write_cb: Option<Callback>,
    close_cb: Option<Callback>,
    error_cb: Option<Callback>,
    poller: Rc<dyn Poller>,
}

impl Dispatch {
    pub fn new(fd: RawFd, token: Token, poller: Rc<dyn Poller>) -> Dispatch {
        Dispatch {
            fd,
            token,
            interest: Ready::EMPTY,
            revents: Ready::EMPTY,
            registered: false,
            tie: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
            poller,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut() + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    /// Holds a weak back-reference to `owner`, upgraded to a strong
    /// reference for the duration of each [`Self::handle_event`] call so the
    /// owner cannot be dropped mid-callback.
    pub fn tie(&mut self, owner: Weak<dyn Any>) {
        self.tie = Some(owner);
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn register(&mut self) -> io::Result<()> {
        self.poller.register(self.fd, self.token, self.interest)?;
        self.registered = true;
        Ok(())
    }

    pub fn enable_read(&mut self) -> io::Result<()> {
        self.interest |= Ready::READABLE;
        self.update()
    }

    pub fn disable_read(&mut self) -> io::Result<()> {
        self.interest = self.interest.without(Ready::READABLE);
        self.update()
    }

    pub fn enable_write(&mut self) -> io::Result<()> {
        self.interest |= Ready::WRITABLE;
        self.update()
    }

    pub fn disable_write(&mut self) -> io::Result<()> {
        self.interest = self.interest.without(Ready::WRITABLE);
        self.update()
    }

    pub fn disable_all(&mut self) -> io::Result<()> {
        self.interest = Ready::EMPTY;
        self.update()
    }

    fn update(&mut self) -> io::Result<()> {
        if self.registered {
            self.poller.reregister(self.fd, self.token, self.interest)
        } else {
            self.register()
        }
    }

    /// Drops this fd from the Poller. The caller is responsible for
    /// deferring the actual drop of the `Dispatch` value itself to the next
    /// loop iteration (e.g. by posting a task via `queue_in_loop`) so a
    /// callback currently in flight never observes a half-destroyed
    /// `Dispatch`.
    pub fn remove_events(&mut self) -> io::Result<()> {
        if self.registered {
            self.poller.deregister(self.fd)?;
            self.registered = false;
        }
        Ok(())
    }

    pub fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    /// Dispatch rules, in order: a tied-but-gone owner short-circuits
    /// everything; hangup-without-read-interest means close; otherwise
    /// error, then read-or-hangup, then write, each independently.
    ///
    /// Takes `&Rc<RefCell<Dispatch>>` rather than `&mut self` so each
    /// callback runs with the `RefCell` borrow released — a callback is
    /// free to call back into this same `Dispatch` (e.g. to toggle
    /// interest, or remove itself) without hitting a double-borrow panic.
    pub fn handle_event(this: &Rc<RefCell<Dispatch>>) {
        let tie = this.borrow().tie.clone();
        if let Some(weak) = tie {
            if weak.upgrade().is_none() {
                return;
            }
        }
        // The strong ref above is allowed to drop immediately: its only
        // job was to prove the owner was alive at the start of this call,
        // same as the tied owner's refcount keeping it alive across the
        // callbacks fired below (they hold their own clone if they need one).

        let (revents, interest) = {
            let d = this.borrow();
            (d.revents, d.interest)
        };

        if revents.is_hup() && !revents.is_readable() && !interest.is_readable() {
            fire(this, |d| &mut d.close_cb);
            return;
        }

        if revents.is_error() {
            fire(this, |d| &mut d.error_cb);
        }

        if revents.is_readable() || revents.is_hup() {
            fire(this, |d| &mut d.read_cb);
        }

        if revents.is_writable() {
            fire(this, |d| &mut d.write_cb);
        }
    }
}

/// Takes one callback out of `this`, runs it with no borrow held, then puts
/// it back unless the callback itself installed a new one.
fn fire(this: &Rc<RefCell<Dispatch>>, slot: impl Fn(&mut Dispatch) -> &mut Option<Callback>) {
    let cb = slot(&mut this.borrow_mut()).take();
    let Some(mut cb) = cb else { return };
    cb();
    let mut d = this.borrow_mut();
    if slot(&mut d).is_none() {
        *slot(&mut d) = Some(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    use crate::poller::Event;

    struct NoopPoller {
        last: RefCell<Option<(RawFd, Token, Ready)>>,
    }

    impl Poller for NoopPoller {
        fn new() -> io::Result<NoopPoller> {
            Ok(NoopPoller {
                last: RefCell::new(None),
            })
        }
        fn register(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
            *self.last.borrow_mut() = Some((fd, token, interest));
            Ok(())
        }
        fn reregister(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
            *self.last.borrow_mut() = Some((fd, token, interest));
            Ok(())
        }
        fn deregister(&self, _fd: RawFd) -> io::Result<()> {
            Ok(())
        }
        fn poll(&self, _events: &mut Vec<Event>, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn dispatch() -> (Rc<RefCell<Dispatch>>, Rc<NoopPoller>) {
        let poller = Rc::new(NoopPoller::new().unwrap());
        let dispatch = Rc::new(RefCell::new(Dispatch::new(3, Token(0), poller.clone())));
        (dispatch, poller)
    }

    #[test]
    fn hup_without_read_interest_invokes_close_only() {
        let (d, _p) = dispatch();
        let read_fired = Rc::new(Cell::new(false));
        let close_fired = Rc::new(Cell::new(false));
        let r = read_fired.clone();
        let c = close_fired.clone();
        d.borrow_mut().set_read_callback(move || r.set(true));
        d.borrow_mut().set_close_callback(move || c.set(true));

        d.borrow_mut().set_revents(Ready::HUP);
        Dispatch::handle_event(&d);

        assert!(close_fired.get());
        assert!(!read_fired.get());
    }

    #[test]
    fn read_fires_on_hup_when_reading() {
        let (d, _p) = dispatch();
        d.borrow_mut().enable_read().unwrap();
        let read_fired = Rc::new(Cell::new(false));
        let r = read_fired.clone();
        d.borrow_mut().set_read_callback(move || r.set(true));

        d.borrow_mut().set_revents(Ready::HUP);
        Dispatch::handle_event(&d);

        assert!(read_fired.get());
    }

    #[test]
    fn gone_tie_short_circuits_every_callback() {
        let (d, _p) = dispatch();
        let owner: Rc<dyn Any> = Rc::new(());
        d.borrow_mut().tie(Rc::downgrade(&owner));
        drop(owner);

        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        d.borrow_mut().set_read_callback(move || f.set(true));
        d.borrow_mut().set_revents(Ready::READABLE);
        Dispatch::handle_event(&d);

        assert!(!fired.get());
    }

    #[test]
    fn error_and_write_both_fire_independently() {
        let (d, _p) = dispatch();
        let error_fired = Rc::new(Cell::new(false));
        let write_fired = Rc::new(Cell::new(false));
        let e = error_fired.clone();
        let w = write_fired.clone();
        d.borrow_mut().set_error_callback(move || e.set(true));
        d.borrow_mut().set_write_callback(move || w.set(true));

        d.borrow_mut().set_revents(Ready::ERROR | Ready::WRITABLE);
        Dispatch::handle_event(&d);

        assert!(error_fired.get());
        assert!(write_fired.get());
    }

    #[test]
    fn enable_then_disable_read_updates_interest() {
        let (d, poller) = dispatch();
        d.borrow_mut().enable_read().unwrap();
        assert!(d.borrow().is_reading());
        assert_eq!(poller.last.borrow().unwrap().2, Ready::READABLE);

        d.borrow_mut().disable_read().unwrap();
        assert!(!d.borrow().is_reading());
        assert_eq!(poller.last.borrow().unwrap().2, Ready::EMPTY);
    }

    #[test]
    fn callback_can_reenter_and_toggle_its_own_interest() {
        let (d, poller) = dispatch();
        d.borrow_mut().enable_read().unwrap();

        let inner = d.clone();
        d.borrow_mut()
            .set_read_callback(move || inner.borrow_mut().disable_read().unwrap());

        d.borrow_mut().set_revents(Ready::READABLE);
        Dispatch::handle_event(&d);

        assert!(!d.borrow().is_reading());
        assert_eq!(poller.last.borrow().unwrap().2, Ready::EMPTY);
    }
}
