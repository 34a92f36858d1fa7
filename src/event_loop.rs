//! Single-threaded scheduler combining a [`Poller`], a [`TimerQueue`], and a
//! cross-thread [`TaskQueue`]. Affine to the OS thread that calls
//! [`EventLoop::new`]; every `Dispatch`/`Poller` mutation must happen there.
//!
//! `EventLoop` itself is `Rc`-based and therefore never leaves its owning
//! thread. Code on another thread that needs to post a task or request a
//! quit obtains an [`EventLoopHandle`] (cheap, `Clone + Send + Sync`, backed
//! by the same `Arc`-based [`TaskQueue`] and wakeup fd) before crossing
//! threads — there is no way to hand the `Rc<EventLoop>` itself across a
//! thread boundary, which is exactly the property we want.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use log::{debug, trace, warn};
use slab::Slab;

use crate::dispatch::Dispatch;
use crate::poller::{DefaultPoller, Event, Poller, Ready, Token};
use crate::task_queue::{Task, TaskQueue};
use crate::timer_queue::{TimerId, TimerQueue};
use crate::waker::Waker;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// A `Send + Sync` handle onto a running `EventLoop`, safe to hold on any
/// thread. Everything it exposes is backed by `Arc`/lock-free primitives;
/// it carries no `Rc` and cannot reach the loop's `Dispatch`/`Poller` state
/// directly — only through posting a task that runs on the owning thread.
#[derive(Clone)]
pub struct EventLoopHandle {
    tasks: TaskQueue,
    waker: Waker,
    quit: Arc<AtomicBool>,
}

impl EventLoopHandle {
    /// Posts `task` to run on the next loop iteration, from any thread.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if let Err(e) = self.tasks.push(Box::new(task) as Task) {
            warn!("failed to post task to event loop: {e}");
        }
    }

    /// Safe to call from any thread; interrupts a blocked `poll` via the
    /// wakeup fd so the loop observes the quit flag promptly.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        let _ = self.waker.wakeup();
    }
}

pub struct EventLoop {
    poller: Rc<dyn Poller>,
    dispatches: RefCell<Slab<Rc<RefCell<Dispatch>>>>,
    timers: RefCell<TimerQueue>,
    handle: EventLoopHandle,
    owning_thread: ThreadId,
    running: Cell<bool>,
    calling_pending_tasks: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<EventLoop>> {
        let poller: Rc<dyn Poller> = Rc::new(DefaultPoller::new()?);
        let waker = Waker::new()?;
        poller.register(waker.as_raw_fd(), WAKER_TOKEN, Ready::READABLE)?;

        let handle = EventLoopHandle {
            tasks: TaskQueue::new(waker.clone()),
            waker,
            quit: Arc::new(AtomicBool::new(false)),
        };

        Ok(Rc::new(EventLoop {
            poller,
            dispatches: RefCell::new(Slab::new()),
            timers: RefCell::new(TimerQueue::new()),
            handle,
            owning_thread: std::thread::current().id(),
            running: Cell::new(false),
            calling_pending_tasks: Cell::new(false),
        }))
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.owning_thread
    }

    pub fn assert_in_loop(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop operation invoked from a thread other than its owning thread"
        );
    }

    /// A cloneable, `Send`-safe handle for posting to this loop or quitting
    /// it from another thread. Cheap to clone and hand off before spawning.
    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Allocates a fresh [`Dispatch`] for `fd`, registered under a Poller
    /// token that doubles as the dispatch's slab key.
    pub fn new_dispatch(&self, fd: RawFd) -> Rc<RefCell<Dispatch>> {
        self.assert_in_loop();
        let mut dispatches = self.dispatches.borrow_mut();
        let entry = dispatches.vacant_entry();
        let token = Token(entry.key());
        let dispatch = Rc::new(RefCell::new(Dispatch::new(fd, token, self.poller.clone())));
        entry.insert(dispatch.clone());
        dispatch
    }

    /// Forgets a dispatch's slab slot. Must only be called after
    /// `Dispatch::remove_events` has already deregistered it from the
    /// Poller, and only once the caller is sure no further event for this
    /// token can arrive this tick (i.e. from `queue_in_loop`, not inline
    /// from within `handle_event`).
    pub fn forget_dispatch(&self, token: Token) {
        self.assert_in_loop();
        if self.dispatches.borrow().contains(token.0) {
            self.dispatches.borrow_mut().remove(token.0);
        }
    }

    /// Runs `task` synchronously if called from the owning thread,
    /// otherwise defers it like `queue_in_loop`.
    pub fn run_in_loop(self: &Rc<Self>, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Posts `task` to run on the next loop iteration, from any thread.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(task);
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop();
        self.timers.borrow_mut().run_after(delay, cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop();
        self.timers.borrow_mut().run_every(interval, cb)
    }

    pub fn cancel(&self, id: TimerId) {
        self.assert_in_loop();
        self.timers.borrow_mut().cancel(id);
    }

    /// Safe to call from any thread; interrupts a blocked `poll` via the
    /// wakeup fd so the loop observes the quit flag promptly. Cross-thread
    /// callers should prefer `handle().quit()` — this is a convenience for
    /// code that already holds the `Rc<EventLoop>` (i.e. the owning thread).
    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn run(self: &Rc<Self>) -> io::Result<()> {
        self.assert_in_loop();
        self.running.set(true);
        let mut events = Vec::with_capacity(128);

        while !self.handle.quit.load(Ordering::SeqCst) {
            events.clear();
            let timeout = self.timers.borrow_mut().next_timeout();
            if let Err(e) = self.poller.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed: {e}");
                continue;
            }

            for event in &events {
                if event.token == WAKER_TOKEN {
                    let _ = self.handle.waker.drain();
                    continue;
                }

                let dispatch = self.dispatches.borrow().get(event.token.0).cloned();
                let Some(dispatch) = dispatch else {
                    trace!("event for a dispatch no longer registered: {:?}", event.token);
                    continue;
                };
                dispatch.borrow_mut().set_revents(event.readiness);
                Dispatch::handle_event(&dispatch);
            }

            self.timers.borrow_mut().run_expired();

            self.calling_pending_tasks.set(true);
            self.handle.tasks.drain_and_run();
            self.calling_pending_tasks.set(false);
        }

        self.running.set(false);
        debug!("event loop stopped");
        Ok(())
    }
}
