//! Cross-thread pending-task queue: any thread can post a closure for the
//! loop to run; the loop only ever drains it on its own thread.
//!
//! Grounded on the pack's root-level `queue.rs`, which pairs a
//! `concurrent_queue::ConcurrentQueue` with a `Waker` and an atomic
//! pending-count so the wakeup fd is only toggled readable/empty at the 0↔1
//! transition rather than on every push/pop. Adapted here to hold
//! `Box<dyn FnOnce() + Send>` tasks and this crate's own `Waker`.

use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;

use concurrent_queue::ConcurrentQueue;

use crate::waker::Waker;

pub type Task = Box<dyn FnOnce() + Send>;

struct Inner {
    queue: ConcurrentQueue<Task>,
    pending: AtomicUsize,
    waker: Waker,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(waker: Waker) -> TaskQueue {
        TaskQueue {
            inner: Arc::new(Inner {
                queue: ConcurrentQueue::unbounded(),
                pending: AtomicUsize::new(0),
                waker,
            }),
        }
    }

    /// Pushes a task and wakes the loop only on the 0→1 pending transition:
    /// the loop drains everything in one pass, so later pushes in the same
    /// batch don't need their own wakeup.
    pub fn push(&self, task: Task) -> io::Result<()> {
        let _ = self.inner.queue.push(task);
        let prev = self.inner.pending.fetch_add(1, Acquire);
        if prev == 0 {
            self.inner.waker.wakeup()?;
        }
        Ok(())
    }

    fn pop(&self) -> Option<Task> {
        let task = self.inner.queue.pop().ok()?;
        self.inner.pending.fetch_sub(1, AcqRel);
        Some(task)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Relaxed)
    }

    /// Swaps the whole backlog out under no lock at all (the queue is
    /// already lock-free) and runs it. New tasks posted by a task running
    /// in this drain land back in `self.inner.queue` and are picked up on
    /// the loop's next iteration, not this one — matching the "swap, then
    /// release, then execute" ordering contract.
    pub fn drain_and_run(&self) {
        let mut batch = Vec::new();
        while let Some(task) = self.pop() {
            batch.push(task);
        }
        for task in batch {
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn tasks_run_in_posting_order() {
        let queue = TaskQueue::new(Waker::new().unwrap());
        let order = StdArc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = order.clone();
            queue.push(Box::new(move || order.lock().unwrap().push(i))).unwrap();
        }

        queue.drain_and_run();
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn tasks_posted_from_other_threads_all_run() {
        let queue = TaskQueue::new(Waker::new().unwrap());
        let counter = StdArc::new(StdAtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1250 {
                    let counter = counter.clone();
                    queue
                        .push(Box::new(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        queue.drain_and_run();
        assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn tasks_queued_during_drain_wait_for_the_next_drain() {
        let queue = TaskQueue::new(Waker::new().unwrap());
        let reentrant_ran = StdArc::new(std::sync::Mutex::new(false));

        let q = queue.clone();
        let flag = reentrant_ran.clone();
        queue
            .push(Box::new(move || {
                q.push(Box::new(move || *flag.lock().unwrap() = true)).unwrap();
            }))
            .unwrap();

        queue.drain_and_run();
        assert!(!*reentrant_ran.lock().unwrap());

        queue.drain_and_run();
        assert!(*reentrant_ran.lock().unwrap());
    }
}
