//! Monotonic priority queue of timer deadlines, drained by the event loop
//! on every tick.
//!
//! Grounded in the min-heap-over-`(deadline, id)` idiom sketched (but never
//! finished) by the retrieved pack's `plus/timer.rs` stub — `Task`/`Timespec`
//! ordering there inspired the `Reverse`-wrapped `BinaryHeap` below, though
//! the insert/remove/pop bodies are new: the stub never implemented them.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

pub type TimerCallback = Box<dyn FnMut()>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
    interval: Option<Duration>,
    callback: TimerCallback,
}

/// Ordered by deadline, ties broken by id; wrapped by callers in
/// `Reverse` so `BinaryHeap` (a max-heap) behaves as a min-heap.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn run_at(&mut self, deadline: Instant, callback: impl FnMut() + 'static) -> TimerId {
        let id = self.alloc_id();
        self.heap.push(Reverse(TimerEntry {
            deadline,
            id,
            interval: None,
            callback: Box::new(callback),
        }));
        id
    }

    pub fn run_after(&mut self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    pub fn run_every(&mut self, interval: Duration, mut callback: impl FnMut() + 'static) -> TimerId {
        let id = self.alloc_id();
        self.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + interval,
            id,
            interval: Some(interval),
            callback: Box::new(move || callback()),
        }));
        id
    }

    /// O(1) plus a lazily-skipped tombstone on pop.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Milliseconds until the next live deadline, or `None` if the queue is
    /// empty (callers poll indefinitely in that case).
    pub fn next_timeout(&mut self) -> Option<Duration> {
        self.drop_cancelled_head();
        self.heap.peek().map(|Reverse(entry)| {
            entry.deadline.saturating_duration_since(Instant::now())
        })
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let Reverse(entry) = self.heap.pop().unwrap();
                self.cancelled.remove(&entry.id);
            } else {
                break;
            }
        }
    }

    /// Pops and runs every entry whose deadline has passed, in deadline
    /// order (ties by id), re-inserting repeating entries with
    /// `deadline += interval`. A clock that jumped backward makes every
    /// pending entry "expired once"; a forward jump just fires more entries
    /// in the same call, still in order.
    pub fn run_expired(&mut self) {
        let now = Instant::now();
        let mut to_requeue = Vec::new();

        loop {
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.deadline <= now => {}
                _ => break,
            }

            let Reverse(mut entry) = self.heap.pop().unwrap();
            if self.cancelled.remove(&entry.id) {
                continue;
            }

            (entry.callback)();

            if let Some(interval) = entry.interval {
                entry.deadline += interval;
                to_requeue.push(Reverse(entry));
            }
        }

        self.heap.extend(to_requeue);
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> TimerQueue {
        TimerQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_deadline_order_regardless_of_insertion_order() {
        let mut q = TimerQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        q.run_after(Duration::from_millis(50), move || o1.borrow_mut().push(50));
        let o2 = order.clone();
        q.run_after(Duration::from_millis(10), move || o2.borrow_mut().push(10));
        let o3 = order.clone();
        q.run_after(Duration::from_millis(30), move || o3.borrow_mut().push(30));

        std::thread::sleep(Duration::from_millis(60));
        q.run_expired();

        assert_eq!(*order.borrow(), vec![10, 30, 50]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let f1 = fired.clone();
        q.run_after(Duration::from_millis(10), move || f1.borrow_mut().push(10));
        let f2 = fired.clone();
        let id30 = q.run_after(Duration::from_millis(30), move || f2.borrow_mut().push(30));
        let f3 = fired.clone();
        q.run_after(Duration::from_millis(50), move || f3.borrow_mut().push(50));

        q.cancel(id30);

        std::thread::sleep(Duration::from_millis(60));
        q.run_expired();

        assert_eq!(*fired.borrow(), vec![10, 50]);
    }

    #[test]
    fn repeating_timer_reschedules_with_incremented_deadline() {
        let mut q = TimerQueue::new();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        q.run_every(Duration::from_millis(10), move || *c.borrow_mut() += 1);

        std::thread::sleep(Duration::from_millis(35));
        q.run_expired();
        assert!(*count.borrow() >= 1);

        let fired_once = *count.borrow();
        std::thread::sleep(Duration::from_millis(15));
        q.run_expired();
        assert!(*count.borrow() > fired_once);
    }

    #[test]
    fn next_timeout_reflects_the_earliest_live_entry() {
        let mut q = TimerQueue::new();
        assert!(q.next_timeout().is_none());

        let id = q.run_after(Duration::from_millis(5), || {});
        q.run_after(Duration::from_millis(500), || {});

        let first = q.next_timeout().unwrap();
        assert!(first <= Duration::from_millis(5));

        q.cancel(id);
        let second = q.next_timeout().unwrap();
        assert!(second > Duration::from_millis(5));
    }
}
