use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

const POP_TIMEOUT: Duration = Duration::from_millis(100);
const CONTENTION_THRESHOLD: Duration = Duration::from_micros(1);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded-latency, unbounded-length FIFO shared between producers and one
/// consumer (the writer thread). Backed by a single mutex-protected deque
/// and a condvar, per the simplest-correct-formulation design note.
pub struct IngestQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    push_wait_ns: AtomicU64,
    push_hold_ns: AtomicU64,
    push_contention: AtomicU64,
    pop_wait_ns: AtomicU64,
    pop_hold_ns: AtomicU64,
    pop_contention: AtomicU64,
    pop_total: AtomicU64,
}

impl<T> IngestQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            push_wait_ns: AtomicU64::new(0),
            push_hold_ns: AtomicU64::new(0),
            push_contention: AtomicU64::new(0),
            pop_wait_ns: AtomicU64::new(0),
            pop_hold_ns: AtomicU64::new(0),
            pop_contention: AtomicU64::new(0),
            pop_total: AtomicU64::new(0),
        }
    }

    /// Appends `item` and wakes one waiter. Fails with `Closed` once
    /// [`IngestQueue::close`] has been called.
    pub fn push(&self, item: T) -> Result<(), QueueError> {
        let wait_start = Instant::now();
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let wait = wait_start.elapsed();
        self.push_wait_ns.fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
        if wait > CONTENTION_THRESHOLD {
            self.push_contention.fetch_add(1, Ordering::Relaxed);
        }

        let hold_start = Instant::now();
        if guard.closed {
            return Err(QueueError::Closed);
        }
        guard.items.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        self.push_hold_ns
            .fetch_add(hold_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Waits up to 100ms for an item; returns `None` on timeout or once the
    /// queue has been closed and drained.
    pub fn pop(&self) -> Option<T> {
        let wait_start = Instant::now();
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());

        while guard.items.is_empty() && !guard.closed {
            let (next_guard, timeout) = self
                .not_empty
                .wait_timeout(guard, POP_TIMEOUT)
                .unwrap_or_else(|e| e.into_inner());
            guard = next_guard;
            if timeout.timed_out() && guard.items.is_empty() {
                let wait = wait_start.elapsed();
                self.pop_wait_ns.fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
                if wait > CONTENTION_THRESHOLD {
                    self.pop_contention.fetch_add(1, Ordering::Relaxed);
                }
                return None;
            }
        }

        let wait = wait_start.elapsed();
        self.pop_wait_ns.fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
        if wait > CONTENTION_THRESHOLD {
            self.pop_contention.fetch_add(1, Ordering::Relaxed);
        }

        let hold_start = Instant::now();
        let item = guard.items.pop_front();
        drop(guard);
        self.pop_hold_ns
            .fetch_add(hold_start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if item.is_some() {
            self.pop_total.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Sets the closed flag and wakes every waiter. Subsequent `push` calls
    /// fail; `pop` returns `None` once the buffer is drained.
    pub fn close(&self) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.closed = true;
        drop(guard);
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pop_total(&self) -> u64 {
        self.pop_total.load(Ordering::Relaxed)
    }

    pub fn push_wait_ns(&self) -> u64 {
        self.push_wait_ns.load(Ordering::Relaxed)
    }

    pub fn pop_wait_ns(&self) -> u64 {
        self.pop_wait_ns.load(Ordering::Relaxed)
    }

    pub fn push_contention(&self) -> u64 {
        self.push_contention.load(Ordering::Relaxed)
    }

    pub fn pop_contention(&self) -> u64 {
        self.pop_contention.load(Ordering::Relaxed)
    }

    pub fn push_hold_ns(&self) -> u64 {
        self.push_hold_ns.load(Ordering::Relaxed)
    }

    pub fn pop_hold_ns(&self) -> u64 {
        self.pop_hold_ns.load(Ordering::Relaxed)
    }
}

impl<T> Default for IngestQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_pop_is_fifo() {
        let queue = IngestQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn pop_on_empty_open_queue_times_out_to_none() {
        let queue: IngestQueue<i32> = IngestQueue::new();
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_after_close_fails() {
        let queue = IngestQueue::new();
        queue.close();
        assert_eq!(queue.push(1), Err(QueueError::Closed));
    }

    #[test]
    fn pop_drains_buffered_items_before_returning_none_after_close() {
        let queue = IngestQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close();
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn concurrent_push_wakes_a_blocked_pop() {
        let queue = Arc::new(IngestQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42).unwrap();
        });
        assert_eq!(queue.pop(), Some(42));
        handle.join().unwrap();
    }
}
