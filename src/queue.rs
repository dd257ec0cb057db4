//! Bounded blocking queue — C2.
//!
//! FIFO of `T` guarded by a mutex plus two condvars (not-empty / not-full),
//! a `finished` flag and an `aborted` flag. Blocking operations are immune
//! to spurious wakeups (the condvar predicate is re-checked in a loop).
//! `finish()` followed by a drain yields every remaining item in FIFO order
//! before `blocking_pop` starts returning `None`. `signal_abort()` instead
//! wakes every waiter immediately so a stage parked in `wait()` when abort
//! fires does not hang — both flags live inside the mutex, not as a
//! standalone `AtomicBool`, so a waiter can never miss the wakeup between
//! checking the flag and entering `wait()`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Default queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 64;

struct QueueInner<T> {
    items: VecDeque<T>,
    finished: bool,
    aborted: bool,
}

pub struct BlockQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BlockQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                finished: false,
                aborted: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Blocking push. Waits until there is room, the queue is finished, or
    /// abort is signaled. On failure hands `v` back so the caller can
    /// dispose of it (e.g. free its block buffer back to the allocator).
    pub fn blocking_push(&self, v: T) -> Result<(), T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.finished || inner.aborted {
                return Err(v);
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(v);
                self.not_empty.notify_one();
                return Ok(());
            }
            inner = self.not_full.wait(inner).unwrap();
        }
    }

    /// Blocking pop. Waits until an item is available, or the queue is
    /// empty and finished/aborted. Returns `None` only in the latter case —
    /// this is the end-of-stream signal. Still drains whatever is queued
    /// before reporting `None`, even after abort, so a caller that wants to
    /// reclaim in-flight blocks can do so via a final `try_pop` loop once
    /// this returns `None`.
    pub fn blocking_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(v) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(v);
            }
            if inner.finished || inner.aborted {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Mark the queue finished. Idempotent. Wakes every waiter.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.finished = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Mark the queue aborted. Idempotent. Wakes every waiter immediately,
    /// including one already parked in `wait()` — unlike `finish()`, this
    /// signals that no further progress should be assumed possible and
    /// stages should drain-and-free rather than keep processing.
    pub fn signal_abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Non-blocking push.
    pub fn try_push(&self, v: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.finished || inner.aborted || inner.items.len() >= self.capacity {
            return false;
        }
        inner.items.push_back(v);
        self.not_empty.notify_one();
        true
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let v = inner.items.pop_front();
        if v.is_some() {
            self.not_full.notify_one();
        }
        v
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_pop_fifo_order() {
        let q: BlockQueue<i32> = BlockQueue::new(4);
        for i in 0..4 {
            assert!(q.blocking_push(i).is_ok());
        }
        for i in 0..4 {
            assert_eq!(q.blocking_pop(), Some(i));
        }
    }

    #[test]
    fn finish_wakes_waiting_pop() {
        let q: Arc<BlockQueue<i32>> = Arc::new(BlockQueue::new(4));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.blocking_pop());
        thread::sleep(Duration::from_millis(50));
        q.finish();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn finish_then_drain_returns_remaining_before_none() {
        let q: BlockQueue<i32> = BlockQueue::new(8);
        q.blocking_push(1).unwrap();
        q.blocking_push(2).unwrap();
        q.finish();
        assert_eq!(q.blocking_pop(), Some(1));
        assert_eq!(q.blocking_pop(), Some(2));
        assert_eq!(q.blocking_pop(), None);
    }

    #[test]
    fn push_after_finish_fails() {
        let q: BlockQueue<i32> = BlockQueue::new(8);
        q.finish();
        assert_eq!(q.blocking_push(42), Err(42));
    }

    #[test]
    fn try_push_respects_capacity() {
        let q: BlockQueue<i32> = BlockQueue::new(1);
        assert!(q.try_push(1));
        assert!(!q.try_push(2));
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn blocking_push_unblocks_when_consumer_drains() {
        let q: Arc<BlockQueue<i32>> = Arc::new(BlockQueue::new(1));
        q.blocking_push(0).unwrap();
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.blocking_push(1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.blocking_pop(), Some(0));
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(q.blocking_pop(), Some(1));
    }

    #[test]
    fn abort_wakes_parked_pop_and_push() {
        let q: Arc<BlockQueue<i32>> = Arc::new(BlockQueue::new(1));
        q.blocking_push(0).unwrap();

        let q_pusher = q.clone();
        let pusher = thread::spawn(move || q_pusher.blocking_push(1));

        let q_drained = Arc::new(BlockQueue::<i32>::new(1));
        let q_popper = q_drained.clone();
        let popper = thread::spawn(move || q_popper.blocking_pop());

        thread::sleep(Duration::from_millis(50));
        q.signal_abort();
        q_drained.signal_abort();

        assert_eq!(pusher.join().unwrap(), Err(1));
        assert_eq!(popper.join().unwrap(), None);
    }
}
