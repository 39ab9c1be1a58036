//! Generic FIFO work queue with depth, wait and processing-time metrics.
//!
//! Used by worker subsystems that feed repository jobs to a pool of
//! consumers. `pop` blocks on a condition variable until an item is pushed
//! or the queue is closed; the returned [`Completion`] guard records the
//! item's processing time when finished (or dropped).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::metrics::Metrics;

struct Inner<T> {
    items: VecDeque<(T, Instant)>,
    closed: bool,
}

pub struct Queue<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    metrics: Metrics,
}

impl<T> Queue<T> {
    pub fn new(name: &'static str, metrics: Metrics) -> Self {
        Queue {
            name,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            metrics,
        }
    }

    /// Appends an item, stamping it with the enqueue time.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.items.push_back((item, Instant::now()));
        self.metrics
            .queue_depth(self.name, inner.items.len() as u64);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Dequeues the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the queue has been closed and drained. The wait
    /// time (push to pop) is observed here; the returned guard observes the
    /// processing time.
    pub fn pop(&self) -> Option<(T, Completion)> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        loop {
            if let Some((item, pushed_at)) = inner.items.pop_front() {
                self.metrics
                    .queue_depth(self.name, inner.items.len() as u64);
                self.metrics.queue_wait(self.name, pushed_at.elapsed());
                return Some((
                    item,
                    Completion {
                        queue: self.name,
                        metrics: self.metrics.clone(),
                        started: Instant::now(),
                        recorded: false,
                    },
                ));
            }
            if inner.closed {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("queue lock poisoned");
        }
    }

    /// Closes the queue: blocked and future `pop`s return `None` once the
    /// remaining items are drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard recording how long a popped item took to process.
pub struct Completion {
    queue: &'static str,
    metrics: Metrics,
    started: Instant,
    recorded: bool,
}

impl Completion {
    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if !self.recorded {
            self.recorded = true;
            self.metrics
                .queue_processing(self.queue, self.started.elapsed());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.record();
    }
}
