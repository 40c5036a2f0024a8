//! Blocking bounded sentence queue.
//!
//! Every output interface owns one of these; input interfaces push into
//! the engine's central queue. When the queue is full the oldest record
//! is dropped, so a stalled consumer sheds the stalest data first.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::sentence::Senblk;

#[derive(Debug)]
pub struct SenQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

#[derive(Debug)]
struct Inner {
    buf: VecDeque<Senblk>,
    cap: usize,
    closed: bool,
    dropped: u64,
}

impl SenQueue {
    pub fn new(cap: usize) -> Self {
        SenQueue {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(cap),
                cap: cap.max(1),
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Appends a record, dropping the oldest buffered record when the
    /// queue is full. Pushes to a closed queue are discarded.
    pub fn push(&self, sb: Senblk) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        if inner.buf.len() == inner.cap {
            inner.buf.pop_front();
            inner.dropped += 1;
        }
        inner.buf.push_back(sb);
        self.ready.notify_one();
    }

    /// Removes and returns the next record, blocking while the queue is
    /// empty. Returns `None` once the queue is closed and drained.
    pub fn next_senblk(&self) -> Option<Senblk> {
        let mut inner = self.inner.lock().unwrap();
        while inner.buf.is_empty() {
            if inner.closed {
                return None;
            }
            inner = self.ready.wait(inner).unwrap();
        }
        inner.buf.pop_front()
    }

    /// Discards every buffered record.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buf.clear();
    }

    /// Closes the queue and wakes all blocked consumers. Buffered
    /// records remain readable until drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of records shed because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }
}
