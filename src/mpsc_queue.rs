//! MPSC (Multiple Producer Single Consumer) request queue
//!
//! Any process may enqueue a shared-memory grant request; only the worker
//! dequeues. The queue is a bounded FIFO ring behind one mutex, with
//! condition variables so neither side has to spin.
//!
//! # Design
//! - Producers: lock -> wait while full -> append -> notify consumer
//! - Consumer: lock -> wait while empty -> take head -> notify producers
//! - `close()` wakes everyone; closed queues refuse pushes and drain pops

use crate::error::{Result, ShareError};
use crate::process::Pid;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default number of request slots
pub const MAX_SLOTS: usize = 64;

/// A request to alias a producer's descriptor region into the worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmemRequest {
    /// Process that owns the descriptor
    pub src_pid: Pid,
    /// Process that will service it
    pub dst_pid: Pid,
    /// Address of the descriptor in the producer's space; doubles as the
    /// operation handle
    pub src_va: usize,
    /// Size of the descriptor region in bytes
    pub size: usize,
}

struct Ring {
    slots: VecDeque<ShmemRequest>,
    capacity: usize,
    closed: bool,
}

/// Bounded blocking FIFO of [`ShmemRequest`]s
pub struct RequestQueue {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Try to push a request (non-blocking)
    ///
    /// Fails with `QueueFull` when every slot is taken.
    pub fn try_push(&self, req: ShmemRequest) -> Result<()> {
        let mut ring = self.ring.lock();
        if ring.closed {
            return Err(ShareError::QueueClosed);
        }
        if ring.slots.len() >= ring.capacity {
            return Err(ShareError::QueueFull);
        }
        ring.slots.push_back(req);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push a request, blocking until a slot is free
    pub fn push(&self, req: ShmemRequest) -> Result<()> {
        let mut ring = self.ring.lock();
        while !ring.closed && ring.slots.len() >= ring.capacity {
            self.not_full.wait(&mut ring);
        }
        if ring.closed {
            return Err(ShareError::QueueClosed);
        }
        ring.slots.push_back(req);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Try to pop the head request (non-blocking)
    ///
    /// Returns `Ok(None)` when empty, `QueueClosed` once closed and drained.
    pub fn try_pop(&self) -> Result<Option<ShmemRequest>> {
        let mut ring = self.ring.lock();
        match ring.slots.pop_front() {
            Some(req) => {
                drop(ring);
                self.not_full.notify_one();
                Ok(Some(req))
            }
            None if ring.closed => Err(ShareError::QueueClosed),
            None => Ok(None),
        }
    }

    /// Pop the head request, blocking until one is available
    pub fn pop(&self) -> Result<ShmemRequest> {
        let mut ring = self.ring.lock();
        loop {
            if let Some(req) = ring.slots.pop_front() {
                drop(ring);
                self.not_full.notify_one();
                return Ok(req);
            }
            if ring.closed {
                return Err(ShareError::QueueClosed);
            }
            self.not_empty.wait(&mut ring);
        }
    }

    /// Pop with a deadline, then return `Ok(None)`
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<ShmemRequest>> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if let Some(req) = ring.slots.pop_front() {
                drop(ring);
                self.not_full.notify_one();
                return Ok(Some(req));
            }
            if ring.closed {
                return Err(ShareError::QueueClosed);
            }
            if self.not_empty.wait_until(&mut ring, deadline).timed_out() {
                return match ring.slots.pop_front() {
                    Some(req) => {
                        drop(ring);
                        self.not_full.notify_one();
                        Ok(Some(req))
                    }
                    None => Ok(None),
                };
            }
        }
    }

    /// Refuse further pushes and wake every waiter
    pub fn close(&self) {
        self.ring.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().closed
    }

    pub fn len(&self) -> usize {
        self.ring.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(MAX_SLOTS)
    }
}
