//! Bounded slot pool with strict FIFO admission.
//!
//! A submission registers a `Ticket` when it is accepted, so queue order is
//! acceptance order. Only the ticket at the front of the queue may take a free
//! slot; a ticket whose deadline passes leaves the queue without a slot.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct PoolState {
    free: BTreeSet<usize>,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

pub struct SlotPool {
    size: usize,
    state: Mutex<PoolState>,
    changed: Condvar,
}

/// The deadline passed before a slot became available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueExpired {
    pub waited: Duration,
}

impl SlotPool {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(SlotPool {
            size,
            state: Mutex::new(PoolState {
                free: (0..size).collect(),
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Join the back of the queue.
    pub fn register(self: &Arc<Self>) -> Ticket {
        let mut state = self.lock();
        let id = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(id);
        Ticket {
            pool: Arc::clone(self),
            id,
        }
    }
}

/// A place in the queue. Dropping it leaves the queue.
pub struct Ticket {
    pool: Arc<SlotPool>,
    id: u64,
}

impl Ticket {
    /// Block until this ticket is at the front and a slot is free, or until
    /// `deadline`. A slot that frees up at or after the deadline is not taken.
    pub fn acquire(self, deadline: Instant) -> Result<SlotGuard, QueueExpired> {
        let started = Instant::now();
        let pool = &self.pool;
        let mut state = pool.lock();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueExpired {
                    waited: started.elapsed(),
                });
            }
            if state.queue.front() == Some(&self.id) {
                if let Some(slot) = state.free.pop_first() {
                    state.queue.pop_front();
                    // Another free slot may now belong to the next ticket.
                    pool.changed.notify_all();
                    return Ok(SlotGuard {
                        pool: Arc::clone(pool),
                        slot,
                    });
                }
            }
            state = pool
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        if let Some(position) = state.queue.iter().position(|id| *id == self.id) {
            state.queue.remove(position);
            self.pool.changed.notify_all();
        }
    }
}

/// A held slot, returned to the pool on drop
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    slot: usize,
}

impl SlotGuard {
    /// Slot index, also used to pick the sandbox identity
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.free.insert(self.slot);
        self.pool.changed.notify_all();
    }
}
