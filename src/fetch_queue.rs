//! Shared multi-producer/multi-consumer priority queue for fetch requests.
//!
//! Requests are ordered by [`QueuedRequest`]'s `Ord`. Shutdown pills are counted
//! separately, always win over queued work and ignore the capacity limit, so a
//! stopping pool can wake every blocked worker even when the queue is full.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::fetch_request::{FetchRequest, QueuedRequest, TieBreakPolicy};

/// Result of a timed [`FetchQueue::pop`].
#[derive(Debug)]
pub enum QueuePop {
    Request(FetchRequest),
    /// Poison pill: the consumer should exit.
    Shutdown,
    TimedOut,
}

/// Rejected push; hands the request back to the caller.
#[derive(Debug)]
pub struct QueueFull(pub FetchRequest);

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedRequest>,
    pending_shutdowns: usize,
    next_sequence: u64,
    capacity: usize,
    policy: TieBreakPolicy,
}

/// Blocking priority queue. `capacity == 0` means unbounded.
#[derive(Default)]
pub struct FetchQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl FetchQueue {
    pub fn new(capacity: usize, policy: TieBreakPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                capacity,
                policy,
                ..QueueState::default()
            }),
            available: Condvar::new(),
        }
    }

    /// Non-blocking push; fails when the queue is at capacity.
    pub fn push(&self, request: FetchRequest) -> Result<(), QueueFull> {
        let mut state = self.state.lock().expect("fetch queue lock poisoned");
        if state.capacity > 0 && state.heap.len() >= state.capacity {
            return Err(QueueFull(request));
        }
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.wrapping_add(1);
        let policy = state.policy;
        state
            .heap
            .push(QueuedRequest::new(request, sequence, policy));
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Queues one poison pill.
    pub fn push_shutdown(&self) {
        let mut state = self.state.lock().expect("fetch queue lock poisoned");
        state.pending_shutdowns += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Waits up to `timeout` for a pill or request.
    pub fn pop(&self, timeout: Duration) -> QueuePop {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("fetch queue lock poisoned");
        loop {
            if state.pending_shutdowns > 0 {
                state.pending_shutdowns -= 1;
                return QueuePop::Shutdown;
            }
            if let Some(queued) = state.heap.pop() {
                return QueuePop::Request(queued.request);
            }
            let now = Instant::now();
            if now >= deadline {
                return QueuePop::TimedOut;
            }
            let (next_state, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .expect("fetch queue lock poisoned");
            state = next_state;
        }
    }

    /// Pending requests (pills excluded).
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("fetch queue lock poisoned")
            .heap
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every pending request and returns how many were cancelled.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().expect("fetch queue lock poisoned");
        let cancelled = state.heap.len();
        state.heap.clear();
        cancelled
    }

    /// Forgets unconsumed pills left behind by a torn-down pool.
    pub fn discard_shutdowns(&self) -> usize {
        let mut state = self.state.lock().expect("fetch queue lock poisoned");
        std::mem::take(&mut state.pending_shutdowns)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().expect("fetch queue lock poisoned").capacity = capacity;
    }

    /// Switches the policy and re-orders everything already queued.
    pub fn set_tie_break_policy(&self, policy: TieBreakPolicy) {
        let mut state = self.state.lock().expect("fetch queue lock poisoned");
        if state.policy == policy {
            return;
        }
        state.policy = policy;
        let pending = std::mem::take(&mut state.heap).into_vec();
        state.heap = pending
            .into_iter()
            .map(|queued| queued.rekeyed(policy))
            .collect();
    }
}
