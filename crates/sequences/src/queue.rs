//! Deferred execution queue: "run execution X at time T".
//!
//! Delivery is at-least-once. The same execution may be handed out more than
//! once and the executor's claim makes the repeats no-ops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

pub trait DeferredQueue: Send + Sync {
    fn schedule_at(&self, execution_id: Uuid, at: DateTime<Utc>);
}

/// Min-heap on fire time; ties break on insertion order.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, Uuid)>>,
    seq: u64,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop every entry due at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut state = self.inner.lock();
        let mut ready = Vec::new();
        while let Some(Reverse((at, _, _))) = state.heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = state.heap.pop() {
                ready.push(id);
            }
        }
        if !ready.is_empty() {
            metrics::gauge!("sequence.queue_depth").set(state.heap.len() as f64);
        }
        ready
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().heap.peek().map(|Reverse((at, _, _))| *at)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }
}

impl DeferredQueue for InMemoryQueue {
    fn schedule_at(&self, execution_id: Uuid, at: DateTime<Utc>) {
        let mut state = self.inner.lock();
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Reverse((at, seq, execution_id)));
        metrics::gauge!("sequence.queue_depth").set(state.heap.len() as f64);
    }
}
