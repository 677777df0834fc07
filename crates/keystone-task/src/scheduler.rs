use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use keystone_types::Oid;
use tracing::trace;

/// A durable task handed to the scheduler after its transaction committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledTask {
    pub target: DateTime<Utc>,
    pub handle: Oid,
}

/// Accepts committed tasks for later execution.
///
/// Delivery is at-least-once; the only ordering promise is ascending target
/// time.
pub trait TaskScheduler: Send + Sync {
    fn submit(&self, task: ScheduledTask);
}

/// Heap key: target time, then submission order.
type QueueKey = (DateTime<Utc>, u64, Oid);

/// In-memory scheduler ordered by target time; equal targets run in
/// submission order.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueKey>>>,
    seq: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the earliest task due at `now`.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<ScheduledTask> {
        let mut heap = self.heap.lock().expect("lock poisoned");
        let due = heap.peek().is_some_and(|Reverse((target, _, _))| *target <= now);
        if due {
            heap.pop().map(|Reverse((target, _, handle))| ScheduledTask { target, handle })
        } else {
            None
        }
    }

    /// Target time of the earliest queued task.
    pub fn next_target(&self) -> Option<DateTime<Utc>> {
        let heap = self.heap.lock().expect("lock poisoned");
        heap.peek().map(|Reverse((target, _, _))| *target)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every queued task, earliest first, without removing them.
    pub fn snapshot(&self) -> Vec<ScheduledTask> {
        let heap = self.heap.lock().expect("lock poisoned");
        let mut keys: Vec<QueueKey> = heap.iter().map(|Reverse(key)| *key).collect();
        keys.sort();
        keys.into_iter()
            .map(|(target, _, handle)| ScheduledTask { target, handle })
            .collect()
    }
}

impl TaskScheduler for TaskQueue {
    fn submit(&self, task: ScheduledTask) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        trace!(handle = %task.handle, target = %task.target, "queued task");
        self.heap
            .lock()
            .expect("lock poisoned")
            .push(Reverse((task.target, seq, task.handle)));
    }
}
