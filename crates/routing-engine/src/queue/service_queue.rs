//! Pending-task ordering for a single precision queue
//!
//! Tasks are ordered by descending priority, then ascending enqueue time.
//! Ties on both are broken by insertion order, so equal-priority tasks are
//! served strictly FIFO even when their timestamps collide.
//!
//! The service queue is not synchronized on its own; the owning
//! [`PrecisionQueue`](super::PrecisionQueue) guards it with the queue lock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use super::types::{QueuedTask, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<u32>,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

/// Ordered multiset of [`QueuedTask`]s with lookup by task id
#[derive(Debug, Default)]
pub struct ServiceQueue {
    ordered: BTreeMap<QueueKey, QueuedTask>,
    index: HashMap<TaskId, QueueKey>,
    next_seq: u64,
}

impl ServiceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task; returns false and leaves the queue untouched when a
    /// task with the same id is already queued
    pub fn enqueue(&mut self, task: QueuedTask) -> bool {
        if self.index.contains_key(&task.task_id) {
            return false;
        }
        let key = QueueKey {
            priority: Reverse(task.priority),
            enqueued_at: task.enqueued_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.index.insert(task.task_id.clone(), key);
        self.ordered.insert(key, task);
        true
    }

    pub fn peek(&self) -> Option<&QueuedTask> {
        self.ordered.values().next()
    }

    pub fn dequeue(&mut self) -> Option<QueuedTask> {
        let (_, task) = self.ordered.pop_first()?;
        self.index.remove(&task.task_id);
        Some(task)
    }

    /// Remove by identity; a task that is not queued is a no-op
    pub fn remove(&mut self, task_id: &TaskId) -> Option<QueuedTask> {
        let key = self.index.remove(task_id)?;
        self.ordered.remove(&key)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&QueuedTask> {
        let key = self.index.get(task_id)?;
        self.ordered.get(key)
    }

    /// Mutable access for bookkeeping fields
    ///
    /// Callers must not change `priority`, `enqueued_at` or `task_id`; those
    /// fields are the ordering key.
    pub fn get_mut(&mut self, task_id: &TaskId) -> Option<&mut QueuedTask> {
        let key = self.index.get(task_id)?;
        self.ordered.get_mut(key)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.index.contains_key(task_id)
    }

    /// Tasks in service order
    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.ordered.values()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Remove every task, returned in service order
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.index.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }
}
