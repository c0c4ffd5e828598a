//! # Step-Escalation Timers
//!
//! One shared timer service for every queued task. Each task owns at most
//! one armed timer; arming again replaces the previous deadline and
//! cancelling is idempotent. Expiry publishes a [`RouterEvent::Timer`] for
//! the task through the [`EventBus`], which drops it if the task has left
//! its queue in the meantime.
//!
//! Deadlines live in a min-heap. Replaced and cancelled entries are not
//! removed from the heap; each entry carries the generation it was armed
//! with and the driver discards entries whose generation is no longer the
//! task's current one.
//!
//! A fired timer stays on record under its generation until the router
//! claims it with [`EscalationTimers::take_fired`]. Cancelling or re-arming
//! the task drops the record, so a `Timer` event that was already queued
//! when that happened is recognised as stale.
//!
//! The driver runs on `tokio::time`, so tests can drive escalation with a
//! paused clock.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::queue::TaskId;
use crate::routing::events::{EventBus, RouterEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    generation: u64,
    task_id: TaskId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    /// Current generation per armed task
    armed: HashMap<TaskId, u64>,
    /// Generation of fired timers whose event has not been claimed yet
    fired: HashMap<TaskId, u64>,
    next_generation: u64,
    shutdown: bool,
}

impl TimerState {
    /// Pop every live entry due at `now`, returning task ids and
    /// generations in deadline order
    fn take_due(&mut self, now: Instant) -> Vec<(TaskId, u64)> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.armed.get(&entry.task_id) == Some(&entry.generation) {
                self.armed.remove(&entry.task_id);
                self.fired.insert(entry.task_id.clone(), entry.generation);
                due.push((entry.task_id, entry.generation));
            }
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.deadline)
    }
}

/// Shared escalation timer service
#[derive(Debug)]
pub struct EscalationTimers {
    state: Mutex<TimerState>,
    notify: Notify,
    bus: Arc<EventBus>,
}

impl EscalationTimers {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(TimerState::default()),
            notify: Notify::new(),
            bus,
        }
    }

    /// Arm the task's timer to fire after `delay`, replacing any timer
    /// already armed for it
    pub fn arm(&self, task_id: TaskId, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.armed.insert(task_id.clone(), generation);
            state.fired.remove(&task_id);
            trace!("Armed escalation timer for task {} in {:?}", task_id, delay);
            state.heap.push(Reverse(TimerEntry {
                deadline,
                generation,
                task_id,
            }));
        }
        self.notify.notify_one();
    }

    /// Cancel the task's timer; cancelling twice is a no-op
    ///
    /// A timer that already fired but whose event is still in flight is
    /// invalidated as well.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            state.fired.remove(task_id);
            state.armed.remove(task_id).is_some()
        };
        if cancelled {
            trace!("Cancelled escalation timer for task {}", task_id);
        }
        cancelled
    }

    /// Claim a fired timer
    ///
    /// Returns false when the event is stale: the task was cancelled or
    /// re-armed after the timer fired, or the event was already claimed.
    pub fn take_fired(&self, task_id: &TaskId, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.fired.get(task_id) == Some(&generation) {
            state.fired.remove(task_id);
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, task_id: &TaskId) -> bool {
        self.state.lock().armed.contains_key(task_id)
    }

    pub fn armed_count(&self) -> usize {
        self.state.lock().armed.len()
    }

    /// Start the driver task
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let timers = Arc::clone(self);
        tokio::spawn(async move { timers.run().await })
    }

    /// Stop the driver; armed timers are discarded
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.armed.clear();
            state.fired.clear();
            state.heap.clear();
        }
        self.notify.notify_one();
    }

    async fn run(&self) {
        debug!("Escalation timer driver started");
        loop {
            let (due, next_deadline) = {
                let mut state = self.state.lock();
                if state.shutdown {
                    break;
                }
                let due = state.take_due(Instant::now());
                (due, state.next_deadline())
            };

            for (task_id, generation) in due {
                match self
                    .bus
                    .publish_task_event(&task_id, RouterEvent::Timer(task_id.clone(), generation))
                {
                    Ok(true) => {}
                    Ok(false) => {
                        self.take_fired(&task_id, generation);
                    }
                    Err(e) => {
                        self.take_fired(&task_id, generation);
                        warn!("Escalation timer for task {} not delivered: {}", task_id, e);
                    }
                }
            }

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
        debug!("Escalation timer driver stopped");
    }
}
