//! # Agent Availability State
//!
//! Each [`Agent`] carries the state the matcher reads on the routing hot
//! path: the overall state, a sub-state per media domain, the active tasks
//! per media domain, the non-interruptible flag and a single reservation
//! slot.
//!
//! ## Locking
//!
//! Three independent locks keep unrelated writers from contending:
//!
//! - `attributes` (read-mostly) is read by step evaluation,
//! - `state` covers overall state, sub-states and active tasks,
//! - `reservation` is the compare-and-set slot.
//!
//! [`Agent::reserve_task`] is the single synchronization point preventing
//! two routers from booking the same agent: only one caller can observe the
//! slot empty and fill it. A caller that loses treats the agent as "not a
//! match" and moves on to the next candidate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::types::{
    ActiveTask, AgentId, AgentState, MediaDomainId, MediaDomainState, ReservedTask,
};
use crate::expression::{matches_all, AttributeSet, Expression};
use crate::queue::TaskId;

/// Sub-state of one media domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaDomainStatus {
    pub state: MediaDomainState,
    /// Last time the agent became ready (or active) on this domain
    pub last_ready_change: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AvailabilityState {
    overall: AgentState,
    media_domains: HashMap<MediaDomainId, MediaDomainStatus>,
    active_tasks: HashMap<MediaDomainId, Vec<ActiveTask>>,
    non_interruptible: bool,
}

/// A routable agent and its availability state
#[derive(Debug)]
pub struct Agent {
    id: AgentId,
    display_name: String,
    attributes: RwLock<AttributeSet>,
    state: Mutex<AvailabilityState>,
    reservation: Mutex<Option<ReservedTask>>,
}

impl Agent {
    /// Create a logged-out agent with the given routing attributes
    pub fn new(id: impl Into<AgentId>, display_name: impl Into<String>, attributes: AttributeSet) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            attributes: RwLock::new(attributes),
            state: Mutex::new(AvailabilityState::default()),
            reservation: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Snapshot of the routing attributes
    pub fn attributes(&self) -> AttributeSet {
        self.attributes.read().clone()
    }

    /// Replace the routing attributes
    ///
    /// Callers must re-evaluate every step afterwards; the engine does this
    /// through `RoutingEngine::update_agent_attributes`.
    pub fn set_attributes(&self, attributes: AttributeSet) {
        *self.attributes.write() = attributes;
    }

    /// Evaluate step expressions against the current attributes without
    /// copying them
    pub fn satisfies(&self, expressions: &[Expression]) -> bool {
        matches_all(&self.attributes.read(), expressions)
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().overall
    }

    pub fn set_state(&self, state: AgentState) {
        let mut guard = self.state.lock();
        if guard.overall != state {
            debug!("Agent {} state {} -> {}", self.id, guard.overall, state);
            guard.overall = state;
        }
    }

    pub fn media_domain_status(&self, domain: &MediaDomainId) -> Option<MediaDomainStatus> {
        self.state.lock().media_domains.get(domain).copied()
    }

    /// Set the sub-state for a media domain
    ///
    /// The ready timestamp used by LONGEST_AVAILABLE ordering moves only when
    /// the agent starts accepting work on the domain, not on every change.
    pub fn set_media_domain_state(&self, domain: MediaDomainId, state: MediaDomainState) {
        let now = Utc::now();
        let mut guard = self.state.lock();
        let entry = guard.media_domains.entry(domain).or_insert(MediaDomainStatus {
            state: MediaDomainState::NotReady,
            last_ready_change: now,
        });
        if state.accepts_work() && !entry.state.accepts_work() {
            entry.last_ready_change = now;
        }
        entry.state = state;
    }

    /// Last time the agent became ready on `domain`, if ever
    pub fn last_ready_change(&self, domain: &MediaDomainId) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .media_domains
            .get(domain)
            .filter(|status| status.state.accepts_work())
            .map(|status| status.last_ready_change)
    }

    pub fn is_non_interruptible(&self) -> bool {
        self.state.lock().non_interruptible
    }

    pub fn set_non_interruptible(&self, flag: bool) {
        self.state.lock().non_interruptible = flag;
    }

    /// Whether the agent may be offered a task on `domain` right now
    ///
    /// True iff the overall state is READY, the domain sub-state is READY or
    /// ACTIVE, the reservation slot is empty, and the agent is not flagged
    /// non-interruptible.
    pub fn is_available_for_reservation(&self, domain: &MediaDomainId) -> bool {
        {
            let state = self.state.lock();
            if state.overall != AgentState::Ready || state.non_interruptible {
                return false;
            }
            let domain_ready = state
                .media_domains
                .get(domain)
                .map(|status| status.state.accepts_work())
                .unwrap_or(false);
            if !domain_ready {
                return false;
            }
        }
        self.reservation.lock().is_none()
    }

    /// Fill the reservation slot iff it is empty
    pub fn reserve_task(&self, reserved: ReservedTask) -> bool {
        let mut slot = self.reservation.lock();
        if slot.is_some() {
            return false;
        }
        debug!("Agent {} reserved for task {}", self.id, reserved.task_id());
        *slot = Some(reserved);
        true
    }

    /// Clear the reservation slot (accept, revoke or timeout)
    pub fn remove_reserved_task(&self) -> Option<ReservedTask> {
        self.reservation.lock().take()
    }

    /// Clear the reservation slot only if it holds `task_id`
    pub fn remove_reserved_task_if(&self, task_id: &TaskId) -> Option<ReservedTask> {
        let mut slot = self.reservation.lock();
        if slot.as_ref().map(|r| r.task_id() == task_id).unwrap_or(false) {
            slot.take()
        } else {
            None
        }
    }

    /// Replace the slot content, only while it still holds the same queued
    /// instance of the task
    pub fn refresh_reservation(&self, reserved: ReservedTask) -> bool {
        let mut slot = self.reservation.lock();
        match slot.as_mut() {
            Some(current) if current.task.id == reserved.task.id => {
                *current = reserved;
                true
            }
            _ => false,
        }
    }

    pub fn reserved_task(&self) -> Option<ReservedTask> {
        self.reservation.lock().clone()
    }

    pub fn has_reservation(&self) -> bool {
        self.reservation.lock().is_some()
    }

    pub fn add_active_task(&self, domain: MediaDomainId, task: ActiveTask) {
        self.state.lock().active_tasks.entry(domain).or_default().push(task);
    }

    /// Remove an active task from whichever domain holds it
    pub fn remove_task(&self, task_id: &TaskId) -> Option<ActiveTask> {
        let mut state = self.state.lock();
        for tasks in state.active_tasks.values_mut() {
            if let Some(position) = tasks.iter().position(|t| &t.task_id == task_id) {
                return Some(tasks.remove(position));
            }
        }
        None
    }

    pub fn active_tasks(&self, domain: &MediaDomainId) -> Vec<ActiveTask> {
        self.state
            .lock()
            .active_tasks
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of active tasks of any mode on `domain`
    pub fn active_task_count(&self, domain: &MediaDomainId) -> usize {
        self.state
            .lock()
            .active_tasks
            .get(domain)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of queue-mode and named-transfer tasks on `domain`
    ///
    /// Push-delivered outbound tasks are excluded; this is the count the
    /// capacity-to-sub-state logic works from.
    pub fn no_of_active_queue_tasks(&self, domain: &MediaDomainId) -> usize {
        self.state
            .lock()
            .active_tasks
            .get(domain)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|t| t.mode.counts_toward_queue_capacity())
                    .count()
            })
            .unwrap_or(0)
    }
}
