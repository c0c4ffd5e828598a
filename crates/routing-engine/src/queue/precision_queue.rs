//! # Precision Queues
//!
//! A [`PrecisionQueue`] pairs an ordered list of [`Step`]s with the
//! [`ServiceQueue`] of tasks waiting on it. Step-list mutation and
//! service-queue access share one per-queue lock; the agent sets inside the
//! steps have their own locks and are never touched while matching holds the
//! queue lock.
//!
//! Matching works on a snapshot: the head task and the steps it may match
//! against are copied out under the lock, candidates are evaluated and
//! reserved without it, and the commit re-validates the head by identity.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::service_queue::ServiceQueue;
use super::step::Step;
use super::types::{
    EscalationStep, QueueDefinition, QueueId, QueueStats, QueuedTask, SelectionCriterion,
    ServiceLevel, StepDefinition, StepId, TaskId,
};
use crate::agent::{Agent, AgentId, AgentRegistry, MediaDomainId};
use crate::config::MAX_STEPS_PER_QUEUE;
use crate::error::{Result, RoutingError};

/// Head of the queue and the steps it may currently match against
#[derive(Debug, Clone)]
pub struct MatchSnapshot {
    pub task: QueuedTask,
    /// Steps `0..=step_index`, in ordinal order
    pub steps: Vec<Arc<Step>>,
}

/// Outcome of a step advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepAdvance {
    pub from: usize,
    pub to: usize,
}

/// How the escalation timer of a task should be armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPlan {
    /// Step the task is at once zero-timeout steps have been passed
    pub step_index: usize,
    /// Set when the task moved forward over zero-timeout steps
    pub skipped_from: Option<usize>,
    /// Seconds left on the current step, `None` when no timer is needed
    pub remaining_secs: Option<i64>,
}

/// State guarded by the queue lock
#[derive(Debug, Default)]
pub(crate) struct QueueInner {
    steps: Vec<Arc<Step>>,
    service_queue: ServiceQueue,
}

impl QueueInner {
    fn last_step_index(&self) -> Option<usize> {
        self.steps.len().checked_sub(1)
    }

    /// First step at or after `from` with a positive timeout, or the last
    /// step
    pub(crate) fn next_escalation_step(&self, from: usize) -> Option<EscalationStep> {
        let last = self.last_step_index()?;
        let from = from.min(last);
        let index = (from..last)
            .find(|i| self.steps[*i].timeout_secs() > 0)
            .unwrap_or(last);
        Some(EscalationStep {
            index,
            timeout_secs: self.steps[index].timeout_secs(),
            is_last: index == last,
        })
    }

    fn renumber(&self) {
        for (ordinal, step) in self.steps.iter().enumerate() {
            step.set_ordinal(ordinal);
        }
    }

    pub(crate) fn contains_task(&self, task_id: &TaskId) -> bool {
        self.service_queue.contains(task_id)
    }

    /// Advance a task by exactly one step, clamped at the last step
    pub(crate) fn advance_step(&mut self, queue_id: &QueueId, task_id: &TaskId) -> Option<StepAdvance> {
        let last = self.last_step_index().unwrap_or(0);
        let task = self.service_queue.get_mut(task_id)?;
        let from = task.step_index;
        if from > last {
            warn!(
                "Task {} in queue {} at step {} beyond last step {}, clamping",
                task_id, queue_id, from, last
            );
        }
        let to = if from < last { from + 1 } else { from };
        if to != from {
            task.step_index = to;
            task.step_started_at = Utc::now();
        }
        Some(StepAdvance { from, to })
    }

    /// Work out the escalation timer of a queued task
    ///
    /// Non-last steps with a zero timeout are passed over immediately; the
    /// task's step index moves forward to the first step that has a timeout
    /// (or the last step). The remaining budget accounts for time already
    /// spent on the step, which is what a restored task needs.
    pub(crate) fn plan_escalation(&mut self, task_id: &TaskId) -> Option<EscalationPlan> {
        let escalation = {
            let task = self.service_queue.get(task_id)?;
            self.next_escalation_step(task.step_index)
        };
        let task = self.service_queue.get_mut(task_id)?;

        let Some(escalation) = escalation else {
            return Some(EscalationPlan {
                step_index: task.step_index,
                skipped_from: None,
                remaining_secs: None,
            });
        };

        let mut skipped_from = None;
        if escalation.index > task.step_index {
            skipped_from = Some(task.step_index);
            task.step_index = escalation.index;
            task.step_started_at = Utc::now();
        }

        let remaining_secs = if escalation.is_last {
            None
        } else {
            let spent = (Utc::now() - task.step_started_at).num_seconds();
            Some(escalation.timeout_secs as i64 - spent)
        };

        Some(EscalationPlan {
            step_index: task.step_index,
            skipped_from,
            remaining_secs,
        })
    }

    pub(crate) fn remove_task(&mut self, task_id: &TaskId) -> Option<QueuedTask> {
        self.service_queue.remove(task_id)
    }

    /// Ids of the queued tasks in service order
    pub(crate) fn task_ids(&self) -> Vec<TaskId> {
        self.service_queue.iter().map(|task| task.task_id.clone()).collect()
    }

    pub(crate) fn get_task(&self, task_id: &TaskId) -> Option<&QueuedTask> {
        self.service_queue.get(task_id)
    }

    pub(crate) fn drain(&mut self) -> Vec<QueuedTask> {
        self.service_queue.drain()
    }
}

/// Ordered steps plus the service queue of one routing target
#[derive(Debug)]
pub struct PrecisionQueue {
    id: QueueId,
    name: String,
    media_domain: MediaDomainId,
    criterion: SelectionCriterion,
    service_level: ServiceLevel,
    max_steps: usize,
    inner: Mutex<QueueInner>,
}

impl PrecisionQueue {
    /// Build a queue from its definition, evaluating every step against the
    /// current agent directory
    ///
    /// A queue with zero steps is valid but can never match.
    pub fn new(
        definition: &QueueDefinition,
        max_steps: usize,
        default_service_level_secs: u64,
        registry: &AgentRegistry,
    ) -> Result<Self> {
        let max_steps = max_steps.min(MAX_STEPS_PER_QUEUE);
        if definition.steps.len() > max_steps {
            return Err(RoutingError::configuration(format!(
                "queue '{}' defines {} steps, the limit is {}",
                definition.id,
                definition.steps.len(),
                max_steps
            )));
        }

        let agents = registry.list();
        let mut steps = Vec::with_capacity(definition.steps.len());
        for (ordinal, step_definition) in definition.steps.iter().enumerate() {
            let step = build_step(step_definition, ordinal)?;
            step.evaluate_all(&agents);
            steps.push(Arc::new(step));
        }

        Ok(Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            media_domain: definition.media_domain.clone(),
            criterion: definition.criterion,
            service_level: definition
                .service_level
                .unwrap_or_else(|| ServiceLevel::wait_time(default_service_level_secs)),
            max_steps,
            inner: Mutex::new(QueueInner {
                steps,
                service_queue: ServiceQueue::new(),
            }),
        })
    }

    pub fn id(&self) -> &QueueId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media_domain(&self) -> &MediaDomainId {
        &self.media_domain
    }

    pub fn criterion(&self) -> SelectionCriterion {
        self.criterion
    }

    pub fn service_level(&self) -> ServiceLevel {
        self.service_level
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock()
    }

    // ---- steps -----------------------------------------------------------

    /// Append a step; fails once the queue holds its maximum number of steps
    pub fn add_step(&self, definition: &StepDefinition, registry: &AgentRegistry) -> Result<StepId> {
        let mut inner = self.inner.lock();
        if inner.steps.len() >= self.max_steps {
            return Err(RoutingError::configuration(format!(
                "queue '{}' already has {} steps",
                self.id, self.max_steps
            )));
        }
        let step = build_step(definition, inner.steps.len())?;
        if inner.steps.iter().any(|s| s.id() == step.id()) {
            return Err(RoutingError::already_exists(format!(
                "step '{}' already exists in queue '{}'",
                step.id(),
                self.id
            )));
        }
        step.evaluate_all(&registry.list());
        let id = step.id().clone();
        info!("Added step {} at ordinal {} to queue {}", id, step.ordinal(), self.id);
        inner.steps.push(Arc::new(step));
        Ok(id)
    }

    /// Remove a step and renumber the remaining ones
    pub fn delete_step_by_id(&self, step_id: &StepId) -> Result<()> {
        let mut inner = self.inner.lock();
        let position = inner
            .steps
            .iter()
            .position(|s| s.id() == step_id)
            .ok_or_else(|| {
                RoutingError::not_found(format!("step '{}' not found in queue '{}'", step_id, self.id))
            })?;
        inner.steps.remove(position);
        inner.renumber();
        info!("Deleted step {} from queue {}", step_id, self.id);
        Ok(())
    }

    /// Replace a step's expressions and timeout, keeping its id and ordinal
    pub fn update_step(
        &self,
        step_id: &StepId,
        definition: &StepDefinition,
        registry: &AgentRegistry,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let position = inner
            .steps
            .iter()
            .position(|s| s.id() == step_id)
            .ok_or_else(|| {
                RoutingError::not_found(format!("step '{}' not found in queue '{}'", step_id, self.id))
            })?;
        let definition = StepDefinition {
            id: Some(step_id.clone()),
            ..definition.clone()
        };
        let step = build_step(&definition, position)?;
        step.evaluate_all(&registry.list());
        inner.steps[position] = Arc::new(step);
        debug!("Updated step {} of queue {}", step_id, self.id);
        Ok(())
    }

    pub fn step_at(&self, index: usize) -> Option<Arc<Step>> {
        self.inner.lock().steps.get(index).cloned()
    }

    pub fn steps(&self) -> Vec<Arc<Step>> {
        self.inner.lock().steps.clone()
    }

    pub fn step_count(&self) -> usize {
        self.inner.lock().steps.len()
    }

    /// First step at or after `from` with a positive timeout, otherwise the
    /// last step
    pub fn next_escalation_step(&self, from: usize) -> Option<EscalationStep> {
        self.inner.lock().next_escalation_step(from)
    }

    // ---- tasks -----------------------------------------------------------

    /// Queue a task; false when a task with the same id is already queued
    pub fn enqueue(&self, task: QueuedTask) -> bool {
        self.inner.lock().service_queue.enqueue(task)
    }

    pub fn dequeue_head(&self) -> Option<QueuedTask> {
        self.inner.lock().service_queue.dequeue()
    }

    pub fn peek_head(&self) -> Option<QueuedTask> {
        self.inner.lock().service_queue.peek().cloned()
    }

    /// Remove by identity; removing an absent task is a no-op
    pub fn remove_task(&self, task_id: &TaskId) -> Option<QueuedTask> {
        self.inner.lock().service_queue.remove(task_id)
    }

    /// Remove `task` only if the queued entry is that very admission
    pub fn remove_instance(&self, task: &QueuedTask) -> Option<QueuedTask> {
        let mut inner = self.inner.lock();
        let same = inner
            .service_queue
            .get(&task.task_id)
            .map(|queued| queued.id == task.id)
            .unwrap_or(false);
        if same {
            inner.service_queue.remove(&task.task_id)
        } else {
            None
        }
    }

    pub fn get_task(&self, task_id: &TaskId) -> Option<QueuedTask> {
        self.inner.lock().service_queue.get(task_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().service_queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().service_queue.len()
    }

    /// Queued tasks in service order
    pub fn tasks(&self) -> Vec<QueuedTask> {
        self.inner.lock().service_queue.iter().cloned().collect()
    }

    pub fn drain(&self) -> Vec<QueuedTask> {
        self.inner.lock().service_queue.drain()
    }

    /// Advance a task by one step, clamped at the last step
    pub fn advance_step(&self, task_id: &TaskId) -> Option<StepAdvance> {
        self.inner.lock().advance_step(&self.id, task_id)
    }

    /// Copy out the head and its reachable steps for a match attempt
    ///
    /// Returns `None` for an empty queue or a queue without steps. A head
    /// whose step index points past the last step is matched against every
    /// step and the inconsistency is logged.
    pub fn matching_snapshot(&self) -> Option<MatchSnapshot> {
        let inner = self.inner.lock();
        let task = inner.service_queue.peek()?.clone();
        let last = inner.last_step_index()?;
        let reach = if task.step_index > last {
            warn!(
                "Task {} in queue {} at step {} beyond last step {}, clamping",
                task.task_id, self.id, task.step_index, last
            );
            last
        } else {
            task.step_index
        };
        Some(MatchSnapshot {
            task,
            steps: inner.steps[..=reach].to_vec(),
        })
    }

    /// Whether any step currently lists the agent
    pub fn references_agent(&self, agent_id: &AgentId) -> bool {
        self.steps().iter().any(|step| step.contains(agent_id))
    }

    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut stats = QueueStats {
            queue_id: self.id.clone(),
            total_tasks: inner.service_queue.len(),
            average_wait_secs: 0,
            longest_wait_secs: 0,
            tasks_per_step: Default::default(),
            breaching_service_level: 0,
        };

        let mut total_wait = 0u64;
        for task in inner.service_queue.iter() {
            let wait = task.wait_secs(now);
            total_wait += wait;
            stats.longest_wait_secs = stats.longest_wait_secs.max(wait);
            *stats.tasks_per_step.entry(task.step_index).or_insert(0) += 1;
            if self.service_level.is_breached(wait) {
                stats.breaching_service_level += 1;
            }
        }
        if stats.total_tasks > 0 {
            stats.average_wait_secs = total_wait / stats.total_tasks as u64;
        }
        stats
    }

    // ---- agent directory fan-out ------------------------------------------

    pub fn on_agent_inserted(&self, agent: &Agent) {
        for step in self.steps() {
            step.evaluate_on_agent_insert(agent);
        }
    }

    pub fn on_agent_updated(&self, agent: &Agent) {
        for step in self.steps() {
            step.evaluate_on_agent_update(agent);
        }
    }

    pub fn on_agent_removed(&self, agent_id: &AgentId) {
        for step in self.steps() {
            step.remove_agent(agent_id);
        }
    }
}

fn build_step(definition: &StepDefinition, ordinal: usize) -> Result<Step> {
    for expression in &definition.expressions {
        expression.validate()?;
    }
    let id = definition.id.clone().unwrap_or_else(StepId::new_random);
    Ok(Step::new(
        id,
        ordinal,
        definition.expressions.clone(),
        definition.timeout_secs,
    ))
}
