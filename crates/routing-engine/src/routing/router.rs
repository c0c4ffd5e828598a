//! # Task Router
//!
//! One [`TaskRouter`] runs per precision queue. It consumes the queue's
//! event channel and owns the `QUEUED -> RESERVED` transition of the queue's
//! tasks:
//!
//! ```text
//! QUEUED(step) --match + gateway ok--> RESERVED(agent) --accept--> ACTIVE
//!      ^                                    |
//!      +--------------- revoke -------------+
//! ```
//!
//! Every event first does its bookkeeping (subscriptions and escalation
//! timers) and then, when routing is enabled, tries to match the head of the
//! queue. Errors and panics raised while handling one event are logged at
//! the dispatch boundary and never stop the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::events::{EventBus, RouterEvent, RoutingOutcome};
use super::gateway::ReservationGateway;
use crate::agent::{Agent, AgentRegistry, ReservedTask};
use crate::config::RoutingEngineConfig;
use crate::database::TaskRepository;
use crate::error::Result;
use crate::queue::{EscalationPlan, PrecisionQueue, QueuedTask, Step, TaskId};
use crate::timer::EscalationTimers;

/// Event-driven scheduler bound to one [`PrecisionQueue`]
#[derive(Clone)]
pub struct TaskRouter {
    queue: Arc<PrecisionQueue>,
    agents: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    timers: Arc<EscalationTimers>,
    gateway: Arc<dyn ReservationGateway>,
    repository: Option<Arc<dyn TaskRepository>>,
    config: Arc<RoutingEngineConfig>,
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("queue_id", self.queue.id())
            .field("routing_enabled", &self.config.router.routing_enabled)
            .finish()
    }
}

impl TaskRouter {
    pub fn new(
        queue: Arc<PrecisionQueue>,
        agents: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        timers: Arc<EscalationTimers>,
        gateway: Arc<dyn ReservationGateway>,
        repository: Option<Arc<dyn TaskRepository>>,
        config: Arc<RoutingEngineConfig>,
    ) -> Self {
        Self {
            queue,
            agents,
            bus,
            timers,
            gateway,
            repository,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<PrecisionQueue> {
        &self.queue
    }

    /// Run the router on its own task until [`RouterEvent::Shutdown`] or the
    /// channel closes
    pub fn spawn(self, events: mpsc::UnboundedReceiver<RouterEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
        let queue_id = self.queue.id().clone();
        info!("Task router for queue {} started", queue_id);

        while let Some(event) = events.recv().await {
            if event == RouterEvent::Shutdown {
                break;
            }
            let span = info_span!("task_router", queue_id = %queue_id);
            let handled = AssertUnwindSafe(self.handle_event(event.clone()).instrument(span))
                .catch_unwind()
                .await;
            match handled {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Queue {} failed to handle {:?} (task {:?}): {}",
                        queue_id,
                        event,
                        event.task_id(),
                        e
                    );
                }
                Err(_) => {
                    error!("Queue {} panicked while handling {:?}", queue_id, event);
                }
            }
        }

        info!("Task router for queue {} stopped", queue_id);
    }

    /// Handle one event: bookkeeping first, then matching
    pub async fn handle_event(&self, event: RouterEvent) -> Result<()> {
        let bookkeeping = match &event {
            RouterEvent::NewTask(task_id) => self.on_new_task(task_id).await,
            RouterEvent::Timer(task_id, generation) => self.on_timer(task_id, *generation).await,
            RouterEvent::TaskRemoved(task_id) => {
                self.on_task_removed(task_id);
                Ok(())
            }
            RouterEvent::AgentAvailable(agent_id) => {
                debug!("Agent {} may be available", agent_id);
                Ok(())
            }
            RouterEvent::QueueUpdated => self.on_queue_updated().await,
            RouterEvent::Shutdown => return Ok(()),
        };

        let matching = if self.config.router.routing_enabled {
            self.match_pending().await
        } else {
            Ok(0)
        };

        bookkeeping.and(matching.map(|_| ()))
    }

    // ---- bookkeeping -------------------------------------------------------

    async fn on_new_task(&self, task_id: &TaskId) -> Result<()> {
        let skipped = {
            let mut inner = self.queue.lock();
            if !inner.contains_task(task_id) {
                debug!("Task {} left queue {} before it was seen", task_id, self.queue.id());
                return Ok(());
            }
            self.bus.subscribe_task(task_id.clone(), self.queue.id().clone());
            let Some(plan) = inner.plan_escalation(task_id) else {
                return Ok(());
            };
            self.arm(task_id, &plan);
            let started_at = inner.get_task(task_id).map(|t| t.step_started_at);
            plan.skipped_from.zip(started_at).map(|(from, at)| (from, plan.step_index, at))
        };

        if let Some((from, to, started_at)) = skipped {
            self.record_escalation(task_id, from, to, started_at).await?;
        }
        Ok(())
    }

    async fn on_timer(&self, task_id: &TaskId, generation: u64) -> Result<()> {
        if !self.timers.take_fired(task_id, generation) {
            debug!("Ignoring stale timer for task {} in queue {}", task_id, self.queue.id());
            return Ok(());
        }
        let escalated = {
            let mut inner = self.queue.lock();
            let Some(advance) = inner.advance_step(self.queue.id(), task_id) else {
                debug!("Timer for task {} which is no longer queued", task_id);
                return Ok(());
            };
            let Some(plan) = inner.plan_escalation(task_id) else {
                return Ok(());
            };
            self.arm(task_id, &plan);
            if plan.step_index == advance.from {
                None
            } else {
                inner
                    .get_task(task_id)
                    .map(|t| (advance.from, plan.step_index, t.step_started_at))
            }
        };

        if let Some((from, to, started_at)) = escalated {
            self.record_escalation(task_id, from, to, started_at).await?;
        }
        Ok(())
    }

    /// Re-plan every task this router has seen after the steps changed
    ///
    /// A task on what used to be the last step has no timer; once a step is
    /// appended behind it, it needs one.
    async fn on_queue_updated(&self) -> Result<()> {
        let skipped = {
            let mut inner = self.queue.lock();
            let mut skipped = Vec::new();
            for task_id in inner.task_ids() {
                if !self.bus.is_subscribed(&task_id) {
                    continue;
                }
                let Some(plan) = inner.plan_escalation(&task_id) else {
                    continue;
                };
                self.arm(&task_id, &plan);
                if let (Some(from), Some(task)) = (plan.skipped_from, inner.get_task(&task_id)) {
                    skipped.push((task_id, from, plan.step_index, task.step_started_at));
                }
            }
            skipped
        };

        let mut result = Ok(());
        for (task_id, from, to, started_at) in skipped {
            if let Err(e) = self.record_escalation(&task_id, from, to, started_at).await {
                result = Err(e);
            }
        }
        result
    }

    fn on_task_removed(&self, task_id: &TaskId) {
        self.bus.unsubscribe_task(task_id);
        self.timers.cancel(task_id);
    }

    /// Arm or clear the task's timer according to `plan`
    fn arm(&self, task_id: &TaskId, plan: &EscalationPlan) {
        match plan.remaining_secs {
            Some(remaining) => {
                let floor = self.config.timers.min_escalation_secs as i64;
                let delay = remaining.max(floor).max(0) as u64;
                self.timers.arm(task_id.clone(), Duration::from_secs(delay));
            }
            None => {
                self.timers.cancel(task_id);
            }
        }
    }

    async fn record_escalation(
        &self,
        task_id: &TaskId,
        from: usize,
        to: usize,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        info!("Task {} in queue {} escalated from step {} to {}", task_id, self.queue.id(), from, to);
        let persisted = match &self.repository {
            Some(repository) => repository.update_step(task_id, to, started_at).await,
            None => Ok(()),
        };
        self.bus.emit(RoutingOutcome::Escalated {
            queue_id: self.queue.id().clone(),
            task_id: task_id.clone(),
            from_step: from,
            to_step: to,
        });
        persisted
    }

    // ---- matching ----------------------------------------------------------

    /// Match heads until one cannot be matched or the per-event bound is hit
    ///
    /// Returns the number of committed reservations.
    pub async fn match_pending(&self) -> Result<usize> {
        let mut committed = 0;
        for _ in 0..self.config.router.max_matches_per_event {
            if !self.try_match_head().await? {
                break;
            }
            committed += 1;
        }
        Ok(committed)
    }

    /// One match attempt on the current head
    ///
    /// Returns true when the head left the queue (reserved, or removed while
    /// the gateway was deciding) and the next head is worth trying.
    async fn try_match_head(&self) -> Result<bool> {
        let Some(snapshot) = self.queue.matching_snapshot() else {
            return Ok(false);
        };
        let task = snapshot.task;

        let Some((agent, step_index)) = self.reserve_candidate(&task, &snapshot.steps) else {
            debug!(
                "No agent for task {} in queue {} at step {}",
                task.task_id,
                self.queue.id(),
                task.step_index
            );
            return Ok(false);
        };

        let decision = AssertUnwindSafe(self.gateway.try_reserve(&task, agent.id()))
            .catch_unwind()
            .await;
        match decision {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                self.abandon(&task, &agent, "declined by reservation gateway".to_string());
                return Ok(false);
            }
            Ok(Err(e)) => {
                self.abandon(&task, &agent, e.to_string());
                return Ok(false);
            }
            Err(_) => {
                self.abandon(&task, &agent, "reservation gateway panicked".to_string());
                return Ok(false);
            }
        }

        self.commit(task, agent, step_index).await
    }

    /// Pick and reserve the best available agent for `task`
    ///
    /// Steps are scanned in order and the first step yielding an agent wins.
    /// Within a step, available agents are ordered by their active queue task
    /// count; the stable sort keeps the selection-criterion order on ties.
    fn reserve_candidate(&self, task: &QueuedTask, steps: &[Arc<Step>]) -> Option<(Arc<Agent>, usize)> {
        let domain = self.queue.media_domain();

        if self.config.router.assign_to_last_agent {
            if let Some(found) = self.reserve_last_agent(task, steps) {
                return Some(found);
            }
        }

        for (step_index, step) in steps.iter().enumerate() {
            let mut candidates: Vec<Arc<Agent>> = step
                .ordered_agents(self.queue.criterion(), domain, &self.agents)
                .into_iter()
                .filter(|agent| agent.is_available_for_reservation(domain))
                .collect();
            candidates.sort_by_key(|agent| agent.no_of_active_queue_tasks(domain));

            for agent in candidates {
                if agent.reserve_task(ReservedTask::new(task.clone(), step_index)) {
                    debug!(
                        "Reserved agent {} for task {} at step {}",
                        agent.id(),
                        task.task_id,
                        step_index
                    );
                    return Some((agent, step_index));
                }
                debug!("Agent {} was reserved concurrently, trying next", agent.id());
            }
        }
        None
    }

    fn reserve_last_agent(&self, task: &QueuedTask, steps: &[Arc<Step>]) -> Option<(Arc<Agent>, usize)> {
        let last = task.last_assigned_agent.as_ref()?;
        let step_index = steps.iter().position(|step| step.contains(last))?;
        let agent = self.agents.get(last)?;
        if agent.is_available_for_reservation(self.queue.media_domain())
            && agent.reserve_task(ReservedTask::new(task.clone(), step_index))
        {
            debug!("Task {} goes back to last agent {}", task.task_id, last);
            return Some((agent, step_index));
        }
        None
    }

    /// Release an agent after the gateway refused; the task stays queued
    fn abandon(&self, task: &QueuedTask, agent: &Agent, reason: String) {
        agent.remove_reserved_task_if(&task.task_id);
        warn!(
            "Reservation of task {} in queue {} for agent {} failed: {}",
            task.task_id,
            self.queue.id(),
            agent.id(),
            reason
        );
        self.bus.emit(RoutingOutcome::ReservationFailed {
            queue_id: self.queue.id().clone(),
            task_id: task.task_id.clone(),
            agent_id: agent.id().clone(),
            reason,
        });
    }

    /// Dequeue the reserved task, re-validating it by identity
    ///
    /// The task leaves the queue only while it is still the queued instance
    /// the match was made for and the agent's slot still holds it. Returns
    /// false when the reservation was released while the gateway was
    /// deciding; the task then stays queued.
    async fn commit(&self, task: QueuedTask, agent: Arc<Agent>, step_index: usize) -> Result<bool> {
        let committed = {
            let mut inner = self.queue.lock();
            match inner.get_task(&task.task_id).filter(|current| current.id == task.id) {
                None => Commit::TaskGone,
                Some(current) => {
                    let mut routed = current.clone();
                    routed.assigned_to = Some(agent.id().clone());
                    if agent.refresh_reservation(ReservedTask::new(routed.clone(), step_index)) {
                        inner.remove_task(&task.task_id);
                        self.timers.cancel(&task.task_id);
                        Commit::Done(routed)
                    } else {
                        Commit::SlotReleased
                    }
                }
            }
        };

        let routed = match committed {
            Commit::Done(routed) => routed,
            Commit::TaskGone => {
                agent.remove_reserved_task_if(&task.task_id);
                debug!(
                    "Task {} left queue {} while its reservation was pending",
                    task.task_id,
                    self.queue.id()
                );
                return Ok(true);
            }
            Commit::SlotReleased => {
                debug!(
                    "Agent {} released task {} while its reservation was pending; task stays queued",
                    agent.id(),
                    task.task_id
                );
                return Ok(false);
            }
        };

        self.bus.unsubscribe_task(&routed.task_id);

        info!(
            "Task {} in queue {} reserved for agent {} at step {}",
            routed.task_id,
            self.queue.id(),
            agent.id(),
            step_index
        );

        if let Some(repository) = &self.repository {
            if let Err(e) = repository.remove(&routed.task_id).await {
                warn!("Reserved task {} not removed from repository: {}", routed.task_id, e);
            }
        }

        self.bus.emit(RoutingOutcome::Reserved {
            queue_id: self.queue.id().clone(),
            task: routed,
            agent_id: agent.id().clone(),
            step_index,
        });
        Ok(true)
    }
}

/// Result of the commit critical section
enum Commit {
    Done(QueuedTask),
    TaskGone,
    SlotReleased,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_STEPS_PER_QUEUE;
    use crate::expression::{AttributeValue, Expression, RelationalOperator, Term};
    use crate::queue::{QueueDefinition, StepDefinition};
    use crate::routing::LocalReservationGateway;

    /// Router over a queue whose step 0 needs "sales" for 10s
    fn router() -> (TaskRouter, mpsc::UnboundedReceiver<RouterEvent>) {
        let agents = Arc::new(AgentRegistry::new());
        let sales = Expression::new(vec![Term::new(
            "sales",
            RelationalOperator::Eq,
            AttributeValue::Bool(true),
        )]);
        let definition = QueueDefinition::new("sales", "Sales", "chat")
            .with_step(StepDefinition::new(vec![sales], 10))
            .with_step(StepDefinition::new(Vec::new(), 0));
        let queue = Arc::new(PrecisionQueue::new(&definition, MAX_STEPS_PER_QUEUE, 30, &agents).unwrap());

        let bus = Arc::new(EventBus::new());
        let events = bus.register_router(queue.id().clone());
        let timers = Arc::new(EscalationTimers::new(bus.clone()));
        timers.spawn_driver();

        let router = TaskRouter::new(
            queue,
            agents,
            bus,
            timers,
            Arc::new(LocalReservationGateway),
            None,
            Arc::new(RoutingEngineConfig::default()),
        );
        (router, events)
    }

    /// Queue a task and wait for its step-0 timer to fire
    async fn queue_until_timer(
        router: &TaskRouter,
        events: &mut mpsc::UnboundedReceiver<RouterEvent>,
        id: &str,
    ) -> (TaskId, u64) {
        let queue = router.queue();
        let task = QueuedTask::new(id, "conv", queue.id().clone(), queue.media_domain().clone(), 1);
        assert!(queue.enqueue(task));
        let task_id = TaskId::from(id);
        router.handle_event(RouterEvent::NewTask(task_id.clone())).await.unwrap();

        match events.recv().await {
            Some(RouterEvent::Timer(fired, generation)) if fired == task_id => (task_id, generation),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_advances_one_step() {
        let (router, mut events) = router();
        let (task_id, generation) = queue_until_timer(&router, &mut events, "t").await;

        router.handle_event(RouterEvent::Timer(task_id.clone(), generation)).await.unwrap();
        assert_eq!(router.queue().get_task(&task_id).unwrap().step_index, 1);
        assert!(!router.timers.is_armed(&task_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_queued_before_requeue_is_ignored() {
        let (router, mut events) = router();
        let (task_id, generation) = queue_until_timer(&router, &mut events, "t").await;

        // routed and put back under the same id before the timer event is handled
        let routed = router.queue().remove_task(&task_id).unwrap();
        router.timers.cancel(&task_id);
        assert!(router.queue().enqueue(routed));
        router.handle_event(RouterEvent::NewTask(task_id.clone())).await.unwrap();

        router.handle_event(RouterEvent::Timer(task_id.clone(), generation)).await.unwrap();
        assert_eq!(router.queue().get_task(&task_id).unwrap().step_index, 0);
        assert!(router.timers.is_armed(&task_id));
    }

}
