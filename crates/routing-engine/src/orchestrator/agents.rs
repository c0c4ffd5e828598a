//! # Agent Operations
//!
//! Pushes agent directory changes into the steps that reference each agent,
//! and turns every change that can make an agent available into an
//! `AgentAvailable` event for the routers of those queues.
//!
//! Reservations end in one of three ways:
//!
//! - **accepted**: the slot is cleared and the task becomes an active queue
//!   task of the agent,
//! - **revoked** or **timed out**: the slot is cleared and the task goes back
//!   to its queue at the step it had reached, keeping its original arrival
//!   time.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::core::RoutingEngine;
use crate::agent::{
    ActiveTask, Agent, AgentId, AgentState, MediaDomainId, MediaDomainState, ReservedTask, TaskMode,
};
use crate::error::{Result, RoutingError};
use crate::expression::AttributeSet;
use crate::queue::{QueuedTask, TaskId};
use crate::routing::RouterEvent;

/// How a reservation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationRelease {
    /// The agent took the task
    Accepted,
    /// The offer was withdrawn
    Revoked,
    /// The agent did not answer in time
    TimedOut,
}

impl RoutingEngine {
    /// Register an agent and add it to every step it satisfies
    pub async fn register_agent(&self, agent: Agent) -> Result<Arc<Agent>> {
        let agent = self.agents.register(agent)?;
        for queue in self.queue_list() {
            queue.on_agent_inserted(&agent);
        }
        self.notify_agent_available(agent.id());
        Ok(agent)
    }

    /// Replace an agent's routing attributes and re-evaluate every step
    pub async fn update_agent_attributes(&self, agent_id: &AgentId, attributes: AttributeSet) -> Result<()> {
        let agent = self.agents.require(agent_id)?;
        agent.set_attributes(attributes);
        for queue in self.queue_list() {
            queue.on_agent_updated(&agent);
        }
        debug!("Re-evaluated steps for agent {}", agent_id);
        self.notify_agent_available(agent_id);
        Ok(())
    }

    /// Remove an agent from the directory and every step
    ///
    /// A task the agent held reserved is put back in its queue and returned.
    pub async fn remove_agent(&self, agent_id: &AgentId) -> Result<Option<QueuedTask>> {
        let agent = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| RoutingError::not_found(format!("agent '{}' not found", agent_id)))?;
        for queue in self.queue_list() {
            queue.on_agent_removed(agent_id);
        }
        info!("Removed agent {}", agent_id);

        match agent.remove_reserved_task() {
            Some(reserved) => Ok(Some(self.requeue(reserved).await?)),
            None => Ok(None),
        }
    }

    pub async fn set_agent_state(&self, agent_id: &AgentId, state: AgentState) -> Result<()> {
        let agent = self.agents.require(agent_id)?;
        agent.set_state(state);
        if state == AgentState::Ready {
            self.notify_agent_available(agent_id);
        }
        Ok(())
    }

    pub async fn set_media_domain_state(
        &self,
        agent_id: &AgentId,
        domain: MediaDomainId,
        state: MediaDomainState,
    ) -> Result<()> {
        let agent = self.agents.require(agent_id)?;
        agent.set_media_domain_state(domain, state);
        if state.accepts_work() {
            self.notify_agent_available(agent_id);
        }
        Ok(())
    }

    pub async fn set_non_interruptible(&self, agent_id: &AgentId, non_interruptible: bool) -> Result<()> {
        let agent = self.agents.require(agent_id)?;
        agent.set_non_interruptible(non_interruptible);
        if !non_interruptible {
            self.notify_agent_available(agent_id);
        }
        Ok(())
    }

    /// Record a task delivered to the agent outside precision routing
    pub async fn add_active_task(&self, agent_id: &AgentId, domain: MediaDomainId, task: ActiveTask) -> Result<()> {
        let agent = self.agents.require(agent_id)?;
        agent.add_active_task(domain, task);
        Ok(())
    }

    /// Finish one of the agent's active tasks
    pub async fn remove_active_task(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<Option<ActiveTask>> {
        let agent = self.agents.require(agent_id)?;
        let removed = agent.remove_task(task_id);
        if removed.is_some() {
            self.notify_agent_available(agent_id);
        }
        Ok(removed)
    }

    /// End the agent's current reservation
    ///
    /// Returns the reservation that was cleared.
    pub async fn release_reservation(&self, agent_id: &AgentId, release: ReservationRelease) -> Result<ReservedTask> {
        let agent = self.agents.require(agent_id)?;
        let reserved = agent.remove_reserved_task().ok_or_else(|| {
            RoutingError::not_found(format!("agent '{}' holds no reservation", agent_id))
        })?;

        match release {
            ReservationRelease::Accepted => {
                agent.add_active_task(
                    reserved.task.media_domain.clone(),
                    ActiveTask::new(reserved.task_id().clone(), TaskMode::Queue),
                );
                info!("Agent {} accepted task {}", agent_id, reserved.task_id());
            }
            ReservationRelease::Revoked | ReservationRelease::TimedOut => {
                info!(
                    "Reservation of task {} for agent {} ended ({:?}), requeueing",
                    reserved.task_id(),
                    agent_id,
                    release
                );
                self.requeue(reserved.clone()).await?;
            }
        }

        self.notify_agent_available(agent_id);
        Ok(reserved)
    }

    pub async fn accept_reservation(&self, agent_id: &AgentId) -> Result<ReservedTask> {
        self.release_reservation(agent_id, ReservationRelease::Accepted).await
    }

    pub async fn revoke_reservation(&self, agent_id: &AgentId) -> Result<ReservedTask> {
        self.release_reservation(agent_id, ReservationRelease::Revoked).await
    }

    /// Put a reserved task back in its queue (RESERVED -> QUEUED)
    async fn requeue(&self, reserved: ReservedTask) -> Result<QueuedTask> {
        let mut task = reserved.task;
        task.assigned_to = None;
        task.step_started_at = Utc::now();
        let queue = self.require_queue(&task.queue_id)?;

        if !queue.enqueue(task.clone()) {
            // released before the router dequeued it: the task never left
            if let Some(queued) = queue.get_task(&task.task_id).filter(|queued| queued.id == task.id) {
                debug!("Task {} still queued in {}", task.task_id, task.queue_id);
                return Ok(queued);
            }
            return Err(RoutingError::already_exists(format!(
                "task '{}' was admitted to queue {} again and cannot be requeued",
                task.task_id, task.queue_id
            )));
        }
        self.persist_queued(&queue, &task).await?;
        self.bus
            .publish_to_queue(&task.queue_id, RouterEvent::NewTask(task.task_id.clone()))?;
        Ok(task)
    }

    /// Tell the routers of every queue listing the agent that it may take
    /// work
    pub fn notify_agent_available(&self, agent_id: &AgentId) {
        let Some(agent) = self.agents.get(agent_id) else {
            return;
        };
        for queue in self.queue_list() {
            if !agent.is_available_for_reservation(queue.media_domain()) || !queue.references_agent(agent_id) {
                continue;
            }
            if let Err(e) = self
                .bus
                .publish_to_queue(queue.id(), RouterEvent::AgentAvailable(agent_id.clone()))
            {
                warn!("Availability of agent {} not delivered to queue {}: {}", agent_id, queue.id(), e);
            }
        }
    }
}
