//! Reservation gateway seam
//!
//! The gateway is the authority on whether a matched agent may actually be
//! offered a task (an offer delivered to the agent's client, a remote
//! capacity check). It is the only point where a router suspends, and no
//! queue or step lock is held across the call.

use async_trait::async_trait;
use tracing::debug;

use crate::agent::AgentId;
use crate::error::Result;
use crate::queue::QueuedTask;

/// External reservation authority
///
/// `Ok(true)` commits the match. `Ok(false)` and `Err(_)` both leave the task
/// queued; it is retried on the next event for the queue.
#[async_trait]
pub trait ReservationGateway: Send + Sync {
    async fn try_reserve(&self, task: &QueuedTask, agent_id: &AgentId) -> Result<bool>;
}

/// Gateway that accepts every reservation
#[derive(Debug, Default, Clone)]
pub struct LocalReservationGateway;

#[async_trait]
impl ReservationGateway for LocalReservationGateway {
    async fn try_reserve(&self, task: &QueuedTask, agent_id: &AgentId) -> Result<bool> {
        debug!("Local reservation of task {} for agent {}", task.task_id, agent_id);
        Ok(true)
    }
}
