//! Task admission, cancellation and restore

use tracing::{debug, info, warn};

use super::core::RoutingEngine;
use crate::agent::AgentId;
use crate::error::{Result, RoutingError};
use crate::queue::{PrecisionQueue, QueueId, QueueStats, QueuedTask, TaskId};
use crate::routing::{RouterEvent, RoutingOutcome};

/// A task to be routed through a precision queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub conversation_id: String,
    pub queue_id: QueueId,
    /// Higher values are served first
    pub priority: u32,
    pub last_assigned_agent: Option<AgentId>,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<TaskId>, conversation_id: impl Into<String>, queue_id: impl Into<QueueId>) -> Self {
        Self {
            task_id: task_id.into(),
            conversation_id: conversation_id.into(),
            queue_id: queue_id.into(),
            priority: 0,
            last_assigned_agent: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_last_assigned_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.last_assigned_agent = Some(agent_id.into());
        self
    }
}

impl RoutingEngine {
    /// Queue a task at step 0 of its queue
    ///
    /// Returns `Ok(false)` without side effects when a task with the same id
    /// is already queued there. If the repository rejects the task it is
    /// taken back out of the queue and the error returned.
    pub async fn admit_task(&self, request: TaskRequest) -> Result<bool> {
        let queue = self.require_queue(&request.queue_id)?;
        let mut task = QueuedTask::new(
            request.task_id,
            request.conversation_id,
            request.queue_id,
            queue.media_domain().clone(),
            request.priority,
        );
        task.last_assigned_agent = request.last_assigned_agent;

        if !queue.enqueue(task.clone()) {
            debug!("Task {} already queued in {}", task.task_id, task.queue_id);
            return Ok(false);
        }

        self.persist_queued(&queue, &task).await?;

        if let Err(e) = self
            .bus
            .publish_to_queue(&task.queue_id, RouterEvent::NewTask(task.task_id.clone()))
        {
            queue.remove_instance(&task);
            self.forget_persisted(&task).await;
            return Err(e);
        }

        info!(
            "Admitted task {} to queue {} with priority {}",
            task.task_id, task.queue_id, task.priority
        );
        Ok(true)
    }

    /// Save a task that was just queued
    ///
    /// The task is visible to its router from the moment it is queued, so it
    /// may be routed or cancelled while the save is in flight. A row written
    /// for a task that is no longer queued is deleted again; a failed save
    /// takes the task back out of the queue.
    pub(super) async fn persist_queued(&self, queue: &PrecisionQueue, task: &QueuedTask) -> Result<()> {
        let Some(repository) = &self.repository else {
            return Ok(());
        };
        if let Err(e) = repository.save(task).await {
            queue.remove_instance(task);
            return Err(e);
        }
        if queue.get_task(&task.task_id).is_none() {
            debug!("Task {} left queue {} while being saved", task.task_id, task.queue_id);
            repository.remove(&task.task_id).await?;
        }
        Ok(())
    }

    /// Remove a queued task; cancelling a task that is not queued is a no-op
    pub async fn cancel_task(&self, queue_id: &QueueId, task_id: &TaskId) -> Result<bool> {
        let queue = self.require_queue(queue_id)?;
        let removed = {
            let mut inner = queue.lock();
            let removed = inner.remove_task(task_id);
            if removed.is_some() {
                self.timers.cancel(task_id);
            }
            removed
        };

        let Some(task) = removed else {
            debug!("Cancel of task {} in queue {}: not queued", task_id, queue_id);
            return Ok(false);
        };

        self.retire(&task).await;
        info!("Cancelled task {} in queue {}", task_id, queue_id);
        Ok(true)
    }

    /// Remove every queued task of a queue
    pub async fn flush_queue(&self, queue_id: &QueueId) -> Result<Vec<QueuedTask>> {
        let queue = self.require_queue(queue_id)?;
        let flushed = {
            let mut inner = queue.lock();
            let flushed = inner.drain();
            for task in &flushed {
                self.timers.cancel(&task.task_id);
            }
            flushed
        };

        for task in &flushed {
            self.retire(task).await;
        }
        info!("Flushed {} tasks from queue {}", flushed.len(), queue_id);
        Ok(flushed)
    }

    /// Bookkeeping after a task left its queue unrouted
    async fn retire(&self, task: &QueuedTask) {
        self.forget_persisted(task).await;
        self.bus.emit(RoutingOutcome::Removed {
            queue_id: task.queue_id.clone(),
            task_id: task.task_id.clone(),
        });
        if let Err(e) = self
            .bus
            .publish_to_queue(&task.queue_id, RouterEvent::TaskRemoved(task.task_id.clone()))
        {
            // no router means no subscription left to drop
            self.bus.unsubscribe_task(&task.task_id);
            debug!("Removal of task {} not delivered: {}", task.task_id, e);
        }
    }

    /// Re-enqueue every persisted task after a restart
    ///
    /// Tasks keep their arrival time and step; their timers are re-armed with
    /// whatever is left of the current step's timeout. Tasks of queues that
    /// no longer exist are skipped. Returns the number of restored tasks.
    pub async fn restore_from_repository(&self) -> Result<usize> {
        let Some(repository) = &self.repository else {
            return Err(RoutingError::configuration("engine has no task repository"));
        };

        let mut restored = 0;
        for task in repository.load_all().await? {
            let Some(queue) = self.queue(&task.queue_id) else {
                warn!("Skipping persisted task {}: queue {} unknown", task.task_id, task.queue_id);
                continue;
            };
            if !queue.enqueue(task.clone()) {
                continue;
            }
            self.bus
                .publish_to_queue(&task.queue_id, RouterEvent::NewTask(task.task_id.clone()))?;
            restored += 1;
        }

        info!("Restored {} tasks from repository", restored);
        Ok(restored)
    }

    pub fn queue_stats(&self, queue_id: &QueueId) -> Result<QueueStats> {
        Ok(self.require_queue(queue_id)?.stats())
    }

    /// Snapshot of a queued task
    pub fn queued_task(&self, queue_id: &QueueId, task_id: &TaskId) -> Option<QueuedTask> {
        self.queue(queue_id)?.get_task(task_id)
    }
}
