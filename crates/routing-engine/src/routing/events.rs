//! In-process event bus between the engine, the escalation timers and the
//! task routers
//!
//! Queue-scoped events go straight to the router registered for the queue.
//! Task-scoped events (timer expiry) are delivered through a per-task
//! subscription that the router takes when it first sees the task and drops
//! when the task leaves the queue, so a late timer for a removed task is
//! discarded at the bus.
//!
//! Each router has a single unbounded channel; events published for one task
//! therefore arrive in publish order. Nothing is ordered across queues.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::agent::AgentId;
use crate::error::{Result, RoutingError};
use crate::queue::{QueueId, QueuedTask, TaskId};

/// Capacity of the routing outcome broadcast channel
const OUTCOME_CHANNEL_CAPACITY: usize = 1024;

/// Event delivered to a task router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A task was admitted to the router's queue
    NewTask(TaskId),
    /// The task's escalation timer expired; carries the timer generation
    Timer(TaskId, u64),
    /// The task left the queue without being routed
    TaskRemoved(TaskId),
    /// An agent listed by one of the queue's steps may have become available
    AgentAvailable(AgentId),
    /// Steps of the queue changed
    QueueUpdated,
    /// Stop the router loop
    Shutdown,
}

impl RouterEvent {
    /// Task the event is about, if it is task-scoped
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            RouterEvent::NewTask(id) | RouterEvent::Timer(id, _) | RouterEvent::TaskRemoved(id) => Some(id),
            _ => None,
        }
    }
}

/// Observable result of routing work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutingOutcome {
    /// A task was reserved for an agent and left its queue
    Reserved {
        queue_id: QueueId,
        task: QueuedTask,
        agent_id: AgentId,
        step_index: usize,
    },
    /// A task moved to a wider step
    Escalated {
        queue_id: QueueId,
        task_id: TaskId,
        from_step: usize,
        to_step: usize,
    },
    /// A task left its queue without being routed
    Removed { queue_id: QueueId, task_id: TaskId },
    /// The reservation gateway refused or failed; the task stays queued
    ReservationFailed {
        queue_id: QueueId,
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },
}

/// Typed bus keyed by queue id and task id
#[derive(Debug)]
pub struct EventBus {
    routers: DashMap<QueueId, mpsc::UnboundedSender<RouterEvent>>,
    task_subscriptions: DashMap<TaskId, QueueId>,
    outcomes: broadcast::Sender<RoutingOutcome>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            routers: DashMap::new(),
            task_subscriptions: DashMap::new(),
            outcomes,
        }
    }

    /// Attach a router to a queue, returning its event receiver
    ///
    /// A router previously registered for the same queue is detached; its
    /// channel closes once the old sender is dropped.
    pub fn register_router(&self, queue_id: QueueId) -> mpsc::UnboundedReceiver<RouterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routers.insert(queue_id, tx);
        rx
    }

    pub fn unregister_router(&self, queue_id: &QueueId) -> bool {
        self.task_subscriptions.retain(|_, queue| *queue != *queue_id);
        self.routers.remove(queue_id).is_some()
    }

    pub fn has_router(&self, queue_id: &QueueId) -> bool {
        self.routers.contains_key(queue_id)
    }

    /// Deliver a queue-scoped event
    pub fn publish_to_queue(&self, queue_id: &QueueId, event: RouterEvent) -> Result<()> {
        let sender = self
            .routers
            .get(queue_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RoutingError::event_bus(format!("no router for queue '{}'", queue_id)))?;
        trace!("Publishing {:?} to queue {}", event, queue_id);
        sender
            .send(event)
            .map_err(|_| RoutingError::event_bus(format!("router for queue '{}' has stopped", queue_id)))
    }

    /// Route a task's events to `queue_id` until unsubscribed
    pub fn subscribe_task(&self, task_id: TaskId, queue_id: QueueId) {
        self.task_subscriptions.insert(task_id, queue_id);
    }

    /// Drop a task subscription; dropping a missing one is a no-op
    pub fn unsubscribe_task(&self, task_id: &TaskId) -> bool {
        self.task_subscriptions.remove(task_id).is_some()
    }

    pub fn is_subscribed(&self, task_id: &TaskId) -> bool {
        self.task_subscriptions.contains_key(task_id)
    }

    /// Queue a task is currently subscribed to
    pub fn subscribed_queue(&self, task_id: &TaskId) -> Option<QueueId> {
        self.task_subscriptions.get(task_id).map(|entry| entry.value().clone())
    }

    /// Deliver a task-scoped event to the subscribed router
    ///
    /// Returns false, without error, when nobody is subscribed to the task.
    pub fn publish_task_event(&self, task_id: &TaskId, event: RouterEvent) -> Result<bool> {
        let Some(queue_id) = self.subscribed_queue(task_id) else {
            debug!("Dropping {:?}: task {} has no subscriber", event, task_id);
            return Ok(false);
        };
        self.publish_to_queue(&queue_id, event)?;
        Ok(true)
    }

    /// Publish a routing outcome to observers
    pub fn emit(&self, outcome: RoutingOutcome) {
        // no receivers is fine
        let _ = self.outcomes.send(outcome);
    }

    pub fn outcomes(&self) -> broadcast::Receiver<RoutingOutcome> {
        self.outcomes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_events_follow_subscription() {
        let bus = EventBus::new();
        let queue = QueueId::from("sales");
        let mut rx = bus.register_router(queue.clone());
        let task = TaskId::from("t1");

        assert!(!bus.publish_task_event(&task, RouterEvent::Timer(task.clone(), 0)).unwrap());

        bus.subscribe_task(task.clone(), queue.clone());
        assert!(bus.publish_task_event(&task, RouterEvent::Timer(task.clone(), 0)).unwrap());
        assert_eq!(rx.recv().await, Some(RouterEvent::Timer(task.clone(), 0)));

        assert!(bus.unsubscribe_task(&task));
        assert!(!bus.unsubscribe_task(&task));
        assert!(!bus.publish_task_event(&task, RouterEvent::Timer(task.clone(), 0)).unwrap());
    }

    #[tokio::test]
    async fn test_publish_to_missing_router_fails() {
        let bus = EventBus::new();
        let result = bus.publish_to_queue(&QueueId::from("none"), RouterEvent::QueueUpdated);
        assert!(matches!(result, Err(RoutingError::EventBus(_))));

        let rx = bus.register_router(QueueId::from("gone"));
        drop(rx);
        let result = bus.publish_to_queue(&QueueId::from("gone"), RouterEvent::QueueUpdated);
        assert!(matches!(result, Err(RoutingError::EventBus(_))));
    }

    #[tokio::test]
    async fn test_outcomes_broadcast() {
        let bus = EventBus::new();
        let mut observer = bus.outcomes();
        bus.emit(RoutingOutcome::Removed {
            queue_id: QueueId::from("q"),
            task_id: TaskId::from("t"),
        });
        match observer.recv().await.unwrap() {
            RoutingOutcome::Removed { task_id, .. } => assert_eq!(task_id, TaskId::from("t")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_unregister_drops_task_subscriptions() {
        let bus = EventBus::new();
        let _rx = bus.register_router(QueueId::from("a"));
        bus.subscribe_task(TaskId::from("t"), QueueId::from("a"));
        bus.subscribe_task(TaskId::from("u"), QueueId::from("b"));
        assert!(bus.unregister_router(&QueueId::from("a")));
        assert!(!bus.is_subscribed(&TaskId::from("t")));
        assert!(bus.is_subscribed(&TaskId::from("u")));
    }
}
