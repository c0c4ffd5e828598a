//! Core routing engine
//!
//! [`RoutingEngine`] owns the queue registry, the agent registry, the event
//! bus, the shared escalation timers and one [`TaskRouter`] per queue. Agent
//! and task operations live in the sibling `agents` and `tasks` modules as
//! further `impl RoutingEngine` blocks.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::AgentRegistry;
use crate::config::RoutingEngineConfig;
use crate::database::TaskRepository;
use crate::error::{Result, RoutingError};
use crate::queue::{PrecisionQueue, QueueDefinition, QueueId, QueuedTask, StepDefinition, StepId};
use crate::routing::{
    EventBus, LocalReservationGateway, ReservationGateway, RouterEvent, RoutingOutcome, TaskRouter,
};
use crate::timer::EscalationTimers;

/// Precision-queue routing engine
///
/// # Examples
///
/// ```
/// use rvoip_routing_engine::prelude::*;
///
/// # async fn example() -> rvoip_routing_engine::Result<()> {
/// let engine = RoutingEngine::new(RoutingEngineConfig::default())?;
///
/// let sales = QueueDefinition::new("sales", "Sales", "chat")
///     .with_step(StepDefinition::new(Vec::new(), 30));
/// engine.create_queue(sales).await?;
///
/// engine.admit_task(TaskRequest::new("task-1", "conv-1", "sales")).await?;
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RoutingEngine {
    pub(super) config: Arc<RoutingEngineConfig>,
    pub(super) queues: DashMap<QueueId, Arc<PrecisionQueue>>,
    pub(super) routers: DashMap<QueueId, JoinHandle<()>>,
    pub(super) agents: Arc<AgentRegistry>,
    pub(super) bus: Arc<EventBus>,
    pub(super) timers: Arc<EscalationTimers>,
    pub(super) timer_driver: Mutex<Option<JoinHandle<()>>>,
    pub(super) gateway: Arc<dyn ReservationGateway>,
    pub(super) repository: Option<Arc<dyn TaskRepository>>,
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("queues", &self.queues.len())
            .field("agents", &self.agents.len())
            .field("armed_timers", &self.timers.armed_count())
            .field("persistent", &self.repository.is_some())
            .finish()
    }
}

/// Builder for [`RoutingEngine`]
pub struct RoutingEngineBuilder {
    config: RoutingEngineConfig,
    gateway: Arc<dyn ReservationGateway>,
    repository: Option<Arc<dyn TaskRepository>>,
}

impl Default for RoutingEngineBuilder {
    fn default() -> Self {
        Self {
            config: RoutingEngineConfig::default(),
            gateway: Arc::new(LocalReservationGateway),
            repository: None,
        }
    }
}

impl RoutingEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RoutingEngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ReservationGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Validate the configuration and start the timer driver
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<RoutingEngine> {
        self.config.validate()?;

        let bus = Arc::new(EventBus::new());
        let timers = Arc::new(EscalationTimers::new(bus.clone()));
        let driver = timers.spawn_driver();

        info!(
            "Routing engine started (routing_enabled={}, persistent={})",
            self.config.router.routing_enabled,
            self.repository.is_some()
        );

        Ok(RoutingEngine {
            config: Arc::new(self.config),
            queues: DashMap::new(),
            routers: DashMap::new(),
            agents: Arc::new(AgentRegistry::new()),
            bus,
            timers,
            timer_driver: Mutex::new(Some(driver)),
            gateway: self.gateway,
            repository: self.repository,
        })
    }
}

impl RoutingEngine {
    /// Engine with the local gateway and no repository
    pub fn new(config: RoutingEngineConfig) -> Result<Self> {
        RoutingEngineBuilder::new().with_config(config).build()
    }

    pub fn builder() -> RoutingEngineBuilder {
        RoutingEngineBuilder::new()
    }

    pub fn config(&self) -> &RoutingEngineConfig {
        &self.config
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn timers(&self) -> &Arc<EscalationTimers> {
        &self.timers
    }

    /// Subscribe to routing outcomes
    pub fn outcomes(&self) -> broadcast::Receiver<RoutingOutcome> {
        self.bus.outcomes()
    }

    pub fn queue(&self, queue_id: &QueueId) -> Option<Arc<PrecisionQueue>> {
        self.queues.get(queue_id).map(|entry| entry.value().clone())
    }

    pub(super) fn require_queue(&self, queue_id: &QueueId) -> Result<Arc<PrecisionQueue>> {
        self.queue(queue_id)
            .ok_or_else(|| RoutingError::not_found(format!("queue '{}' not found", queue_id)))
    }

    pub(super) fn queue_list(&self) -> Vec<Arc<PrecisionQueue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn queue_ids(&self) -> Vec<QueueId> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    // ---- queue configuration ----------------------------------------------

    /// Create a queue and start its router
    pub async fn create_queue(&self, definition: QueueDefinition) -> Result<Arc<PrecisionQueue>> {
        let queue = match self.queues.entry(definition.id.clone()) {
            Entry::Occupied(_) => {
                return Err(RoutingError::already_exists(format!(
                    "queue '{}' already exists",
                    definition.id
                )));
            }
            Entry::Vacant(slot) => {
                let queue = Arc::new(PrecisionQueue::new(
                    &definition,
                    self.config.queues.max_steps_per_queue,
                    self.config.queues.default_service_level_threshold_secs,
                    &self.agents,
                )?);
                slot.insert(queue.clone());
                queue
            }
        };

        let events = self.bus.register_router(queue.id().clone());
        let router = TaskRouter::new(
            queue.clone(),
            self.agents.clone(),
            self.bus.clone(),
            self.timers.clone(),
            self.gateway.clone(),
            self.repository.clone(),
            self.config.clone(),
        );
        self.routers.insert(queue.id().clone(), router.spawn(events));

        info!(
            "Created queue {} ({}) on {} with {} steps",
            queue.id(),
            queue.name(),
            queue.media_domain(),
            queue.step_count()
        );
        Ok(queue)
    }

    /// Delete a queue, stopping its router
    ///
    /// Tasks still queued are dropped from the repository and returned.
    pub async fn delete_queue(&self, queue_id: &QueueId) -> Result<Vec<QueuedTask>> {
        let (_, queue) = self
            .queues
            .remove(queue_id)
            .ok_or_else(|| RoutingError::not_found(format!("queue '{}' not found", queue_id)))?;

        let dropped = queue.drain();
        for task in &dropped {
            self.timers.cancel(&task.task_id);
            self.forget_persisted(task).await;
            self.bus.emit(RoutingOutcome::Removed {
                queue_id: queue_id.clone(),
                task_id: task.task_id.clone(),
            });
        }

        if let Err(e) = self.bus.publish_to_queue(queue_id, RouterEvent::Shutdown) {
            debug!("Router of queue {} already gone: {}", queue_id, e);
        }
        self.bus.unregister_router(queue_id);
        if let Some((_, handle)) = self.routers.remove(queue_id) {
            if let Err(e) = handle.await {
                warn!("Router of queue {} ended abnormally: {}", queue_id, e);
            }
        }

        info!("Deleted queue {} ({} tasks dropped)", queue_id, dropped.len());
        Ok(dropped)
    }

    pub async fn add_step(&self, queue_id: &QueueId, definition: StepDefinition) -> Result<StepId> {
        let queue = self.require_queue(queue_id)?;
        let step_id = queue.add_step(&definition, &self.agents)?;
        self.publish_queue_updated(queue_id);
        Ok(step_id)
    }

    pub async fn update_step(
        &self,
        queue_id: &QueueId,
        step_id: &StepId,
        definition: StepDefinition,
    ) -> Result<()> {
        let queue = self.require_queue(queue_id)?;
        queue.update_step(step_id, &definition, &self.agents)?;
        self.publish_queue_updated(queue_id);
        Ok(())
    }

    pub async fn delete_step(&self, queue_id: &QueueId, step_id: &StepId) -> Result<()> {
        let queue = self.require_queue(queue_id)?;
        queue.delete_step_by_id(step_id)?;
        self.publish_queue_updated(queue_id);
        Ok(())
    }

    fn publish_queue_updated(&self, queue_id: &QueueId) {
        if let Err(e) = self.bus.publish_to_queue(queue_id, RouterEvent::QueueUpdated) {
            warn!("Queue {} update not delivered: {}", queue_id, e);
        }
    }

    pub(super) async fn forget_persisted(&self, task: &QueuedTask) {
        if let Some(repository) = &self.repository {
            if let Err(e) = repository.remove(&task.task_id).await {
                warn!("Task {} not removed from repository: {}", task.task_id, e);
            }
        }
    }

    /// Stop every router and the timer driver
    ///
    /// Queued tasks stay in the repository so a later engine can restore
    /// them.
    pub async fn shutdown(&self) {
        let queue_ids = self.queue_ids();
        for queue_id in &queue_ids {
            let _ = self.bus.publish_to_queue(queue_id, RouterEvent::Shutdown);
        }
        for queue_id in &queue_ids {
            if let Some((_, handle)) = self.routers.remove(queue_id) {
                if let Err(e) = handle.await {
                    warn!("Router of queue {} ended abnormally: {}", queue_id, e);
                }
            }
            self.bus.unregister_router(queue_id);
        }

        self.timers.shutdown();
        let driver = self.timer_driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Timer driver ended abnormally: {}", e);
            }
        }
        info!("Routing engine stopped");
    }
}
