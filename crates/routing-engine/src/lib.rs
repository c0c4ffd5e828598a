//! # rvoip-routing-engine
//!
//! Precision-queue task routing for contact centers.
//!
//! Incoming tasks (customer contacts on some media channel) are queued on a
//! [`PrecisionQueue`](queue::PrecisionQueue) and offered to the best
//! available agent under skill-based eligibility rules. Each queue has up to
//! ten ordered **steps**; a task starts at step 0 and may match agents of
//! every step up to its current one. When a step's timeout elapses without a
//! match the task escalates to the next, wider step.
//!
//! ## Architecture
//!
//! ```text
//!   admit_task ──► PrecisionQueue ◄── steps ◄── agent directory updates
//!                       │
//!        NEW_TASK / TIMER / TASK_REMOVED / AGENT_AVAILABLE
//!                       ▼
//!   EscalationTimers ─► EventBus ─► TaskRouter (one per queue)
//!                                      │ reserve_task (CAS)
//!                                      ▼
//!                               ReservationGateway ─► RoutingOutcome
//! ```
//!
//! There is no global scheduler. Matching relies on three synchronization
//! points: the per-queue lock around the service queue, the per-step lock
//! around each eligible-agent set, and the compare-and-set reservation slot of
//! each agent. The external reservation call is the only place a router
//! suspends, and no lock is held across it.
//!
//! ## Quick Start
//!
//! ```
//! use std::collections::HashMap;
//! use rvoip_routing_engine::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let engine = RoutingEngine::new(RoutingEngineConfig::default())?;
//! let mut outcomes = engine.outcomes();
//!
//! let sales_only = Expression::new(vec![Term::new(
//!     "sales",
//!     RelationalOperator::Eq,
//!     AttributeValue::Bool(true),
//! )]);
//! engine
//!     .create_queue(
//!         QueueDefinition::new("sales", "Sales", "chat")
//!             .with_step(StepDefinition::new(vec![sales_only], 30))
//!             .with_step(StepDefinition::new(Vec::new(), 0)),
//!     )
//!     .await?;
//!
//! let mut attributes: AttributeSet = HashMap::new();
//! attributes.insert("sales".into(), AttributeValue::Bool(true));
//! let alice = AgentId::from("alice");
//! engine.register_agent(Agent::new("alice", "Alice", attributes)).await?;
//! engine.set_agent_state(&alice, AgentState::Ready).await?;
//! engine
//!     .set_media_domain_state(&alice, "chat".into(), MediaDomainState::Ready)
//!     .await?;
//!
//! engine.admit_task(TaskRequest::new("task-1", "conv-1", "sales")).await?;
//!
//! if let Ok(RoutingOutcome::Reserved { agent_id, .. }) = outcomes.recv().await {
//!     assert_eq!(agent_id, alice);
//!     engine.accept_reservation(&agent_id).await?;
//! }
//! engine.shutdown().await;
//! # Ok::<(), RoutingError>(())
//! # }).unwrap();
//! ```

pub mod agent;
pub mod config;
pub mod database;
pub mod error;
pub mod expression;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod routing;
pub mod timer;

pub use config::RoutingEngineConfig;
pub use error::{Result, RoutingError};
pub use orchestrator::{ReservationRelease, RoutingEngine, RoutingEngineBuilder, TaskRequest};

/// Commonly used types
pub mod prelude {
    pub use crate::agent::{
        ActiveTask, Agent, AgentId, AgentState, MediaDomainId, MediaDomainState, ReservedTask,
        TaskMode,
    };
    pub use crate::config::RoutingEngineConfig;
    pub use crate::database::{InMemoryTaskRepository, SqliteTaskRepository, TaskRepository};
    pub use crate::error::{Result, RoutingError};
    pub use crate::expression::{
        AttributeSet, AttributeValue, BooleanJoin, Expression, RelationalOperator, Term,
    };
    pub use crate::logging::{setup_logging, LoggingConfig};
    pub use crate::orchestrator::{ReservationRelease, RoutingEngine, RoutingEngineBuilder, TaskRequest};
    pub use crate::queue::{
        PrecisionQueue, QueueDefinition, QueueId, QueueStats, QueuedTask, SelectionCriterion,
        ServiceLevel, ServiceQueue, Step, StepDefinition, StepId, TaskId,
    };
    pub use crate::routing::{LocalReservationGateway, ReservationGateway, RoutingOutcome};
}
