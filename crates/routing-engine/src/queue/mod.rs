//! # Precision Queues
//!
//! Ordered eligibility steps and the pending tasks waiting on them.
//!
//! - [`ServiceQueue`]: tasks ordered by priority, then arrival
//! - [`Step`]: one eligibility tier with its incrementally maintained agent set
//! - [`PrecisionQueue`]: steps plus service queue behind one per-queue lock

pub mod precision_queue;
pub mod service_queue;
pub mod step;
pub mod types;

pub use precision_queue::{EscalationPlan, MatchSnapshot, PrecisionQueue, StepAdvance};
pub use service_queue::ServiceQueue;
pub use step::Step;
pub use types::{
    EscalationStep, QueueDefinition, QueueId, QueueStats, QueuedTask, SelectionCriterion,
    ServiceLevel, ServiceLevelType, StepDefinition, StepId, TaskId,
};
