//! # Routing Engine Orchestrator
//!
//! The [`RoutingEngine`] facade. Queue configuration lives in `core`, agent
//! directory and reservation handling in `agents`, task admission and restore
//! in `tasks`.

pub mod agents;
pub mod core;
pub mod tasks;

pub use self::agents::ReservationRelease;
pub use self::core::{RoutingEngine, RoutingEngineBuilder};
pub use self::tasks::TaskRequest;
