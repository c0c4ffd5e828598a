//! # Agent Availability
//!
//! Agents, their per-media-domain availability and the registry the
//! routers resolve candidate ids against.

pub mod availability;
pub mod registry;
pub mod types;

pub use availability::{Agent, MediaDomainStatus};
pub use registry::AgentRegistry;
pub use types::{
    ActiveTask, AgentId, AgentState, MediaDomainId, MediaDomainState, ReservedTask, TaskMode,
};
