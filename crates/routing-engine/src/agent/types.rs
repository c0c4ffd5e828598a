//! Core types for agent availability

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::{QueuedTask, TaskId};

/// Agent identifier type for strongly-typed agent references
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        AgentId(s)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Media domain a task and an agent sub-state are scoped to ("chat", "voice")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaDomainId(pub String);

impl From<&str> for MediaDomainId {
    fn from(s: &str) -> Self {
        MediaDomainId(s.to_string())
    }
}

impl From<String> for MediaDomainId {
    fn from(s: String) -> Self {
        MediaDomainId(s)
    }
}

impl fmt::Display for MediaDomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Overall agent state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    /// Not logged in
    #[default]
    LoggedOut,
    /// Logged in but not accepting work
    NotReady,
    /// Logged in and accepting work
    Ready,
    /// On a break
    Break,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::LoggedOut => write!(f, "logged_out"),
            AgentState::NotReady => write!(f, "not_ready"),
            AgentState::Ready => write!(f, "ready"),
            AgentState::Break => write!(f, "break"),
        }
    }
}

/// Agent sub-state within one media domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaDomainState {
    #[default]
    NotReady,
    /// Ready with no work on this domain
    Ready,
    /// Working on this domain with spare capacity
    Active,
    /// At capacity on this domain
    Busy,
}

impl MediaDomainState {
    /// Whether new work may be offered in this sub-state
    pub fn accepts_work(self) -> bool {
        matches!(self, MediaDomainState::Ready | MediaDomainState::Active)
    }
}

/// How an active task reached the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskMode {
    /// Routed through a precision queue
    Queue,
    /// Transferred to the agent by name
    NamedTransfer,
    /// Push-delivered outbound assignment
    PushOutbound,
}

impl TaskMode {
    /// Whether the task counts toward queue capacity
    pub fn counts_toward_queue_capacity(self) -> bool {
        matches!(self, TaskMode::Queue | TaskMode::NamedTransfer)
    }
}

/// A task the agent is currently working on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub mode: TaskMode,
    pub started_at: DateTime<Utc>,
}

impl ActiveTask {
    pub fn new(task_id: TaskId, mode: TaskMode) -> Self {
        Self {
            task_id,
            mode,
            started_at: Utc::now(),
        }
    }
}

/// Content of an agent's reservation slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservedTask {
    /// The task as it was queued when the reservation was taken
    pub task: QueuedTask,
    /// Step index the match was found at
    pub step_index: usize,
    pub reserved_at: DateTime<Utc>,
}

impl ReservedTask {
    pub fn new(task: QueuedTask, step_index: usize) -> Self {
        Self {
            task,
            step_index,
            reserved_at: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.task_id
    }
}
