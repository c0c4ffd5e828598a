//! Identifiers and value types shared by precision queues

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::{AgentId, MediaDomainId};
use crate::expression::Expression;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Precision queue identifier
    QueueId
);
string_id!(
    /// External task identifier; unique within a service queue
    TaskId
);
string_id!(
    /// Stable step identifier, independent of the step's ordinal
    StepId
);

impl StepId {
    pub fn new_random() -> Self {
        StepId(Uuid::new_v4().to_string())
    }
}

/// A task waiting in a precision queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Internal record id
    pub id: Uuid,
    pub task_id: TaskId,
    pub conversation_id: String,
    pub media_domain: MediaDomainId,
    pub queue_id: QueueId,
    /// Higher values are served first
    pub priority: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Index of the widest step the task may currently match against
    pub step_index: usize,
    /// When the task reached `step_index`
    pub step_started_at: DateTime<Utc>,
    /// Agent that last handled the task's conversation, if known
    pub last_assigned_agent: Option<AgentId>,
    /// Set once the task has been reserved
    pub assigned_to: Option<AgentId>,
}

impl QueuedTask {
    pub fn new(
        task_id: impl Into<TaskId>,
        conversation_id: impl Into<String>,
        queue_id: QueueId,
        media_domain: MediaDomainId,
        priority: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            conversation_id: conversation_id.into(),
            media_domain,
            queue_id,
            priority,
            enqueued_at: now,
            step_index: 0,
            step_started_at: now,
            last_assigned_agent: None,
            assigned_to: None,
        }
    }

    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self.step_started_at = at;
        self
    }

    pub fn with_last_assigned_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.last_assigned_agent = Some(agent_id.into());
        self
    }

    /// Seconds the task has been waiting
    pub fn wait_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.enqueued_at).num_seconds().max(0) as u64
    }
}

/// How candidate agents of a step are ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionCriterion {
    LeastSkilled,
    MostSkilled,
    LongestAvailable,
    #[default]
    Default,
}

/// Service-level measurement kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceLevelType {
    /// Tasks waiting longer than the threshold breach the service level
    #[default]
    WaitTime,
    Disabled,
}

/// Service-level target of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLevel {
    pub kind: ServiceLevelType,
    pub threshold_secs: u64,
}

impl ServiceLevel {
    pub fn wait_time(threshold_secs: u64) -> Self {
        Self {
            kind: ServiceLevelType::WaitTime,
            threshold_secs,
        }
    }

    pub fn disabled() -> Self {
        Self {
            kind: ServiceLevelType::Disabled,
            threshold_secs: 0,
        }
    }

    /// Whether a task waiting `wait_secs` is outside the target
    pub fn is_breached(&self, wait_secs: u64) -> bool {
        match self.kind {
            ServiceLevelType::WaitTime => wait_secs > self.threshold_secs,
            ServiceLevelType::Disabled => false,
        }
    }
}

/// Step configuration as supplied by the configuration store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<StepId>,
    #[serde(default)]
    pub expressions: Vec<Expression>,
    /// Escalation timeout; zero on a non-last step means "escalate now"
    pub timeout_secs: u64,
}

impl StepDefinition {
    pub fn new(expressions: Vec<Expression>, timeout_secs: u64) -> Self {
        Self {
            id: None,
            expressions,
            timeout_secs,
        }
    }

    pub fn with_id(mut self, id: impl Into<StepId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Precision queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub id: QueueId,
    pub name: String,
    pub media_domain: MediaDomainId,
    #[serde(default)]
    pub criterion: SelectionCriterion,
    /// Falls back to the engine's default threshold when absent
    #[serde(default)]
    pub service_level: Option<ServiceLevel>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl QueueDefinition {
    pub fn new(id: impl Into<QueueId>, name: impl Into<String>, media_domain: impl Into<MediaDomainId>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            media_domain: media_domain.into(),
            criterion: SelectionCriterion::Default,
            service_level: None,
            steps: Vec::new(),
        }
    }

    pub fn with_criterion(mut self, criterion: SelectionCriterion) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn with_service_level(mut self, service_level: ServiceLevel) -> Self {
        self.service_level = Some(service_level);
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }
}

/// Queue statistics computed on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_id: QueueId,
    pub total_tasks: usize,
    pub average_wait_secs: u64,
    pub longest_wait_secs: u64,
    /// Number of queued tasks at each step index
    pub tasks_per_step: BTreeMap<usize, usize>,
    /// Tasks waiting beyond the service-level threshold
    pub breaching_service_level: usize,
}

/// Result of the escalation lookup used when arming a task's timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    pub index: usize,
    pub timeout_secs: u64,
    pub is_last: bool,
}
