//! Routing engine configuration
//!
//! All runtime switches of the engine live here and are handed to the
//! routers at construction time. There is no process-wide mutable flag:
//! turning routing off for one engine instance never affects another.
//!
//! Configuration can be built in code from [`Default`] or loaded from TOML:
//!
//! ```
//! use rvoip_routing_engine::config::RoutingEngineConfig;
//!
//! let config = RoutingEngineConfig::from_toml_str(r#"
//!     [router]
//!     routing_enabled = true
//!     assign_to_last_agent = false
//!     max_matches_per_event = 16
//!
//!     [queues]
//!     max_steps_per_queue = 5
//!     default_service_level_threshold_secs = 20
//!
//!     [timers]
//!     min_escalation_secs = 1
//!
//!     [logging]
//!     level = "debug"
//!     json = false
//! "#).unwrap();
//!
//! assert_eq!(config.queues.max_steps_per_queue, 5);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};
use crate::logging::LoggingConfig;

/// Hard ceiling on steps per precision queue
pub const MAX_STEPS_PER_QUEUE: usize = 10;

/// Top-level routing engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingEngineConfig {
    /// Task router behaviour
    pub router: RouterConfig,

    /// Precision queue limits and defaults
    pub queues: QueueConfig,

    /// Step-escalation timer settings
    pub timers: TimerConfig,

    /// Logging setup used by [`crate::logging::setup_logging`]
    pub logging: LoggingConfig,
}

/// Task router configuration
///
/// # Examples
///
/// ```
/// use rvoip_routing_engine::config::RouterConfig;
///
/// let config = RouterConfig::default();
/// assert!(config.routing_enabled);
/// assert!(!config.assign_to_last_agent);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// When false, routers keep their per-task bookkeeping (timers,
    /// escalation) but never attempt a match
    pub routing_enabled: bool,

    /// Prefer the agent that last handled the task's conversation when it is
    /// eligible at one of the task's current steps and available
    pub assign_to_last_agent: bool,

    /// Upper bound on reservations committed while handling one event
    ///
    /// A router keeps matching the new head after a successful reservation
    /// until the head cannot be matched or this bound is reached.
    pub max_matches_per_event: usize,
}

/// Precision queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of steps a queue may hold (never above
    /// [`MAX_STEPS_PER_QUEUE`])
    pub max_steps_per_queue: usize,

    /// Service-level threshold applied to queues created without one
    pub default_service_level_threshold_secs: u64,
}

/// Step-escalation timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Lower bound applied to a positive step timeout when arming
    pub min_escalation_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_enabled: true,
            assign_to_last_agent: false,
            max_matches_per_event: 32,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_steps_per_queue: MAX_STEPS_PER_QUEUE,
            default_service_level_threshold_secs: 30,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            min_escalation_secs: 1,
        }
    }
}

impl RoutingEngineConfig {
    /// Parse a configuration from a TOML document
    ///
    /// Missing sections and fields fall back to their defaults. The parsed
    /// configuration is validated before it is returned.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| RoutingError::configuration(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RoutingError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queues.max_steps_per_queue == 0 {
            return Err(RoutingError::configuration(
                "max_steps_per_queue must be at least 1",
            ));
        }
        if self.queues.max_steps_per_queue > MAX_STEPS_PER_QUEUE {
            return Err(RoutingError::configuration(format!(
                "max_steps_per_queue {} exceeds the limit of {}",
                self.queues.max_steps_per_queue, MAX_STEPS_PER_QUEUE
            )));
        }
        if self.router.max_matches_per_event == 0 {
            return Err(RoutingError::configuration(
                "max_matches_per_event must be at least 1",
            ));
        }
        self.logging.level_filter()?;
        Ok(())
    }
}
