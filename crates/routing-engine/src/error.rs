use thiserror::Error;

/// Error types for precision-queue routing operations
///
/// Configuration errors are returned synchronously to whoever mutated the
/// configuration. Transient matching failures (a reservation gateway that
/// refuses or times out) are handled inside the router and only surface
/// here when a caller drives the gateway directly.
///
/// # Examples
///
/// ```
/// use rvoip_routing_engine::{RoutingError, Result};
///
/// fn add_eleventh_step() -> Result<()> {
///     Err(RoutingError::configuration("queue already has 10 steps"))
/// }
///
/// match add_eleventh_step() {
///     Err(RoutingError::Configuration(msg)) => assert!(msg.contains("10 steps")),
///     _ => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Queue, step or expression configuration is invalid
    ///
    /// # Examples
    /// - Step limit exceeded
    /// - Expression references an empty attribute id
    /// - Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Requested queue, step, agent or task does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempt to register a queue or agent that is already known
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The external reservation gateway failed or timed out
    ///
    /// Treated as transient: the task stays queued and is retried on the
    /// next triggering event.
    #[error("Reservation error: {0}")]
    Reservation(String),

    /// Persisted task repository failures
    #[error("Repository error: {0}")]
    Repository(String),

    /// A router's event channel is closed
    #[error("Event bus error: {0}")]
    EventBus(String),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for RoutingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for RoutingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Repository(err.to_string())
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Repository(format!("task payload encoding: {}", err))
    }
}

impl RoutingError {
    /// Create a new Configuration error with the provided message
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new NotFound error with the provided message
    ///
    /// # Examples
    ///
    /// ```
    /// use rvoip_routing_engine::RoutingError;
    ///
    /// let error = RoutingError::not_found("queue 'sales' not found");
    /// assert_eq!(error.to_string(), "Not found: queue 'sales' not found");
    /// ```
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new AlreadyExists error with the provided message
    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a new Reservation error with the provided message
    pub fn reservation<S: Into<String>>(msg: S) -> Self {
        Self::Reservation(msg.into())
    }

    /// Create a new Repository error with the provided message
    pub fn repository<S: Into<String>>(msg: S) -> Self {
        Self::Repository(msg.into())
    }

    /// Create a new EventBus error with the provided message
    pub fn event_bus<S: Into<String>>(msg: S) -> Self {
        Self::EventBus(msg.into())
    }

    /// Create a new Internal error with the provided message
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error is transient and the operation may succeed on a
    /// later attempt without any configuration change
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Reservation(_) | Self::Repository(_))
    }
}

/// Result type for routing operations
pub type Result<T> = std::result::Result<T, RoutingError>;
