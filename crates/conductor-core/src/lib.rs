//! Core types and error definitions for the Conductor coordination engine.
//!
//! This crate provides the vocabulary shared by every Conductor crate:
//! identifiers for agents and tasks, named resource quantities, and the
//! unified error type.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for every coordination failure.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`AgentId`] / [`TaskId`]: Caller-supplied identifiers.
//! - [`ResourceType`]: A named quantity dimension tracked per agent.
//! - [`ResourceAmounts`]: A set of quantities keyed by resource type.

/// Agent and task identifiers.
pub mod ids;
/// Resource types and quantity maps.
pub mod resource;

pub use ids::{AgentId, TaskId};
pub use resource::{ResourceAmounts, ResourceType};

// --- Error types ---

/// Top-level error type for the coordination engine.
///
/// Every variant is scoped to a single task, agent, message or handoff;
/// none of them is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A reservation would push an agent over its declared capacity.
    #[error("Capacity exceeded on agent {agent} for {resource}: requested {requested}, available {available}")]
    CapacityExceeded {
        /// Agent whose ledger entry rejected the reservation.
        agent: AgentId,
        /// First resource type that did not fit.
        resource: ResourceType,
        /// Amount requested for that resource.
        requested: f64,
        /// Amount still free for that resource.
        available: f64,
    },

    /// No registered agent has the capabilities a task requires.
    #[error("No eligible agent for task {0}")]
    NoEligibleAgent(TaskId),

    /// A task named a dependency that was never submitted.
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// The task being submitted.
        task: TaskId,
        /// The dependency id that is not known.
        dependency: TaskId,
    },

    /// An agent id was registered twice.
    #[error("Agent {0} is already registered")]
    DuplicateAgent(AgentId),

    /// A task id was submitted twice.
    #[error("Task {0} was already submitted")]
    DuplicateTask(TaskId),

    /// Lookup of an agent that is not registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// Lookup of a task that was never submitted.
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// Lookup of a message id the bus does not track.
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// Lookup of a handoff id that does not exist.
    #[error("Unknown handoff: {0}")]
    UnknownHandoff(String),

    /// A synchronous send got no response before its timeout.
    #[error("Delivery timeout for message {0}")]
    DeliveryTimeout(String),

    /// A message's time-to-live elapsed before it was acknowledged.
    #[error("TTL expired for message {0}")]
    TtlExpired(String),

    /// Delivery was abandoned after the retry budget was spent.
    #[error("Delivery failed for message {message}: {reason}")]
    DeliveryFailed {
        /// The message that could not be delivered.
        message: String,
        /// Last delivery error observed.
        reason: String,
    },

    /// The destination agent declined a handoff.
    #[error("Handoff {0} rejected")]
    HandoffRejected(String),

    /// The destination agent did not answer a handoff in time.
    #[error("Handoff {0} timed out")]
    HandoffTimedOut(String),

    /// An operation was requested in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A request was malformed (empty recipients, negative amounts, ...).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Whether the caller can recover by re-queueing or retrying later.
    ///
    /// Capacity and eligibility failures clear up as agents release work;
    /// rejected or timed-out handoffs put the task back in the queue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConductorError::CapacityExceeded { .. }
                | ConductorError::NoEligibleAgent(_)
                | ConductorError::HandoffRejected(_)
                | ConductorError::HandoffTimedOut(_)
        )
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
