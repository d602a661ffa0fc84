//! Coordination engine for a pool of independent agents.
//!
//! Tasks are queued by priority and dependency, placed on agents whose
//! capacity and capabilities fit, and moved between agents through an
//! acknowledged handoff. Agents talk over a message bus with per-send
//! delivery guarantees. Each agent's score is learned from reported outcomes
//! and feeds back into allocation.
//!
//! # Main types
//!
//! - [`Coordinator`]: facade composing every component below.
//! - [`ResourceLedger`]: per-agent capacity accounting.
//! - [`Scheduler`]: priority queue with dependency gating.
//! - [`Allocator`]: strategy-driven agent selection.
//! - [`PerformanceTracker`]: EMA score per agent.
//! - [`CommunicationBus`]: message routing, acknowledgment, retry and TTL.
//! - [`HandoffManager`]: transfers of in-flight tasks between agents.

/// Strategy-driven agent selection and allocation bookkeeping.
pub mod allocator;
/// Message routing with delivery modes, retries and TTLs.
pub mod bus;
/// TOML-backed engine configuration.
pub mod config;
/// The public facade.
pub mod coordinator;
/// Handoff state machine.
pub mod handoff;
/// Per-agent capacity accounting.
pub mod ledger;
/// Message envelope, delivery modes and statuses.
pub mod message;
/// Metrics counters and snapshots.
pub mod metrics;
/// Learned per-agent performance scores.
pub mod performance;
/// Priority and dependency aware task queue.
pub mod scheduler;
/// Allocation strategies and candidate scoring.
pub mod strategy;
/// Tasks, agents, allocations and reports.
pub mod types;

pub use allocator::Allocator;
pub use bus::{CommunicationBus, Endpoint, MailboxEndpoint, SweepReport};
pub use config::{
    BusConfig, CoordinatorConfig, HandoffConfig, PerformanceConfig, RetryPolicy, ScoringWeights,
};
pub use coordinator::{Coordinator, DispatchOutcome, MaintenanceReport};
pub use handoff::{HandoffId, HandoffManager, HandoffRecord, HandoffRequest, HandoffStatus};
pub use ledger::{LedgerView, ResourceLedger};
pub use message::{
    DeliveryMode, DeliveryStatus, Envelope, MessageId, MessagePriority, MessageType, SendReceipt,
    SendRequest,
};
pub use metrics::{AgentMetricsView, MetricsSnapshot};
pub use performance::{AgentPerformance, PerformanceTracker};
pub use scheduler::{Scheduler, SchedulerCounts};
pub use strategy::AllocationStrategy;
pub use types::{
    AgentProfile, Allocation, CompletionOutcome, Task, TaskReport, TaskSpec, TaskStatus,
};
