use chrono::{DateTime, Utc};
use conductor_core::{AgentId, ResourceAmounts, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Lifecycle status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible for allocation.
    Queued,
    /// Blocked on at least one dependency that has not completed.
    Pending,
    /// Bound to an agent, resources committed.
    Allocated,
    /// The agent signalled that execution started.
    Running,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Allocated or Running: the task holds an allocation.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Allocated | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Allocated => write!(f, "allocated"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { reason } => write!(f, "failed ({reason})"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a submitter provides for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub task_type: String,
    /// Higher is more urgent.
    pub priority: i32,
    pub required: ResourceAmounts,
    /// Capability tags an agent must declare to run this task.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub estimated_duration: Duration,
}

impl TaskSpec {
    /// A priority-0 task with no requirements and a one-second estimate.
    pub fn new(id: impl Into<TaskId>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            priority: 0,
            required: ResourceAmounts::new(),
            capabilities: BTreeSet::new(),
            dependencies: Vec::new(),
            estimated_duration: Duration::from_secs(1),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resources(mut self, required: ResourceAmounts) -> Self {
        self.required = required;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }
}

/// A task tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    /// Monotonic submission counter; FIFO tie-break among equal priorities.
    pub arrival_seq: u64,
    pub submitted_at: DateTime<Utc>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub assigned_to: Option<AgentId>,
}

impl Task {
    pub(crate) fn new(spec: TaskSpec, status: TaskStatus, arrival_seq: u64) -> Self {
        Self {
            spec,
            status,
            arrival_seq,
            submitted_at: Utc::now(),
            allocated_at: None,
            finished_at: None,
            assigned_to: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.id
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }
}

/// What an agent runtime declares when it registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub max_capacity: ResourceAmounts,
}

impl AgentProfile {
    pub fn new(id: impl Into<AgentId>, agent_type: impl Into<String>, max_capacity: ResourceAmounts) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            max_capacity,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this agent declares every capability in `required`.
    pub fn can_serve(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

/// A task bound to an agent with committed resources.
///
/// `holdings` lists the amounts reserved on each agent. Normally that is only
/// the owning agent; after a partial handoff the untransferred remainder stays
/// held on the source until the task finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub holdings: BTreeMap<AgentId, ResourceAmounts>,
    pub started_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(task_id: TaskId, agent_id: AgentId, committed: ResourceAmounts) -> Self {
        let mut holdings = BTreeMap::new();
        holdings.insert(agent_id.clone(), committed);
        Self {
            task_id,
            agent_id,
            holdings,
            started_at: Utc::now(),
        }
    }

    /// Amounts held on one agent.
    pub fn held_on(&self, agent: &AgentId) -> ResourceAmounts {
        self.holdings.get(agent).cloned().unwrap_or_default()
    }

    /// Sum of the amounts held across every agent.
    pub fn committed(&self) -> ResourceAmounts {
        let mut total = ResourceAmounts::new();
        for amounts in self.holdings.values() {
            total.add(amounts);
        }
        total
    }
}

/// Execution report supplied with `complete_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub success: bool,
    pub execution_time: Duration,
    /// Free-form metrics from the agent runtime; stored, never interpreted.
    #[serde(default)]
    pub metrics: HashMap<String, serde_json::Value>,
}

impl TaskReport {
    pub fn success(execution_time: Duration) -> Self {
        Self {
            success: true,
            execution_time,
            metrics: HashMap::new(),
        }
    }

    pub fn failure(execution_time: Duration) -> Self {
        Self {
            success: false,
            execution_time,
            metrics: HashMap::new(),
        }
    }
}

/// Result of `complete_task`. Completing an already-finished task is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The outcome was applied; carries the new terminal status.
    Recorded(TaskStatus),
    /// The task was not Allocated/Running; nothing changed.
    AlreadyCompleted(TaskStatus),
}
