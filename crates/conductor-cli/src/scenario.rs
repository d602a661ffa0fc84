//! Scenario files for `conductor simulate`.
//!
//! A scenario lists agents and tasks, plus the outcome each task reports
//! when it is executed. The simulation drives the coordinator until no task
//! is active and returns the final statuses with a metrics snapshot.

use conductor_coordination::{
    AgentProfile, Coordinator, MetricsSnapshot, TaskReport, TaskSpec, TaskStatus,
};
use conductor_core::{ConductorResult, ResourceAmounts, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub agents: Vec<ScenarioAgent>,
    #[serde(default)]
    pub tasks: Vec<ScenarioTask>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioAgent {
    pub id: String,
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub capacity: ResourceAmounts,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioTask {
    pub id: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub resources: ResourceAmounts,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_ms: u64,
    #[serde(default)]
    pub outcome: ScenarioOutcome,
}

/// What the task reports when the simulation completes it.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioOutcome {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub execution_ms: u64,
}

impl Default for ScenarioOutcome {
    fn default() -> Self {
        Self {
            success: default_success(),
            execution_ms: 0,
        }
    }
}

fn default_agent_type() -> String {
    "worker".to_string()
}

fn default_task_type() -> String {
    "generic".to_string()
}

fn default_success() -> bool {
    true
}

/// Final task statuses and engine metrics.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub tasks: BTreeMap<String, TaskStatus>,
    pub rounds: usize,
    pub metrics: MetricsSnapshot,
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Register the agents, submit the tasks, then dispatch and complete in
/// rounds until nothing is allocated.
pub async fn run(coordinator: &Coordinator, scenario: &Scenario) -> ConductorResult<SimulationReport> {
    for agent in &scenario.agents {
        coordinator.register_agent(
            AgentProfile::new(agent.id.as_str(), agent.agent_type.as_str(), agent.capacity.clone())
                .with_capabilities(agent.capabilities.iter().cloned()),
        )?;
    }
    for task in &scenario.tasks {
        let spec = TaskSpec::new(task.id.as_str(), task.task_type.as_str())
            .with_priority(task.priority)
            .with_resources(task.resources.clone())
            .with_capabilities(task.capabilities.iter().cloned())
            .with_dependencies(task.dependencies.iter().map(|d| TaskId::from(d.as_str())).collect())
            .with_estimated_duration(Duration::from_millis(task.estimated_ms));
        coordinator.submit_task(spec).await?;
    }

    let mut rounds = 0;
    loop {
        coordinator.dispatch().await;
        let active: Vec<&ScenarioTask> = scenario
            .tasks
            .iter()
            .filter(|t| {
                coordinator
                    .task_status(&TaskId::from(t.id.as_str()))
                    .is_ok_and(|s| s.is_active())
            })
            .collect();
        if active.is_empty() {
            break;
        }
        rounds += 1;
        for task in active {
            let id = TaskId::from(task.id.as_str());
            coordinator.start_task(&id)?;
            let elapsed = Duration::from_millis(task.outcome.execution_ms);
            let report = if task.outcome.success {
                TaskReport::success(elapsed)
            } else {
                TaskReport::failure(elapsed)
            };
            coordinator.complete_task(&id, report).await?;
        }
    }

    let mut tasks = BTreeMap::new();
    for task in &scenario.tasks {
        let status = coordinator.task_status(&TaskId::from(task.id.as_str()))?;
        if !status.is_terminal() {
            warn!(task = %task.id, status = %status, "Task never ran");
        }
        tasks.insert(task.id.clone(), status);
    }
    info!(rounds, tasks = tasks.len(), "Simulation finished");
    Ok(SimulationReport {
        tasks,
        rounds,
        metrics: coordinator.snapshot_metrics(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_coordination::CoordinatorConfig;

    const SCENARIO: &str = r#"
        [[agents]]
        id = "planner"
        capabilities = ["llm"]
        capacity = { cpu = 2.0, memory = 4096.0 }

        [[agents]]
        id = "crawler"
        capabilities = ["http"]
        capacity = { cpu = 1.0 }

        [[tasks]]
        id = "fetch"
        task_type = "io"
        priority = 5
        capabilities = ["http"]
        resources = { cpu = 1.0 }
        estimated_ms = 100
        outcome = { execution_ms = 80 }

        [[tasks]]
        id = "summarize"
        task_type = "llm"
        capabilities = ["llm"]
        dependencies = ["fetch"]
        resources = { cpu = 2.0, mem = 2048.0 }

        [[tasks]]
        id = "translate"
        capabilities = ["llm"]
        dependencies = ["summarize"]
        outcome = { success = false }

        [[tasks]]
        id = "publish"
        dependencies = ["translate"]

        [[tasks]]
        id = "render"
        capabilities = ["gpu"]
    "#;

    #[tokio::test]
    async fn test_simulation_runs_to_quiescence() {
        let scenario = Scenario::from_toml_str(SCENARIO).unwrap();
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        let report = run(&coordinator, &scenario).await.unwrap();

        assert_eq!(report.tasks["fetch"], TaskStatus::Completed);
        assert_eq!(report.tasks["summarize"], TaskStatus::Completed);
        assert!(matches!(report.tasks["translate"], TaskStatus::Failed { .. }));
        assert!(matches!(report.tasks["publish"], TaskStatus::Failed { .. }));
        // Nobody has a GPU capability.
        assert_eq!(report.tasks["render"], TaskStatus::Queued);
        assert_eq!(report.metrics.tasks.completed, 2);
        assert!(report.rounds >= 3);
    }

    #[test]
    fn test_outcome_defaults() {
        let scenario = Scenario::from_toml_str(
            r#"
            [[tasks]]
            id = "t"
            "#,
        )
        .unwrap();
        assert!(scenario.agents.is_empty());
        assert!(scenario.tasks[0].outcome.success);
        assert_eq!(scenario.tasks[0].task_type, "generic");
    }
}
