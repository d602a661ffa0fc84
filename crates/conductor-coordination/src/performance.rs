use crate::config::PerformanceConfig;
use conductor_core::{AgentId, ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Attempt/success counts for one task type on one agent.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TypeHistory {
    pub attempts: u64,
    pub successes: u64,
}

impl TypeHistory {
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempts == 0 {
            None
        } else {
            Some(self.successes as f64 / self.attempts as f64)
        }
    }
}

/// Learned performance of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformance {
    /// EMA of task outcomes, in [0, 1].
    pub score: f64,
    pub completed: u64,
    pub failed: u64,
    pub total_execution_time: Duration,
    pub by_task_type: HashMap<String, TypeHistory>,
}

impl AgentPerformance {
    fn new(initial_score: f64) -> Self {
        Self {
            score: initial_score,
            completed: 0,
            failed: 0,
            total_execution_time: Duration::ZERO,
            by_task_type: HashMap::new(),
        }
    }
}

/// Outcome value of one finished task: `min(1, estimated / actual)` on
/// success, 0 on failure. Rewards both correctness and speed.
pub fn task_outcome(success: bool, estimated: Duration, actual: Duration) -> f64 {
    if !success {
        return 0.0;
    }
    if actual.is_zero() {
        return 1.0;
    }
    (estimated.as_secs_f64() / actual.as_secs_f64()).clamp(0.0, 1.0)
}

/// Maintains a per-agent quality score as an exponential moving average:
/// `score' = alpha * outcome + (1 - alpha) * score`.
///
/// Each agent's record is updated under its own lock so concurrent
/// completions on different agents never contend.
pub struct PerformanceTracker {
    learning_rate: f64,
    initial_score: f64,
    agents: RwLock<HashMap<AgentId, Arc<Mutex<AgentPerformance>>>>,
}

impl PerformanceTracker {
    pub fn new(config: &PerformanceConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            initial_score: config.initial_score,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking an agent at the neutral initial score.
    pub fn register(&self, agent: &AgentId) {
        self.agents
            .write()
            .entry(agent.clone())
            .or_insert_with(|| Arc::new(Mutex::new(AgentPerformance::new(self.initial_score))));
    }

    pub fn remove(&self, agent: &AgentId) {
        self.agents.write().remove(agent);
    }

    /// Fold one task outcome into the agent's score and history.
    /// Returns the updated score.
    pub fn record(
        &self,
        agent: &AgentId,
        task_type: &str,
        success: bool,
        estimated: Duration,
        actual: Duration,
    ) -> ConductorResult<f64> {
        let record = self
            .agents
            .read()
            .get(agent)
            .cloned()
            .ok_or_else(|| ConductorError::UnknownAgent(agent.clone()))?;
        let outcome = task_outcome(success, estimated, actual);

        let mut perf = record.lock();
        perf.score = (self.learning_rate * outcome + (1.0 - self.learning_rate) * perf.score)
            .clamp(0.0, 1.0);
        if success {
            perf.completed += 1;
        } else {
            perf.failed += 1;
        }
        perf.total_execution_time += actual;
        let history = perf.by_task_type.entry(task_type.to_string()).or_default();
        history.attempts += 1;
        if success {
            history.successes += 1;
        }

        debug!(agent = %agent, outcome, score = perf.score, "Performance updated");
        Ok(perf.score)
    }

    pub fn score(&self, agent: &AgentId) -> Option<f64> {
        self.agents.read().get(agent).map(|p| p.lock().score)
    }

    /// Past success rate of `agent` on tasks of `task_type`, if it has any history.
    pub fn success_rate(&self, agent: &AgentId, task_type: &str) -> Option<f64> {
        self.agents
            .read()
            .get(agent)
            .and_then(|p| p.lock().by_task_type.get(task_type).and_then(TypeHistory::success_rate))
    }

    pub fn stats(&self, agent: &AgentId) -> Option<AgentPerformance> {
        self.agents.read().get(agent).map(|p| p.lock().clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tracker(alpha: f64) -> PerformanceTracker {
        PerformanceTracker::new(&PerformanceConfig {
            learning_rate: alpha,
            initial_score: 0.5,
        })
    }

    #[test]
    fn test_outcome_values() {
        let est = Duration::from_secs(10);
        assert_eq!(task_outcome(true, est, Duration::from_secs(5)), 1.0);
        assert_eq!(task_outcome(true, est, Duration::from_secs(20)), 0.5);
        assert_eq!(task_outcome(false, est, Duration::from_secs(5)), 0.0);
        assert_eq!(task_outcome(true, est, Duration::ZERO), 1.0);
    }

    #[test]
    fn test_initial_score_is_neutral() {
        let t = tracker(0.1);
        let a = AgentId::from("a");
        t.register(&a);
        assert_eq!(t.score(&a), Some(0.5));
    }

    #[test]
    fn test_successes_raise_score_monotonically() {
        let t = tracker(0.1);
        let a = AgentId::from("a");
        t.register(&a);
        let mut last = 0.5;
        for _ in 0..5 {
            let score = t
                .record(&a, "analysis", true, Duration::from_secs(10), Duration::from_secs(8))
                .unwrap();
            assert!(score > last);
            last = score;
        }
        // 1 - 0.5 * 0.9^5
        assert!((last - 0.704_755).abs() < 1e-6);
        assert!(last > 0.7);
    }

    #[test]
    fn test_failure_lowers_score() {
        let t = tracker(0.5);
        let a = AgentId::from("a");
        t.register(&a);
        let score = t
            .record(&a, "analysis", false, Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        assert_eq!(score, 0.25);
        let stats = t.stats(&a).unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_success_rate_by_type() {
        let t = tracker(0.1);
        let a = AgentId::from("a");
        t.register(&a);
        let d = Duration::from_secs(1);
        t.record(&a, "code", true, d, d).unwrap();
        t.record(&a, "code", false, d, d).unwrap();
        t.record(&a, "review", true, d, d).unwrap();
        assert_eq!(t.success_rate(&a, "code"), Some(0.5));
        assert_eq!(t.success_rate(&a, "review"), Some(1.0));
        assert_eq!(t.success_rate(&a, "deploy"), None);
    }

    #[test]
    fn test_unknown_agent() {
        let t = tracker(0.1);
        let d = Duration::from_secs(1);
        assert!(t.record(&AgentId::from("ghost"), "x", true, d, d).is_err());
        assert!(t.score(&AgentId::from("ghost")).is_none());
    }

    #[test]
    fn test_register_is_idempotent() {
        let t = tracker(0.5);
        let a = AgentId::from("a");
        t.register(&a);
        let d = Duration::from_secs(1);
        t.record(&a, "x", false, d, d).unwrap();
        t.register(&a);
        assert_eq!(t.score(&a), Some(0.25));
    }
}
