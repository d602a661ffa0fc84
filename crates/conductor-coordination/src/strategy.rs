use crate::config::ScoringWeights;
use serde::{Deserialize, Serialize};

/// Success rate assumed for an agent with no history on a task type.
pub const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

/// Weights used by [`AllocationStrategy::LoadBalanced`]: availability dominates.
pub const LOAD_BALANCED_WEIGHTS: ScoringWeights = ScoringWeights {
    performance: 0.2,
    availability: 0.8,
};

/// Weights used by [`AllocationStrategy::Adaptive`]: learned performance dominates.
pub const ADAPTIVE_WEIGHTS: ScoringWeights = ScoringWeights {
    performance: 0.8,
    availability: 0.2,
};

/// How the allocator picks among agents that can take a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Ignore scores and rotate through candidates.
    RoundRobin,
    /// Keep the top-scored candidate for tasks with priority above
    /// `threshold`; tasks at or below it get that agent only when nobody else
    /// can run them.
    PriorityBased { threshold: i32 },
    /// Favour idle agents.
    LoadBalanced,
    /// Favour agents with the best learned performance score.
    #[default]
    Adaptive,
    /// Score purely by past success rate on the task's type.
    Historical,
}

/// Inputs the allocator gathers for one candidate agent.
#[derive(Debug, Clone, Copy)]
pub struct CandidateMetrics {
    pub performance_score: f64,
    /// Σ in_use / Σ max_capacity over the task's requested resource types.
    pub utilization: f64,
    /// Past success rate on the task's type, if any.
    pub success_rate: Option<f64>,
}

impl AllocationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationStrategy::RoundRobin => "round_robin",
            AllocationStrategy::PriorityBased { .. } => "priority_based",
            AllocationStrategy::LoadBalanced => "load_balanced",
            AllocationStrategy::Adaptive => "adaptive",
            AllocationStrategy::Historical => "historical",
        }
    }

    /// Effective (w1, w2) for this strategy given the configured base weights.
    pub fn weights(&self, base: ScoringWeights) -> ScoringWeights {
        match self {
            AllocationStrategy::LoadBalanced => LOAD_BALANCED_WEIGHTS,
            AllocationStrategy::Adaptive => ADAPTIVE_WEIGHTS,
            _ => base,
        }
    }

    /// Candidate score; higher wins. Round-robin does not score (always 0).
    pub fn score(&self, base: ScoringWeights, metrics: &CandidateMetrics) -> f64 {
        match self {
            AllocationStrategy::RoundRobin => 0.0,
            AllocationStrategy::Historical => {
                metrics.success_rate.unwrap_or(NEUTRAL_SUCCESS_RATE)
            }
            _ => {
                let w = self.weights(base);
                w.performance * metrics.performance_score
                    + w.availability * (1.0 - metrics.utilization)
            }
        }
    }
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStrategy::PriorityBased { threshold } => {
                write!(f, "priority_based(threshold={threshold})")
            }
            other => f.write_str(other.name()),
        }
    }
}
