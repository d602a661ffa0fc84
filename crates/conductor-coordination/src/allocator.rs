use crate::config::ScoringWeights;
use crate::ledger::ResourceLedger;
use crate::performance::PerformanceTracker;
use crate::strategy::{AllocationStrategy, CandidateMetrics};
use crate::types::{AgentProfile, Allocation, Task};
use chrono::Utc;
use conductor_core::{AgentId, ConductorError, ConductorResult, ResourceAmounts, TaskId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct RankedCandidate {
    agent: AgentId,
    score: f64,
}

/// Picks an agent for each eligible task and commits the allocation.
///
/// Agents are kept in registration order, which is also the tie-break among
/// equally scored candidates.
pub struct Allocator {
    strategy: AllocationStrategy,
    weights: ScoringWeights,
    ledger: Arc<ResourceLedger>,
    performance: Arc<PerformanceTracker>,
    agents: RwLock<Vec<AgentProfile>>,
    allocations: Mutex<HashMap<TaskId, Allocation>>,
    rr_cursor: AtomicUsize,
}

impl Allocator {
    pub fn new(
        strategy: AllocationStrategy,
        weights: ScoringWeights,
        ledger: Arc<ResourceLedger>,
        performance: Arc<PerformanceTracker>,
    ) -> Self {
        Self {
            strategy,
            weights,
            ledger,
            performance,
            agents: RwLock::new(Vec::new()),
            allocations: Mutex::new(HashMap::new()),
            rr_cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    /// Register an agent with the ledger and performance tracker.
    pub fn register_agent(&self, profile: AgentProfile) -> ConductorResult<()> {
        let mut agents = self.agents.write();
        if agents.iter().any(|a| a.id == profile.id) {
            return Err(ConductorError::DuplicateAgent(profile.id));
        }
        self.ledger.register(&profile.id, profile.max_capacity.clone())?;
        self.performance.register(&profile.id);
        info!(
            agent = %profile.id,
            agent_type = %profile.agent_type,
            capabilities = profile.capabilities.len(),
            "Agent registered"
        );
        agents.push(profile);
        Ok(())
    }

    /// Remove an agent that holds no allocations.
    pub fn deregister_agent(&self, agent: &AgentId) -> ConductorResult<AgentProfile> {
        let mut agents = self.agents.write();
        let index = agents
            .iter()
            .position(|a| &a.id == agent)
            .ok_or_else(|| ConductorError::UnknownAgent(agent.clone()))?;
        if self.allocation_count(agent) > 0 {
            return Err(ConductorError::InvalidState(format!(
                "agent {agent} still holds allocations"
            )));
        }
        self.ledger.deregister(agent)?;
        self.performance.remove(agent);
        info!(agent = %agent, "Agent deregistered");
        Ok(agents.remove(index))
    }

    pub fn agent(&self, agent: &AgentId) -> Option<AgentProfile> {
        self.agents.read().iter().find(|a| &a.id == agent).cloned()
    }

    /// Every registered agent, in registration order.
    pub fn agents(&self) -> Vec<AgentProfile> {
        self.agents.read().clone()
    }

    /// Select an agent for `task` and reserve its resources there.
    ///
    /// Fails fast: `NoEligibleAgent` when no agent has the required
    /// capabilities, `CapacityExceeded` when capable agents exist but none has
    /// room. Never blocks waiting for capacity.
    pub fn allocate(&self, task: &Task) -> ConductorResult<Allocation> {
        let required = &task.spec.required;
        let capable: Vec<AgentId> = self
            .agents
            .read()
            .iter()
            .filter(|a| a.can_serve(&task.spec.capabilities))
            .map(|a| a.id.clone())
            .collect();
        if capable.is_empty() {
            warn!(task = %task.id(), "No agent has the required capabilities");
            return Err(ConductorError::NoEligibleAgent(task.id().clone()));
        }

        let mut first_capacity_error = None;
        let mut candidates = Vec::new();
        for agent in capable {
            match self.ledger.check_reserve(&agent, required) {
                Ok(()) => candidates.push(agent),
                Err(e) => {
                    first_capacity_error.get_or_insert(e);
                }
            }
        }
        if candidates.is_empty() {
            let err = first_capacity_error
                .unwrap_or_else(|| ConductorError::NoEligibleAgent(task.id().clone()));
            warn!(task = %task.id(), error = %err, "No capable agent has capacity");
            return Err(err);
        }

        let ranked = self.rank(task, candidates);
        let mut last_err = None;
        for candidate in ranked {
            match self.ledger.try_reserve(&candidate.agent, required) {
                Ok(committed) => {
                    let allocation =
                        Allocation::new(task.id().clone(), candidate.agent.clone(), committed);
                    self.allocations
                        .lock()
                        .insert(task.id().clone(), allocation.clone());
                    info!(
                        task = %task.id(),
                        agent = %candidate.agent,
                        score = candidate.score,
                        strategy = %self.strategy,
                        "Task allocated"
                    );
                    return Ok(allocation);
                }
                Err(e) => {
                    // Capacity changed between the check and the reservation.
                    debug!(agent = %candidate.agent, error = %e, "Reservation lost race");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ConductorError::NoEligibleAgent(task.id().clone())))
    }

    /// Order candidates best-first according to the configured strategy.
    fn rank(&self, task: &Task, candidates: Vec<AgentId>) -> Vec<RankedCandidate> {
        if let AllocationStrategy::RoundRobin = self.strategy {
            let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
            let mut rotated: Vec<RankedCandidate> = candidates
                .into_iter()
                .map(|agent| RankedCandidate { agent, score: 0.0 })
                .collect();
            rotated.rotate_left(start);
            return rotated;
        }

        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .map(|agent| {
                let metrics = CandidateMetrics {
                    performance_score: self.performance.score(&agent).unwrap_or(0.0),
                    utilization: self
                        .ledger
                        .utilization(&agent, Some(&task.spec.required))
                        .unwrap_or(1.0),
                    success_rate: self.performance.success_rate(&agent, &task.spec.task_type),
                };
                let score = self.strategy.score(self.weights, &metrics);
                RankedCandidate { agent, score }
            })
            .collect();
        // Stable: equal scores keep registration order.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        if let AllocationStrategy::PriorityBased { threshold } = self.strategy {
            if task.priority() <= threshold && ranked.len() > 1 {
                let top = ranked.remove(0);
                ranked.push(top);
            }
        }
        ranked
    }

    /// Remove a task's allocation and return every holding to the ledger.
    pub fn release(&self, task_id: &TaskId) -> Option<Allocation> {
        let allocation = self.allocations.lock().remove(task_id)?;
        for (agent, amounts) in &allocation.holdings {
            if let Err(e) = self.ledger.release(agent, amounts) {
                warn!(task = %task_id, agent = %agent, error = %e, "Release failed");
            }
        }
        debug!(task = %task_id, agent = %allocation.agent_id, "Allocation released");
        Some(allocation)
    }

    /// Move ownership of an allocation from `from` to `to`, shifting `amounts`
    /// of the held resources in one ledger step.
    ///
    /// Whatever part of the source holding is not transferred stays reserved
    /// on the source until the allocation is released.
    pub fn transfer(
        &self,
        task_id: &TaskId,
        from: &AgentId,
        to: &AgentId,
        amounts: &ResourceAmounts,
    ) -> ConductorResult<Allocation> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .get_mut(task_id)
            .ok_or_else(|| ConductorError::InvalidState(format!("task {task_id} has no allocation")))?;
        if &allocation.agent_id != from {
            return Err(ConductorError::InvalidState(format!(
                "task {task_id} is owned by {}, not {from}",
                allocation.agent_id
            )));
        }
        if !amounts.fits_within(&allocation.held_on(from)) {
            return Err(ConductorError::InvalidRequest(format!(
                "transfer for task {task_id} exceeds what {from} holds"
            )));
        }

        self.ledger.transfer(from, to, amounts)?;

        if let Some(source) = allocation.holdings.get_mut(from) {
            source.saturating_sub(amounts);
            if source.is_empty() {
                allocation.holdings.remove(from);
            }
        }
        allocation
            .holdings
            .entry(to.clone())
            .or_default()
            .add(amounts);
        allocation.agent_id = to.clone();
        allocation.started_at = Utc::now();
        info!(task = %task_id, from = %from, to = %to, "Allocation transferred");
        Ok(allocation.clone())
    }

    pub fn allocation(&self, task_id: &TaskId) -> Option<Allocation> {
        self.allocations.lock().get(task_id).cloned()
    }

    /// Allocations that hold resources on `agent` (owned or residual).
    pub fn allocation_count(&self, agent: &AgentId) -> usize {
        self.allocations
            .lock()
            .values()
            .filter(|a| a.holdings.contains_key(agent) || &a.agent_id == agent)
            .count()
    }

    pub fn active_allocations(&self) -> Vec<Allocation> {
        self.allocations.lock().values().cloned().collect()
    }
}
