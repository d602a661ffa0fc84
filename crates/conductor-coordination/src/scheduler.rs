use crate::types::{Task, TaskSpec, TaskStatus};
use chrono::Utc;
use conductor_core::{AgentId, ConductorError, ConductorResult, TaskId};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Heap key: highest priority first, then lowest arrival sequence.
#[derive(Debug, PartialEq, Eq)]
struct QueueKey {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, Task>,
    ready: BinaryHeap<QueueKey>,
    /// Tasks that have a live entry in `ready`; heap entries for anything
    /// else are stale and skipped on pop.
    enqueued: HashSet<TaskId>,
    /// Unmet dependencies of each Pending task.
    waiting_on: HashMap<TaskId, HashSet<TaskId>>,
    /// Reverse dependency edges.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    next_seq: u64,
}

impl SchedulerState {
    fn push_ready(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.get(id) {
            if self.enqueued.insert(id.clone()) {
                self.ready.push(QueueKey {
                    priority: task.priority(),
                    seq: task.arrival_seq,
                    task_id: id.clone(),
                });
            }
        }
    }

    fn task_mut(&mut self, id: &TaskId) -> ConductorResult<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| ConductorError::UnknownTask(id.clone()))
    }

    /// Move dependents of a completed task from Pending to Queued when their
    /// last unmet dependency was `completed`.
    fn release_dependents(&mut self, completed: &TaskId) -> Vec<TaskId> {
        let mut promoted = Vec::new();
        let dependents = self.dependents.get(completed).cloned().unwrap_or_default();
        for dependent in dependents {
            let now_ready = match self.waiting_on.get_mut(&dependent) {
                Some(unmet) => {
                    unmet.remove(completed);
                    unmet.is_empty()
                }
                None => false,
            };
            if !now_ready {
                continue;
            }
            self.waiting_on.remove(&dependent);
            let is_pending = self
                .tasks
                .get(&dependent)
                .is_some_and(|t| t.status == TaskStatus::Pending);
            if is_pending {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    task.status = TaskStatus::Queued;
                }
                self.push_ready(&dependent);
                promoted.push(dependent);
            }
        }
        promoted
    }

    /// Fail every task transitively waiting on `root`, which will never complete.
    fn fail_dependents(&mut self, root: &TaskId) -> Vec<TaskId> {
        let mut failed = Vec::new();
        let mut frontier = VecDeque::from([root.clone()]);
        while let Some(current) = frontier.pop_front() {
            let dependents = self.dependents.get(&current).cloned().unwrap_or_default();
            for dependent in dependents {
                let Some(task) = self.tasks.get_mut(&dependent) else {
                    continue;
                };
                if task.status.is_terminal() {
                    continue;
                }
                task.status = TaskStatus::Failed {
                    reason: format!("dependency {current} did not complete"),
                };
                task.finished_at = Some(Utc::now());
                self.waiting_on.remove(&dependent);
                self.enqueued.remove(&dependent);
                failed.push(dependent.clone());
                frontier.push_back(dependent);
            }
        }
        failed
    }
}

/// Effects of moving a task into a terminal state.
#[derive(Debug, Clone, Default)]
pub struct FinishEffects {
    /// Dependents that became eligible.
    pub promoted: Vec<TaskId>,
    /// Dependents failed because this task did not complete.
    pub failed_dependents: Vec<TaskId>,
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerCounts {
    pub queued: usize,
    pub pending: usize,
    pub allocated: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Priority queue with dependency gating.
///
/// Ordering is (priority descending, arrival sequence ascending). A task is
/// eligible once every dependency is Completed; dependents are promoted when
/// a dependency completes rather than by polling. The whole structure sits
/// behind one short-lived lock and never does resource accounting.
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a task. Returns Queued, Pending (blocked on dependencies), or
    /// Failed when a dependency already failed or was cancelled.
    pub fn submit(&self, spec: TaskSpec) -> ConductorResult<TaskStatus> {
        if let Some((resource, quantity)) = spec.required.first_invalid() {
            return Err(ConductorError::InvalidRequest(format!(
                "task {} requires invalid {resource} amount {quantity}",
                spec.id
            )));
        }

        let mut state = self.state.lock();
        if state.tasks.contains_key(&spec.id) {
            return Err(ConductorError::DuplicateTask(spec.id));
        }

        let mut unmet = HashSet::new();
        let mut dead_dependency = None;
        for dep in &spec.dependencies {
            let dep_task = state.tasks.get(dep).ok_or_else(|| ConductorError::UnknownDependency {
                task: spec.id.clone(),
                dependency: dep.clone(),
            })?;
            match dep_task.status {
                TaskStatus::Completed => {}
                TaskStatus::Failed { .. } | TaskStatus::Cancelled => {
                    dead_dependency.get_or_insert_with(|| dep.clone());
                }
                _ => {
                    unmet.insert(dep.clone());
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let id = spec.id.clone();
        for dep in &spec.dependencies {
            state.dependents.entry(dep.clone()).or_default().push(id.clone());
        }

        let status = if let Some(dep) = dead_dependency {
            TaskStatus::Failed {
                reason: format!("dependency {dep} did not complete"),
            }
        } else if unmet.is_empty() {
            TaskStatus::Queued
        } else {
            TaskStatus::Pending
        };

        let mut task = Task::new(spec, status.clone(), seq);
        if status.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        state.tasks.insert(id.clone(), task);
        match status {
            TaskStatus::Queued => state.push_ready(&id),
            TaskStatus::Pending => {
                state.waiting_on.insert(id.clone(), unmet);
            }
            _ => {}
        }

        info!(task = %id, status = %status, seq, "Task submitted");
        Ok(status)
    }

    /// Remove and return the most urgent eligible task.
    ///
    /// The task stays Queued but leaves the heap; the caller must either
    /// [`mark_allocated`](Self::mark_allocated) or [`requeue`](Self::requeue) it.
    pub fn next_eligible(&self) -> Option<Task> {
        self.next_eligible_except(&HashSet::new())
    }

    /// Like [`next_eligible`](Self::next_eligible), but tasks in `skip` stay
    /// in the queue, visible to other callers, and are passed over.
    pub fn next_eligible_except(&self, skip: &HashSet<TaskId>) -> Option<Task> {
        let mut state = self.state.lock();
        let mut passed_over = Vec::new();
        let mut found = None;
        while let Some(key) = state.ready.pop() {
            if !state.enqueued.contains(&key.task_id) {
                continue;
            }
            if skip.contains(&key.task_id) {
                passed_over.push(key);
                continue;
            }
            state.enqueued.remove(&key.task_id);
            match state.tasks.get(&key.task_id) {
                Some(task) if task.status == TaskStatus::Queued => {
                    found = Some(task.clone());
                    break;
                }
                _ => continue,
            }
        }
        state.ready.extend(passed_over);
        found
    }

    /// Take a specific Queued task out of the heap for allocation.
    pub fn take_queued(&self, id: &TaskId) -> ConductorResult<Task> {
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        if task.status != TaskStatus::Queued {
            return Err(ConductorError::InvalidState(format!(
                "task {id} is {} and cannot be allocated",
                task.status
            )));
        }
        let task = task.clone();
        state.enqueued.remove(id);
        Ok(task)
    }

    /// Put a task back in the queue at its original priority and arrival
    /// position (no penalty).
    pub fn requeue(&self, id: &TaskId) -> ConductorResult<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        if task.status.is_terminal() || task.status == TaskStatus::Pending {
            return Err(ConductorError::InvalidState(format!(
                "task {id} is {} and cannot be re-queued",
                task.status
            )));
        }
        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.allocated_at = None;
        state.push_ready(id);
        debug!(task = %id, "Task re-queued");
        Ok(())
    }

    /// Queued → Allocated, bound to `agent`.
    pub fn mark_allocated(&self, id: &TaskId, agent: &AgentId) -> ConductorResult<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        if task.status != TaskStatus::Queued {
            return Err(ConductorError::InvalidState(format!(
                "task {id} is {} and cannot be allocated",
                task.status
            )));
        }
        task.status = TaskStatus::Allocated;
        task.assigned_to = Some(agent.clone());
        task.allocated_at = Some(Utc::now());
        state.enqueued.remove(id);
        Ok(())
    }

    /// Allocated → Running. Already Running is accepted.
    pub fn mark_running(&self, id: &TaskId) -> ConductorResult<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        match task.status {
            TaskStatus::Allocated => {
                task.status = TaskStatus::Running;
                Ok(())
            }
            TaskStatus::Running => Ok(()),
            ref other => Err(ConductorError::InvalidState(format!(
                "task {id} is {other} and cannot start running"
            ))),
        }
    }

    /// Record a new owning agent after a handoff.
    pub fn reassign(&self, id: &TaskId, agent: &AgentId) -> ConductorResult<()> {
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        if !task.status.is_active() {
            return Err(ConductorError::InvalidState(format!(
                "task {id} is {} and has no owner to change",
                task.status
            )));
        }
        task.assigned_to = Some(agent.clone());
        Ok(())
    }

    /// Move a task into a terminal status and propagate to its dependents.
    pub fn finish(&self, id: &TaskId, status: TaskStatus) -> ConductorResult<FinishEffects> {
        if !status.is_terminal() {
            return Err(ConductorError::InvalidRequest(format!(
                "{status} is not a terminal status"
            )));
        }
        let mut state = self.state.lock();
        let task = state.task_mut(id)?;
        if task.status.is_terminal() {
            return Err(ConductorError::InvalidState(format!(
                "task {id} is already {}",
                task.status
            )));
        }
        task.status = status.clone();
        task.finished_at = Some(Utc::now());
        state.enqueued.remove(id);
        state.waiting_on.remove(id);

        let mut effects = FinishEffects::default();
        if status == TaskStatus::Completed {
            effects.promoted = state.release_dependents(id);
        } else {
            effects.failed_dependents = state.fail_dependents(id);
        }
        Ok(effects)
    }

    /// Re-evaluate dependents of a completed task. Returns the promoted ids.
    ///
    /// [`finish`](Self::finish) already does this; calling it again is harmless.
    pub fn on_completed(&self, id: &TaskId) -> Vec<TaskId> {
        let mut state = self.state.lock();
        let completed = state
            .tasks
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Completed);
        if !completed {
            return Vec::new();
        }
        state.release_dependents(id)
    }

    /// Mark a task Cancelled and drop it from every internal structure.
    /// Returns the status it had before cancellation.
    pub fn cancel(&self, id: &TaskId) -> ConductorResult<(TaskStatus, FinishEffects)> {
        let previous = self.status(id)?;
        let effects = self.finish(id, TaskStatus::Cancelled)?;
        info!(task = %id, previous = %previous, "Task cancelled");
        Ok((previous, effects))
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.state.lock().tasks.get(id).cloned()
    }

    pub fn status(&self, id: &TaskId) -> ConductorResult<TaskStatus> {
        self.state
            .lock()
            .tasks
            .get(id)
            .map(|t| t.status.clone())
            .ok_or_else(|| ConductorError::UnknownTask(id.clone()))
    }

    /// Ids currently eligible, in dispatch order.
    pub fn queued_ids(&self) -> Vec<TaskId> {
        let state = self.state.lock();
        let mut keys: Vec<&QueueKey> = state
            .ready
            .iter()
            .filter(|k| state.enqueued.contains(&k.task_id))
            .collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys.into_iter().map(|k| k.task_id.clone()).collect()
    }

    pub fn counts(&self) -> SchedulerCounts {
        let state = self.state.lock();
        let mut counts = SchedulerCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Allocated => counts.allocated += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total_count(&self) -> usize {
        self.state.lock().tasks.len()
    }
}
