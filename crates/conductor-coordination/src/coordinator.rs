use crate::allocator::Allocator;
use crate::bus::{CommunicationBus, Endpoint, SweepReport, BUS_SENDER};
use crate::config::CoordinatorConfig;
use crate::handoff::{HandoffId, HandoffManager, HandoffRecord, HandoffRequest};
use crate::ledger::ResourceLedger;
use crate::message::{
    DeliveryMode, DeliveryStatus, Envelope, MessageId, MessageType, SendReceipt, SendRequest,
};
use crate::metrics::{AgentMetricsView, MetricsRecorder, MetricsSnapshot};
use crate::performance::PerformanceTracker;
use crate::scheduler::Scheduler;
use crate::types::{AgentProfile, Allocation, CompletionOutcome, Task, TaskReport, TaskSpec, TaskStatus};
use chrono::Utc;
use conductor_core::{AgentId, ConductorError, ConductorResult, TaskId};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one allocation attempt during [`Coordinator::dispatch`].
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Allocated(Allocation),
    /// Left in the queue; `reason` is the allocation error.
    Deferred {
        task_id: TaskId,
        reason: String,
        recoverable: bool,
    },
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub bus: SweepReport,
    pub timed_out_handoffs: Vec<HandoffId>,
}

/// Public entry point of the coordination engine.
///
/// Owns the ledger, scheduler, allocator, performance tracker, bus and
/// handoff manager. Each keeps its own fine-grained locks; the coordinator
/// itself holds no global lock, so calls from independent submitters and
/// agent runtimes proceed in parallel.
pub struct Coordinator {
    config: CoordinatorConfig,
    ledger: Arc<ResourceLedger>,
    performance: Arc<PerformanceTracker>,
    scheduler: Arc<Scheduler>,
    allocator: Arc<Allocator>,
    bus: Arc<CommunicationBus>,
    handoffs: HandoffManager,
    metrics: MetricsRecorder,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> ConductorResult<Self> {
        config.validate()?;
        let ledger = Arc::new(ResourceLedger::new());
        let performance = Arc::new(PerformanceTracker::new(&config.performance));
        let scheduler = Arc::new(Scheduler::new());
        let allocator = Arc::new(Allocator::new(
            config.strategy,
            config.weights,
            ledger.clone(),
            performance.clone(),
        ));
        let bus = Arc::new(CommunicationBus::new(config.bus.clone()));
        let handoffs = HandoffManager::new(
            config.handoff.clone(),
            allocator.clone(),
            scheduler.clone(),
            bus.clone(),
        );
        info!(strategy = %config.strategy, auto_dispatch = config.auto_dispatch, "Coordinator created");
        Ok(Self {
            config,
            ledger,
            performance,
            scheduler,
            allocator,
            bus,
            handoffs,
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<CommunicationBus> {
        &self.bus
    }

    // ---- agents ----

    /// Fails with `DuplicateAgent` if the id is already registered.
    pub fn register_agent(&self, profile: AgentProfile) -> ConductorResult<()> {
        let id = profile.id.clone();
        self.allocator.register_agent(profile)?;
        self.metrics.heartbeat(&id);
        Ok(())
    }

    /// Remove an agent. Refused while it holds any allocation.
    pub fn deregister_agent(&self, agent: &AgentId) -> ConductorResult<AgentProfile> {
        let profile = self.allocator.deregister_agent(agent)?;
        self.bus.remove_endpoint(agent);
        self.metrics.remove_agent(agent);
        Ok(profile)
    }

    pub fn heartbeat(&self, agent: &AgentId) -> ConductorResult<()> {
        if self.allocator.agent(agent).is_none() {
            return Err(ConductorError::UnknownAgent(agent.clone()));
        }
        self.metrics.heartbeat(agent);
        Ok(())
    }

    /// Agents not heard from within `max_silence`. Removal is the caller's call.
    pub fn stale_agents(&self, max_silence: Duration) -> Vec<AgentId> {
        self.metrics.stale_agents(Instant::now(), max_silence)
    }

    pub fn agents(&self) -> Vec<AgentProfile> {
        self.allocator.agents()
    }

    // ---- tasks ----

    /// Accept a task. Returns its status at submission: Queued, Pending on
    /// unmet dependencies, or Failed when a dependency already failed.
    pub async fn submit_task(&self, spec: TaskSpec) -> ConductorResult<TaskStatus> {
        let status = self.scheduler.submit(spec)?;
        if self.config.auto_dispatch && status == TaskStatus::Queued {
            self.dispatch().await;
        }
        Ok(status)
    }

    /// Allocate one specific queued task now.
    ///
    /// Fails fast with `NoEligibleAgent` or `CapacityExceeded`; the task then
    /// stays queued at its original position.
    pub async fn allocate(&self, task_id: &TaskId) -> ConductorResult<Allocation> {
        let task = self.scheduler.take_queued(task_id)?;
        match self.bind(&task) {
            Ok(allocation) => {
                self.notify_assignment(&task, &allocation).await;
                Ok(allocation)
            }
            Err(e) => {
                if let Err(requeue) = self.scheduler.requeue(task_id) {
                    debug!(task = %task_id, error = %requeue, "Task left the queue during allocation");
                }
                Err(e)
            }
        }
    }

    fn bind(&self, task: &Task) -> ConductorResult<Allocation> {
        let allocation = self.allocator.allocate(task)?;
        if let Err(e) = self.scheduler.mark_allocated(task.id(), &allocation.agent_id) {
            // Cancelled between dequeue and commit.
            self.allocator.release(task.id());
            return Err(e);
        }
        let latency = (Utc::now() - task.submitted_at).num_milliseconds() as f64;
        self.metrics.record_allocation(latency);
        Ok(allocation)
    }

    /// Allocate every eligible task in priority order.
    ///
    /// A task that cannot be placed does not block the ones behind it. It
    /// goes straight back to its original position, where a concurrent pass
    /// can pick it up; this pass only skips it. When capacity was freed while
    /// the pass ran, the deferred tasks get another pass, so a release racing
    /// with a deferral never strands a task in an idle queue.
    pub async fn dispatch(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        let mut assigned = Vec::new();
        let deferred_total = loop {
            let generation = self.ledger.generation();
            let mut deferred = HashSet::new();
            while let Some(task) = self.scheduler.next_eligible_except(&deferred) {
                match self.bind(&task) {
                    Ok(allocation) => {
                        outcomes.push(DispatchOutcome::Allocated(allocation.clone()));
                        assigned.push((task, allocation));
                    }
                    Err(e) => {
                        debug!(task = %task.id(), error = %e, "Dispatch deferred task");
                        outcomes.push(DispatchOutcome::Deferred {
                            task_id: task.id().clone(),
                            reason: e.to_string(),
                            recoverable: e.is_recoverable(),
                        });
                        if let Err(e) = self.scheduler.requeue(task.id()) {
                            debug!(task = %task.id(), error = %e, "Deferred task not re-queued");
                        }
                        deferred.insert(task.id().clone());
                    }
                }
            }
            if deferred.is_empty() || self.ledger.generation() == generation {
                break deferred.len();
            }
            debug!(deferred = deferred.len(), "Capacity changed during dispatch; retrying deferred tasks");
        };
        for (task, allocation) in &assigned {
            self.notify_assignment(task, allocation).await;
        }
        if !outcomes.is_empty() {
            info!(
                allocated = assigned.len(),
                deferred = deferred_total,
                "Dispatch pass finished"
            );
        }
        outcomes
    }

    async fn notify_assignment(&self, task: &Task, allocation: &Allocation) {
        if !self.bus.has_endpoint(&allocation.agent_id) {
            return;
        }
        let request = SendRequest::new(
            BUS_SENDER,
            vec![allocation.agent_id.clone()],
            MessageType::TaskRequest,
            serde_json::json!({
                "task_id": task.id(),
                "task_type": task.spec.task_type,
                "priority": task.priority(),
                "resources": allocation.committed(),
                "estimated_duration_ms": task.spec.estimated_duration.as_millis() as u64,
            }),
        )
        .with_mode(DeliveryMode::Asynchronous);
        if let Err(e) = self.bus.send(request).await {
            warn!(task = %task.id(), agent = %allocation.agent_id, error = %e, "Task notification failed");
        }
    }

    /// Allocated → Running, signalled by the agent runtime.
    pub fn start_task(&self, task_id: &TaskId) -> ConductorResult<()> {
        self.scheduler.mark_running(task_id)?;
        debug!(task = %task_id, "Task running");
        Ok(())
    }

    /// Record a task's outcome, release its resources and learn from it.
    ///
    /// Only an Allocated or Running task changes; anything else returns
    /// `AlreadyCompleted` with its current status.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        report: TaskReport,
    ) -> ConductorResult<CompletionOutcome> {
        let Some(task) = self.scheduler.get(task_id) else {
            return Err(ConductorError::UnknownTask(task_id.clone()));
        };
        if !task.status.is_active() {
            return Ok(CompletionOutcome::AlreadyCompleted(task.status));
        }

        let status = if report.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed {
                reason: report
                    .metrics
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported failure")
                    .to_string(),
            }
        };
        // The scheduler transition decides the winner of concurrent completions.
        let effects = match self.scheduler.finish(task_id, status.clone()) {
            Ok(effects) => effects,
            Err(ConductorError::InvalidState(_)) => {
                let current = self.scheduler.status(task_id)?;
                return Ok(CompletionOutcome::AlreadyCompleted(current));
            }
            Err(e) => return Err(e),
        };

        self.handoffs.cancel_for_task(task_id);
        let owner = self
            .allocator
            .release(task_id)
            .map(|a| a.agent_id)
            .or(task.assigned_to);
        if let Some(agent) = &owner {
            match self.performance.record(
                agent,
                &task.spec.task_type,
                report.success,
                task.spec.estimated_duration,
                report.execution_time,
            ) {
                Ok(score) => debug!(agent = %agent, score, "Score updated"),
                Err(e) => warn!(agent = %agent, error = %e, "Outcome not recorded"),
            }
        }
        self.metrics.record_completion(report.success);

        info!(
            task = %task_id,
            agent = owner.as_ref().map(|a| a.as_str()).unwrap_or("-"),
            status = %status,
            execution_ms = report.execution_time.as_millis() as u64,
            promoted = effects.promoted.len(),
            failed_dependents = effects.failed_dependents.len(),
            "Task finished"
        );

        if self.config.auto_dispatch {
            self.dispatch().await;
        }
        Ok(CompletionOutcome::Recorded(status))
    }

    /// Cancel a task in any non-terminal status. An allocation is released
    /// immediately and an in-flight handoff is invalidated. Returns the
    /// status the task had before.
    pub async fn cancel_task(&self, task_id: &TaskId) -> ConductorResult<TaskStatus> {
        let (previous, effects) = self.scheduler.cancel(task_id)?;
        self.handoffs.cancel_for_task(task_id);
        if let Some(allocation) = self.allocator.release(task_id) {
            let notice = SendRequest::new(
                BUS_SENDER,
                vec![allocation.agent_id.clone()],
                MessageType::StatusUpdate,
                serde_json::json!({"task_id": task_id, "status": "cancelled"}),
            )
            .with_mode(DeliveryMode::FireAndForget);
            if self.bus.has_endpoint(&allocation.agent_id) {
                if let Err(e) = self.bus.send(notice).await {
                    debug!(task = %task_id, error = %e, "Cancellation notice not sent");
                }
            }
        }
        if !effects.failed_dependents.is_empty() {
            info!(task = %task_id, dependents = ?effects.failed_dependents, "Dependents failed after cancellation");
        }
        if self.config.auto_dispatch && previous.is_active() {
            self.dispatch().await;
        }
        Ok(previous)
    }

    pub fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.scheduler.get(task_id)
    }

    pub fn task_status(&self, task_id: &TaskId) -> ConductorResult<TaskStatus> {
        self.scheduler.status(task_id)
    }

    pub fn allocation(&self, task_id: &TaskId) -> Option<Allocation> {
        self.allocator.allocation(task_id)
    }

    /// Eligible tasks in dispatch order.
    pub fn queued_tasks(&self) -> Vec<TaskId> {
        self.scheduler.queued_ids()
    }

    // ---- messaging ----

    pub async fn send_message(&self, request: SendRequest) -> ConductorResult<SendReceipt> {
        self.bus.send(request).await
    }

    pub fn acknowledge(&self, message_id: MessageId) -> ConductorResult<()> {
        self.bus.acknowledge(message_id)
    }

    pub async fn respond(
        &self,
        request_id: MessageId,
        responder: &AgentId,
        payload: serde_json::Value,
    ) -> ConductorResult<MessageId> {
        self.bus.respond(request_id, responder, payload).await
    }

    pub fn open_mailbox(&self, agent: &AgentId) -> mpsc::Receiver<Envelope> {
        self.bus.open_mailbox(agent)
    }

    pub fn register_endpoint(&self, agent: &AgentId, endpoint: Arc<dyn Endpoint>) {
        self.bus.register_endpoint(agent, endpoint);
    }

    pub fn message_status(&self, message_id: MessageId) -> Option<DeliveryStatus> {
        self.bus.message_status(message_id)
    }

    pub fn watch_message(&self, message_id: MessageId) -> Option<watch::Receiver<DeliveryStatus>> {
        self.bus.watch_message(message_id)
    }

    // ---- handoffs ----

    pub async fn initiate_handoff(&self, request: HandoffRequest) -> ConductorResult<HandoffId> {
        self.handoffs.initiate(request).await
    }

    pub async fn acknowledge_handoff(
        &self,
        handoff_id: HandoffId,
        accepted: bool,
        response_data: Option<serde_json::Value>,
    ) -> ConductorResult<HandoffRecord> {
        let result = self
            .handoffs
            .acknowledge(handoff_id, accepted, response_data)
            .await;
        if self.config.auto_dispatch && !accepted && result.is_ok() {
            self.dispatch().await;
        }
        result
    }

    pub fn handoff(&self, handoff_id: HandoffId) -> Option<HandoffRecord> {
        self.handoffs.get(handoff_id)
    }

    // ---- maintenance ----

    pub async fn sweep(&self) -> MaintenanceReport {
        self.sweep_at(Instant::now()).await
    }

    /// Run the bus retry/TTL sweep and the handoff timeout sweep as of `now`.
    pub async fn sweep_at(&self, now: Instant) -> MaintenanceReport {
        let bus = self.bus.sweep_at(now).await;
        let timed_out_handoffs = self.handoffs.sweep_at(now).await;
        if self.config.auto_dispatch && !timed_out_handoffs.is_empty() {
            self.dispatch().await;
        }
        MaintenanceReport {
            bus,
            timed_out_handoffs,
        }
    }

    /// Sweep on a fixed interval until the coordinator is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    debug!("Coordinator dropped; maintenance loop exiting");
                    break;
                };
                let report = coordinator.sweep().await;
                if !report.bus.expired.is_empty()
                    || !report.bus.failed.is_empty()
                    || !report.timed_out_handoffs.is_empty()
                {
                    info!(
                        expired = report.bus.expired.len(),
                        failed = report.bus.failed.len(),
                        redelivered = report.bus.redelivered.len(),
                        handoffs_timed_out = report.timed_out_handoffs.len(),
                        "Maintenance sweep"
                    );
                }
            }
        })
    }

    // ---- metrics ----

    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        let agents = self
            .allocator
            .agents()
            .into_iter()
            .map(|profile| {
                let stats = self.performance.stats(&profile.id);
                AgentMetricsView {
                    utilization: self.ledger.utilization(&profile.id, None).unwrap_or(0.0),
                    in_use: self.ledger.in_use(&profile.id).unwrap_or_default(),
                    performance_score: stats.as_ref().map(|s| s.score).unwrap_or(0.0),
                    queue_depth: self.allocator.allocation_count(&profile.id),
                    completed: stats.as_ref().map(|s| s.completed).unwrap_or(0),
                    failed: stats.as_ref().map(|s| s.failed).unwrap_or(0),
                    last_heartbeat: self.metrics.last_heartbeat(&profile.id),
                    agent_type: profile.agent_type,
                    max_capacity: profile.max_capacity,
                    agent_id: profile.id,
                }
            })
            .collect();
        let (throughput_per_sec, success_rate, avg_coordination_latency_ms) = self.metrics.rates();
        MetricsSnapshot {
            generated_at: Utc::now(),
            uptime_ms: self.metrics.uptime().as_millis() as u64,
            strategy: self.allocator.strategy().to_string(),
            agents,
            tasks: self.scheduler.counts(),
            throughput_per_sec,
            success_rate,
            avg_coordination_latency_ms,
            messages_in_flight: self.bus.in_flight(),
            handoffs: self
                .handoffs
                .counts()
                .into_iter()
                .map(|(status, n)| (status.to_string(), n))
                .collect(),
        }
    }
}
