use crate::allocator::Allocator;
use crate::bus::CommunicationBus;
use crate::config::HandoffConfig;
use crate::message::{DeliveryMode, MessageId, MessagePriority, MessageType, SendRequest};
use crate::scheduler::Scheduler;
use crate::types::Allocation;
use chrono::{DateTime, Utc};
use conductor_core::{AgentId, ConductorError, ConductorResult, ResourceAmounts, TaskId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type HandoffId = Uuid;

/// Handoff lifecycle. `Initiated → {Accepted, Rejected, TimedOut, Cancelled}`,
/// `Accepted → {Completed, Rejected}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Initiated,
    Accepted,
    Rejected,
    TimedOut,
    Completed,
    /// The task was cancelled while the handoff was in flight.
    Cancelled,
}

impl HandoffStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandoffStatus::Rejected
                | HandoffStatus::TimedOut
                | HandoffStatus::Completed
                | HandoffStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Initiated => "initiated",
            HandoffStatus::Accepted => "accepted",
            HandoffStatus::Rejected => "rejected",
            HandoffStatus::TimedOut => "timed_out",
            HandoffStatus::Completed => "completed",
            HandoffStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for starting a handoff.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub task_id: TaskId,
    pub from: AgentId,
    pub to: AgentId,
    pub state_snapshot: serde_json::Value,
    pub intermediate_results: serde_json::Value,
    /// Amounts to move; defaults to everything the source holds for the task.
    pub resource_transfer: Option<ResourceAmounts>,
    pub reason: String,
    /// Overrides the configured acknowledgment timeout.
    pub timeout: Option<Duration>,
}

impl HandoffRequest {
    pub fn new(
        task_id: impl Into<TaskId>,
        from: impl Into<AgentId>,
        to: impl Into<AgentId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            from: from.into(),
            to: to.into(),
            state_snapshot: serde_json::Value::Null,
            intermediate_results: serde_json::Value::Null,
            resource_transfer: None,
            reason: reason.into(),
            timeout: None,
        }
    }

    pub fn with_state(mut self, snapshot: serde_json::Value) -> Self {
        self.state_snapshot = snapshot;
        self
    }

    pub fn with_intermediate_results(mut self, results: serde_json::Value) -> Self {
        self.intermediate_results = results;
        self
    }

    pub fn with_transfer(mut self, amounts: ResourceAmounts) -> Self {
        self.resource_transfer = Some(amounts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One ownership transfer of one allocation.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffRecord {
    pub id: HandoffId,
    pub task_id: TaskId,
    pub from: AgentId,
    pub to: AgentId,
    pub state_snapshot: serde_json::Value,
    pub intermediate_results: serde_json::Value,
    pub resource_transfer: ResourceAmounts,
    pub reason: String,
    pub status: HandoffStatus,
    /// The handoff-initiate message sent to the destination.
    pub message_id: Option<MessageId>,
    pub response_data: Option<serde_json::Value>,
    /// Why a handoff ended without completing.
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    deadline: Option<Instant>,
    #[serde(skip)]
    resolved_instant: Option<Instant>,
}

impl HandoffRecord {
    fn resolve(&mut self, status: HandoffStatus, failure: Option<String>) {
        self.status = status;
        self.failure = failure;
        self.resolved_at = Some(Utc::now());
        self.resolved_instant = Some(Instant::now());
        self.deadline = None;
    }

    fn expired_after(&self, now: Instant, retention: Duration) -> bool {
        self.status.is_terminal()
            && self
                .resolved_instant
                .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }
}

type RecordSlot = Arc<Mutex<HandoffRecord>>;

/// Moves in-flight tasks between agents.
///
/// The destination is asked over the bus (guaranteed mode) and the transfer
/// happens only when it accepts. Rejection and timeout release the allocation
/// and put the task back in the queue at its original position.
///
/// Each record sits behind its own lock. A handoff is claimed by changing its
/// status under that lock; the ledger transfer and scheduler calls run after
/// it is released. Resolved records are dropped once `retention_ms` passes.
pub struct HandoffManager {
    config: HandoffConfig,
    allocator: Arc<Allocator>,
    scheduler: Arc<Scheduler>,
    bus: Arc<CommunicationBus>,
    records: RwLock<HashMap<HandoffId, RecordSlot>>,
    /// The unresolved handoff of each task. Locked before `records`.
    active: Mutex<HashMap<TaskId, HandoffId>>,
}

impl HandoffManager {
    pub fn new(
        config: HandoffConfig,
        allocator: Arc<Allocator>,
        scheduler: Arc<Scheduler>,
        bus: Arc<CommunicationBus>,
    ) -> Self {
        Self {
            config,
            allocator,
            scheduler,
            bus,
            records: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, handoff_id: HandoffId) -> ConductorResult<RecordSlot> {
        self.records
            .read()
            .get(&handoff_id)
            .cloned()
            .ok_or_else(|| ConductorError::UnknownHandoff(handoff_id.to_string()))
    }

    /// Drop a resolved handoff from the per-task index.
    fn settle(&self, record: &HandoffRecord) {
        let mut active = self.active.lock();
        if active.get(&record.task_id) == Some(&record.id) {
            active.remove(&record.task_id);
        }
    }

    fn validate(&self, request: &HandoffRequest) -> ConductorResult<(Allocation, ResourceAmounts)> {
        if request.from == request.to {
            return Err(ConductorError::InvalidRequest(format!(
                "task {} cannot be handed off to its own agent",
                request.task_id
            )));
        }
        let task = self
            .scheduler
            .get(&request.task_id)
            .ok_or_else(|| ConductorError::UnknownTask(request.task_id.clone()))?;
        if !task.status.is_active() {
            return Err(ConductorError::InvalidState(format!(
                "task {} is {} and cannot be handed off",
                request.task_id, task.status
            )));
        }
        let allocation = self.allocator.allocation(&request.task_id).ok_or_else(|| {
            ConductorError::InvalidState(format!("task {} has no allocation", request.task_id))
        })?;
        if allocation.agent_id != request.from {
            return Err(ConductorError::InvalidState(format!(
                "task {} is owned by {}, not {}",
                request.task_id, allocation.agent_id, request.from
            )));
        }
        let destination = self
            .allocator
            .agent(&request.to)
            .ok_or_else(|| ConductorError::UnknownAgent(request.to.clone()))?;
        if !destination.can_serve(&task.spec.capabilities) {
            return Err(ConductorError::InvalidRequest(format!(
                "agent {} lacks the capabilities task {} needs",
                request.to, request.task_id
            )));
        }
        let held = allocation.held_on(&request.from);
        let transfer = request.resource_transfer.clone().unwrap_or_else(|| held.clone());
        if let Some((resource, quantity)) = transfer.first_invalid() {
            return Err(ConductorError::InvalidRequest(format!(
                "invalid {resource} transfer amount {quantity}"
            )));
        }
        if !transfer.fits_within(&held) {
            return Err(ConductorError::InvalidRequest(format!(
                "transfer for task {} exceeds what {} holds",
                request.task_id, request.from
            )));
        }
        Ok((allocation, transfer))
    }

    /// Start a handoff and ask the destination to accept it.
    pub async fn initiate(&self, request: HandoffRequest) -> ConductorResult<HandoffId> {
        let (_, transfer) = self.validate(&request)?;
        let timeout = request.timeout.unwrap_or_else(|| self.config.timeout());
        let id = Uuid::new_v4();
        let record = HandoffRecord {
            id,
            task_id: request.task_id.clone(),
            from: request.from.clone(),
            to: request.to.clone(),
            state_snapshot: request.state_snapshot.clone(),
            intermediate_results: request.intermediate_results.clone(),
            resource_transfer: transfer.clone(),
            reason: request.reason.clone(),
            status: HandoffStatus::Initiated,
            message_id: None,
            response_data: None,
            failure: None,
            created_at: Utc::now(),
            resolved_at: None,
            deadline: Some(Instant::now() + timeout),
            resolved_instant: None,
        };
        let slot = Arc::new(Mutex::new(record));
        {
            let mut active = self.active.lock();
            if active.contains_key(&request.task_id) {
                return Err(ConductorError::InvalidState(format!(
                    "task {} already has a handoff in flight",
                    request.task_id
                )));
            }
            active.insert(request.task_id.clone(), id);
            self.records.write().insert(id, slot.clone());
        }

        let message = SendRequest::new(
            request.from.clone(),
            vec![request.to.clone()],
            MessageType::HandoffInitiate,
            serde_json::json!({
                "handoff_id": id,
                "task_id": request.task_id,
                "from": request.from,
                "reason": request.reason,
                "state_snapshot": request.state_snapshot,
                "intermediate_results": request.intermediate_results,
                "resource_transfer": transfer,
            }),
        )
        .with_mode(DeliveryMode::Guaranteed)
        .with_priority(MessagePriority::High)
        .with_ttl(timeout);

        match self.bus.send(message).await {
            Ok(receipt) => {
                let cancelled = {
                    let mut record = slot.lock();
                    record.message_id = Some(receipt.message_id);
                    record.status.is_terminal()
                };
                if cancelled {
                    self.withdraw_offer(id, receipt.message_id);
                }
            }
            Err(e) => {
                self.records.write().remove(&id);
                let mut active = self.active.lock();
                if active.get(&request.task_id) == Some(&id) {
                    active.remove(&request.task_id);
                }
                return Err(e);
            }
        }

        info!(
            handoff = %id,
            task = %request.task_id,
            from = %request.from,
            to = %request.to,
            timeout_ms = timeout.as_millis() as u64,
            "Handoff initiated"
        );
        Ok(id)
    }

    /// Resolve a handoff with the destination's answer.
    ///
    /// On acceptance the resources move in one ledger step and the task is
    /// bound to the destination. If the destination cannot actually take the
    /// resources the handoff is Rejected, the task stays with the source, and
    /// `HandoffRejected` is returned. An explicit rejection re-queues the task
    /// and returns the Rejected record.
    pub async fn acknowledge(
        &self,
        handoff_id: HandoffId,
        accepted: bool,
        response_data: Option<serde_json::Value>,
    ) -> ConductorResult<HandoffRecord> {
        let slot = self.slot(handoff_id)?;
        let claimed = {
            let mut record = slot.lock();
            match record.status {
                HandoffStatus::Initiated => {}
                HandoffStatus::TimedOut => {
                    return Err(ConductorError::HandoffTimedOut(handoff_id.to_string()))
                }
                other => {
                    return Err(ConductorError::InvalidState(format!(
                        "handoff {handoff_id} is already {other}"
                    )))
                }
            }
            record.response_data = response_data;
            if accepted {
                record.status = HandoffStatus::Accepted;
            } else {
                let reason = format!("{} declined", record.to);
                record.resolve(HandoffStatus::Rejected, Some(reason));
            }
            record.clone()
        };

        if let Some(message_id) = claimed.message_id {
            if let Err(e) = self.bus.acknowledge(message_id) {
                debug!(handoff = %handoff_id, error = %e, "Handoff message was not acknowledgeable");
            }
        }

        let result = if accepted {
            self.complete_transfer(&slot, &claimed)
        } else {
            self.return_to_queue(&claimed.task_id);
            info!(handoff = %handoff_id, task = %claimed.task_id, to = %claimed.to, "Handoff rejected; task re-queued");
            Ok(())
        };

        let record = slot.lock().clone();
        self.settle(&record);
        self.notify_source(&record).await;
        result.map(|()| record)
    }

    fn complete_transfer(&self, slot: &RecordSlot, claimed: &HandoffRecord) -> ConductorResult<()> {
        let transferred = self.allocator.transfer(
            &claimed.task_id,
            &claimed.from,
            &claimed.to,
            &claimed.resource_transfer,
        );
        if transferred.is_ok() {
            if let Err(e) = self.scheduler.reassign(&claimed.task_id, &claimed.to) {
                warn!(task = %claimed.task_id, error = %e, "Could not record new owner");
            }
        }

        let mut record = slot.lock();
        if record.status != HandoffStatus::Accepted {
            // Cancelled while the transfer ran; the canceller released the allocation.
            return Err(ConductorError::InvalidState(format!(
                "handoff {} was {} during the transfer",
                record.id, record.status
            )));
        }
        match transferred {
            Ok(_) => {
                record.resolve(HandoffStatus::Completed, None);
                info!(
                    handoff = %record.id,
                    task = %record.task_id,
                    from = %record.from,
                    to = %record.to,
                    "Handoff completed"
                );
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                record.resolve(HandoffStatus::Rejected, Some(reason.clone()));
                warn!(handoff = %record.id, task = %record.task_id, error = %reason, "Handoff transfer failed; task stays with source");
                Err(ConductorError::HandoffRejected(format!("{}: {reason}", record.id)))
            }
        }
    }

    fn return_to_queue(&self, task_id: &TaskId) {
        self.allocator.release(task_id);
        if let Err(e) = self.scheduler.requeue(task_id) {
            warn!(task = %task_id, error = %e, "Could not re-queue task after handoff");
        }
    }

    /// Stop the bus from re-offering a handoff nobody can accept any more.
    fn withdraw_offer(&self, handoff_id: HandoffId, message_id: MessageId) {
        if let Err(e) = self.bus.withdraw(message_id, "handoff cancelled") {
            debug!(handoff = %handoff_id, error = %e, "Handoff offer not withdrawn");
        }
    }

    async fn notify_source(&self, record: &HandoffRecord) {
        let message = SendRequest::new(
            record.to.clone(),
            vec![record.from.clone()],
            MessageType::HandoffAcknowledge,
            serde_json::json!({
                "handoff_id": record.id,
                "task_id": record.task_id,
                "status": record.status,
                "response_data": record.response_data,
            }),
        )
        .with_mode(DeliveryMode::FireAndForget);
        if let Err(e) = self.bus.send(message).await {
            debug!(handoff = %record.id, error = %e, "Could not notify handoff source");
        }
    }

    /// Time out handoffs past their deadline using the current time.
    pub async fn sweep(&self) -> Vec<HandoffId> {
        self.sweep_at(Instant::now()).await
    }

    /// Time out every Initiated handoff whose deadline is at or before `now`
    /// and return their tasks to the queue as if rejected. Resolved records
    /// older than the retention period are dropped.
    pub async fn sweep_at(&self, now: Instant) -> Vec<HandoffId> {
        let slots: Vec<RecordSlot> = self.records.read().values().cloned().collect();
        let mut timed_out = Vec::new();
        for slot in slots {
            let mut record = slot.lock();
            if record.status == HandoffStatus::Initiated && record.deadline.is_some_and(|d| d <= now)
            {
                record.resolve(
                    HandoffStatus::TimedOut,
                    Some("no acknowledgment before deadline".to_string()),
                );
                timed_out.push(record.clone());
            }
        }

        for record in &timed_out {
            self.return_to_queue(&record.task_id);
            self.settle(record);
            warn!(handoff = %record.id, task = %record.task_id, to = %record.to, "Handoff timed out; task re-queued");
        }

        let retention = self.config.retention();
        let purged = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|_, slot| !slot.lock().expired_after(now, retention));
            before - records.len()
        };
        if purged > 0 {
            debug!(purged, "Resolved handoffs purged");
        }

        for record in &timed_out {
            self.notify_source(record).await;
        }
        timed_out.iter().map(|r| r.id).collect()
    }

    /// Invalidate any in-flight handoff for a task that was cancelled or
    /// finished. The offer is withdrawn from the bus and later
    /// acknowledgments from the destination are refused.
    pub fn cancel_for_task(&self, task_id: &TaskId) -> Option<HandoffId> {
        let handoff_id = self.active.lock().remove(task_id)?;
        let slot = self.slot(handoff_id).ok()?;
        let message_id = {
            let mut record = slot.lock();
            if record.status.is_terminal() {
                return None;
            }
            record.resolve(HandoffStatus::Cancelled, Some("task cancelled".to_string()));
            record.message_id
        };
        if let Some(message_id) = message_id {
            self.withdraw_offer(handoff_id, message_id);
        }
        info!(handoff = %handoff_id, task = %task_id, "Handoff cancelled");
        Some(handoff_id)
    }

    pub fn get(&self, handoff_id: HandoffId) -> Option<HandoffRecord> {
        self.slot(handoff_id).ok().map(|slot| slot.lock().clone())
    }

    pub fn for_task(&self, task_id: &TaskId) -> Vec<HandoffRecord> {
        let slots: Vec<RecordSlot> = self.records.read().values().cloned().collect();
        let mut found: Vec<HandoffRecord> = slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|r| &r.task_id == task_id)
            .collect();
        found.sort_by_key(|r| r.created_at);
        found
    }

    /// Number of handoffs in each status.
    pub fn counts(&self) -> BTreeMap<HandoffStatus, usize> {
        let mut counts = BTreeMap::new();
        for slot in self.records.read().values() {
            *counts.entry(slot.lock().status).or_insert(0) += 1;
        }
        counts
    }

    /// Records currently held, resolved or not.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
