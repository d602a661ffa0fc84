use crate::config::BusConfig;
use crate::message::{
    DeliveryMode, DeliveryStatus, Envelope, MessageId, MessagePriority, MessageType, SendReceipt,
    SendRequest,
};
use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{AgentId, ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender id used for reports the bus itself emits.
pub const BUS_SENDER: &str = "conductor";

/// Something that can receive envelopes on behalf of an agent.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> ConductorResult<()>;
}

/// Bounded in-process mailbox; the agent runtime holds the receiving end.
pub struct MailboxEndpoint {
    tx: mpsc::Sender<Envelope>,
}

impl MailboxEndpoint {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Endpoint for MailboxEndpoint {
    async fn deliver(&self, envelope: Envelope) -> ConductorResult<()> {
        let id = envelope.id;
        self.tx.try_send(envelope).map_err(|e| ConductorError::DeliveryFailed {
            message: id.to_string(),
            reason: match e {
                mpsc::error::TrySendError::Full(_) => "mailbox full".to_string(),
                mpsc::error::TrySendError::Closed(_) => "mailbox closed".to_string(),
            },
        })
    }
}

struct MessageRecord {
    envelope: Envelope,
    seq: u64,
    /// Delivery attempts made so far.
    attempts: u32,
    next_attempt_at: Option<Instant>,
    expires_at: Instant,
    finished_at: Option<Instant>,
    last_error: Option<String>,
    status: watch::Sender<DeliveryStatus>,
    responder: Option<oneshot::Sender<Envelope>>,
}

impl MessageRecord {
    fn current(&self) -> DeliveryStatus {
        self.status.borrow().clone()
    }

    fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    fn set_status(&self, status: DeliveryStatus) {
        self.status.send_replace(status);
    }

    fn finish(&mut self, status: DeliveryStatus, now: Instant) {
        self.set_status(status);
        self.finished_at = Some(now);
        self.next_attempt_at = None;
        self.responder = None;
    }

    /// Whether the sender is owed a failure report.
    fn reports_failures(&self) -> bool {
        matches!(
            self.envelope.mode,
            DeliveryMode::Guaranteed | DeliveryMode::Synchronous
        )
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub redelivered: Vec<MessageId>,
    pub expired: Vec<MessageId>,
    pub failed: Vec<MessageId>,
    pub purged: usize,
}

struct Redelivery {
    seq: u64,
    envelope: Envelope,
}

/// Routes messages between agents with per-send delivery guarantees.
///
/// Retries and TTLs are explicit deadlines on each message record, advanced
/// by [`sweep_at`](Self::sweep_at). The sweep only touches message state;
/// outcomes reach senders through the id-keyed status channel
/// ([`watch_message`](Self::watch_message)) and an `ErrorReport` message.
pub struct CommunicationBus {
    config: BusConfig,
    endpoints: RwLock<HashMap<AgentId, Arc<dyn Endpoint>>>,
    messages: Mutex<HashMap<MessageId, MessageRecord>>,
    seq: AtomicU64,
}

impl CommunicationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn register_endpoint(&self, agent: &AgentId, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.write().insert(agent.clone(), endpoint);
    }

    /// Register a bounded mailbox for `agent`, replacing any previous endpoint.
    pub fn open_mailbox(&self, agent: &AgentId) -> mpsc::Receiver<Envelope> {
        let (endpoint, rx) = MailboxEndpoint::new(self.config.mailbox_capacity);
        self.register_endpoint(agent, Arc::new(endpoint));
        rx
    }

    pub fn remove_endpoint(&self, agent: &AgentId) {
        self.endpoints.write().remove(agent);
    }

    pub fn has_endpoint(&self, agent: &AgentId) -> bool {
        self.endpoints.read().contains_key(agent)
    }

    fn resolve_recipients(&self, request: &SendRequest) -> ConductorResult<Vec<AgentId>> {
        if request.recipients.is_empty() {
            if request.message_type == MessageType::Broadcast {
                let mut all: Vec<AgentId> = self
                    .endpoints
                    .read()
                    .keys()
                    .filter(|id| **id != request.sender)
                    .cloned()
                    .collect();
                all.sort();
                return Ok(all);
            }
            return Err(ConductorError::InvalidRequest(
                "a message needs at least one recipient".to_string(),
            ));
        }
        let mut ordered: Vec<AgentId> = Vec::with_capacity(request.recipients.len());
        for recipient in &request.recipients {
            if !ordered.contains(recipient) {
                ordered.push(recipient.clone());
            }
        }
        Ok(ordered)
    }

    /// Hand the envelope to each recipient's endpoint, in order.
    async fn deliver_to(&self, envelope: &Envelope) -> (usize, Option<String>) {
        let mut delivered = 0;
        let mut last_error = None;
        for recipient in &envelope.recipients {
            let endpoint = self.endpoints.read().get(recipient).cloned();
            let result = match endpoint {
                Some(endpoint) => endpoint.deliver(envelope.clone()).await,
                None => Err(ConductorError::UnknownAgent(recipient.clone())),
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(message = %envelope.id, recipient = %recipient, error = %e, "Delivery attempt failed");
                    last_error = Some(format!("{recipient}: {e}"));
                }
            }
        }
        (delivered, last_error)
    }

    /// Send a message under the requested delivery mode.
    ///
    /// Fire-and-forget, asynchronous and guaranteed sends return as soon as
    /// the first attempt is made. Synchronous sends wait for a response sent
    /// with [`respond`](Self::respond) and fail with `DeliveryTimeout` when
    /// none arrives in time.
    pub async fn send(&self, request: SendRequest) -> ConductorResult<SendReceipt> {
        let recipients = self.resolve_recipients(&request)?;
        let ttl = request.ttl.unwrap_or_else(|| self.config.default_ttl());
        let now = Instant::now();
        let id = Uuid::new_v4();
        let envelope = Envelope {
            id,
            sender: request.sender.clone(),
            recipients,
            message_type: request.message_type,
            payload: request.payload,
            priority: request.priority,
            mode: request.mode,
            requires_ack: request.requires_ack || request.mode == DeliveryMode::Guaranteed,
            correlation_id: request.correlation_id,
            created_at: Utc::now(),
            ttl_ms: ttl.as_millis() as u64,
            attempt: 1,
        };

        if request.mode == DeliveryMode::FireAndForget {
            let (delivered, _) = self.deliver_to(&envelope).await;
            debug!(message = %id, delivered, "Fire-and-forget message sent");
            return Ok(SendReceipt {
                message_id: id,
                response: None,
            });
        }

        let (status_tx, _) = watch::channel(DeliveryStatus::Pending);
        let (responder, response_rx) = if request.mode == DeliveryMode::Synchronous {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        // Track before delivering so a fast reply or ack finds the record.
        self.messages.lock().insert(
            id,
            MessageRecord {
                envelope: envelope.clone(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                attempts: 0,
                next_attempt_at: None,
                expires_at: now + ttl,
                finished_at: None,
                last_error: None,
                status: status_tx,
                responder,
            },
        );

        let (delivered, last_error) = self.deliver_to(&envelope).await;
        self.record_first_attempt(id, delivered > 0, last_error.clone());
        info!(
            message = %id,
            sender = %envelope.sender,
            message_type = ?envelope.message_type,
            mode = ?envelope.mode,
            delivered,
            "Message sent"
        );

        let Some(response_rx) = response_rx else {
            return Ok(SendReceipt {
                message_id: id,
                response: None,
            });
        };

        if delivered == 0 {
            return Err(ConductorError::DeliveryFailed {
                message: id.to_string(),
                reason: last_error.unwrap_or_else(|| "no recipient accepted".to_string()),
            });
        }

        let timeout = request
            .timeout
            .unwrap_or_else(|| self.config.sync_timeout())
            .min(ttl);
        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => Ok(SendReceipt {
                message_id: id,
                response: Some(response),
            }),
            // Responder dropped before answering: report why the record ended.
            Ok(Err(_)) => Err(match self.message_status(id) {
                Some(DeliveryStatus::Expired) => ConductorError::TtlExpired(id.to_string()),
                Some(DeliveryStatus::Failed { reason }) => ConductorError::DeliveryFailed {
                    message: id.to_string(),
                    reason,
                },
                _ => ConductorError::DeliveryTimeout(id.to_string()),
            }),
            Err(_) => {
                if let Some(record) = self.messages.lock().get_mut(&id) {
                    record.responder = None;
                    if !record.is_finished() {
                        record.finish(
                            DeliveryStatus::Failed {
                                reason: format!("no response within {}ms", timeout.as_millis()),
                            },
                            Instant::now(),
                        );
                    }
                }
                warn!(message = %id, timeout_ms = timeout.as_millis() as u64, "Synchronous send timed out");
                Err(ConductorError::DeliveryTimeout(id.to_string()))
            }
        }
    }

    fn record_first_attempt(&self, id: MessageId, delivered: bool, last_error: Option<String>) {
        let mut messages = self.messages.lock();
        let Some(record) = messages.get_mut(&id) else {
            return;
        };
        record.attempts = 1;
        record.last_error = last_error.clone();
        if record.is_finished() {
            return;
        }
        let now = Instant::now();
        match record.envelope.mode {
            DeliveryMode::Guaranteed => {
                if delivered {
                    record.set_status(DeliveryStatus::Delivered);
                }
                record.next_attempt_at = Some(now + self.config.retry.backoff(0));
            }
            DeliveryMode::Asynchronous | DeliveryMode::Synchronous => {
                if delivered {
                    record.set_status(DeliveryStatus::Delivered);
                    if !record.envelope.requires_ack
                        && record.envelope.mode == DeliveryMode::Asynchronous
                    {
                        record.finished_at = Some(now);
                    }
                } else {
                    record.finish(
                        DeliveryStatus::Failed {
                            reason: last_error.unwrap_or_else(|| "no recipient accepted".into()),
                        },
                        now,
                    );
                }
            }
            DeliveryMode::FireAndForget => {}
        }
    }

    /// Confirm receipt of a message, cancelling any pending retry.
    ///
    /// Acknowledging twice is accepted; acknowledging after expiry or final
    /// failure reports that outcome instead. A synchronous sender keeps
    /// waiting for [`respond`](Self::respond) after the acknowledgment.
    pub fn acknowledge(&self, message_id: MessageId) -> ConductorResult<()> {
        let mut messages = self.messages.lock();
        let record = messages
            .get_mut(&message_id)
            .ok_or_else(|| ConductorError::UnknownMessage(message_id.to_string()))?;
        match record.current() {
            DeliveryStatus::Acknowledged => Ok(()),
            DeliveryStatus::Expired => Err(ConductorError::TtlExpired(message_id.to_string())),
            DeliveryStatus::Failed { reason } => Err(ConductorError::DeliveryFailed {
                message: message_id.to_string(),
                reason,
            }),
            DeliveryStatus::Pending | DeliveryStatus::Delivered => {
                let waiter = record.responder.take();
                record.finish(DeliveryStatus::Acknowledged, Instant::now());
                record.responder = waiter;
                debug!(message = %message_id, "Message acknowledged");
                Ok(())
            }
        }
    }

    /// Stop tracking a message the sender no longer needs delivered.
    ///
    /// Pending retries are cancelled and the record ends Failed with
    /// `reason`; no `ErrorReport` is sent. Messages that already reached an
    /// outcome are left as they are.
    pub fn withdraw(&self, message_id: MessageId, reason: &str) -> ConductorResult<()> {
        let mut messages = self.messages.lock();
        let record = messages
            .get_mut(&message_id)
            .ok_or_else(|| ConductorError::UnknownMessage(message_id.to_string()))?;
        if record.is_finished() {
            return Ok(());
        }
        record.finish(
            DeliveryStatus::Failed {
                reason: reason.to_string(),
            },
            Instant::now(),
        );
        debug!(message = %message_id, reason, "Message withdrawn");
        Ok(())
    }

    /// Answer a request. Completes a waiting synchronous send, or delivers a
    /// `TaskResponse` to the requester otherwise. Either way the request is
    /// acknowledged.
    pub async fn respond(
        &self,
        request_id: MessageId,
        responder: &AgentId,
        payload: serde_json::Value,
    ) -> ConductorResult<MessageId> {
        let (requester, waiter) = {
            let mut messages = self.messages.lock();
            let record = messages
                .get_mut(&request_id)
                .ok_or_else(|| ConductorError::UnknownMessage(request_id.to_string()))?;
            if let DeliveryStatus::Expired = record.current() {
                return Err(ConductorError::TtlExpired(request_id.to_string()));
            }
            (record.envelope.sender.clone(), record.responder.take())
        };

        let request = SendRequest::new(
            responder.clone(),
            vec![requester.clone()],
            MessageType::TaskResponse,
            payload,
        )
        .correlated_with(request_id);

        let response_id = match waiter {
            Some(waiter) => {
                let envelope = Envelope {
                    id: Uuid::new_v4(),
                    sender: responder.clone(),
                    recipients: vec![requester],
                    message_type: MessageType::TaskResponse,
                    payload: request.payload,
                    priority: MessagePriority::Normal,
                    mode: DeliveryMode::Synchronous,
                    requires_ack: false,
                    correlation_id: Some(request_id),
                    created_at: Utc::now(),
                    ttl_ms: self.config.default_ttl_ms,
                    attempt: 1,
                };
                let id = envelope.id;
                if waiter.send(envelope).is_err() {
                    warn!(message = %request_id, "Response sent but requester stopped waiting");
                }
                id
            }
            None => self.send(request).await?.message_id,
        };

        match self.acknowledge(request_id) {
            Ok(()) | Err(ConductorError::DeliveryFailed { .. }) => Ok(response_id),
            Err(e) => Err(e),
        }
    }

    pub fn message_status(&self, message_id: MessageId) -> Option<DeliveryStatus> {
        self.messages.lock().get(&message_id).map(MessageRecord::current)
    }

    /// Subscribe to a message's delivery status.
    pub fn watch_message(&self, message_id: MessageId) -> Option<watch::Receiver<DeliveryStatus>> {
        self.messages
            .lock()
            .get(&message_id)
            .map(|r| r.status.subscribe())
    }

    /// Wait until a tracked message reaches a final status.
    pub async fn wait_final(&self, message_id: MessageId) -> ConductorResult<DeliveryStatus> {
        let mut rx = self
            .watch_message(message_id)
            .ok_or_else(|| ConductorError::UnknownMessage(message_id.to_string()))?;
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_final() {
                return Ok(current);
            }
            if rx.changed().await.is_err() {
                // Record purged; the last observed value is all there is.
                return Ok(rx.borrow().clone());
            }
        }
    }

    /// Tracked messages that have not reached a final outcome.
    pub fn in_flight(&self) -> usize {
        self.messages
            .lock()
            .values()
            .filter(|r| !r.is_finished())
            .count()
    }

    /// Sweep using the current time.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Expire messages past their TTL, fail guaranteed messages out of
    /// retries, redeliver those whose backoff elapsed, and purge finished
    /// records past retention.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut due: Vec<Redelivery> = Vec::new();
        let mut failure_notices: Vec<(AgentId, MessageId, &'static str, String)> = Vec::new();
        let max_attempts = self.config.retry.max_retries + 1;
        let retention = self.config.retention();

        {
            let mut messages = self.messages.lock();
            for (id, record) in messages.iter_mut() {
                if record.is_finished() {
                    continue;
                }
                if now >= record.expires_at {
                    record.finish(DeliveryStatus::Expired, now);
                    report.expired.push(*id);
                    warn!(message = %id, "Message TTL expired");
                    if record.reports_failures() {
                        failure_notices.push((
                            record.envelope.sender.clone(),
                            *id,
                            "ttl_expired",
                            "time-to-live elapsed before acknowledgment".to_string(),
                        ));
                    }
                    continue;
                }
                let Some(next) = record.next_attempt_at else {
                    continue;
                };
                if now < next {
                    continue;
                }
                if record.attempts >= max_attempts {
                    let reason = record
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "not acknowledged".to_string());
                    record.finish(
                        DeliveryStatus::Failed {
                            reason: format!("{} attempts: {reason}", record.attempts),
                        },
                        now,
                    );
                    report.failed.push(*id);
                    warn!(message = %id, attempts = record.attempts, "Guaranteed delivery failed");
                    failure_notices.push((record.envelope.sender.clone(), *id, "delivery_failed", reason));
                    continue;
                }
                record.next_attempt_at = None;
                let mut envelope = record.envelope.clone();
                envelope.attempt = record.attempts + 1;
                due.push(Redelivery {
                    seq: record.seq,
                    envelope,
                });
            }

            let before = messages.len();
            messages.retain(|_, r| match r.finished_at {
                Some(at) => now.saturating_duration_since(at) < retention,
                None => true,
            });
            report.purged = before - messages.len();
        }

        due.sort_by(|a, b| {
            b.envelope
                .priority
                .cmp(&a.envelope.priority)
                .then_with(|| a.seq.cmp(&b.seq))
        });
        for redelivery in due {
            let id = redelivery.envelope.id;
            let (delivered, last_error) = self.deliver_to(&redelivery.envelope).await;
            let mut messages = self.messages.lock();
            if let Some(record) = messages.get_mut(&id) {
                record.attempts += 1;
                if last_error.is_some() {
                    record.last_error = last_error;
                }
                if !record.is_finished() {
                    if delivered > 0 && record.current() == DeliveryStatus::Pending {
                        record.set_status(DeliveryStatus::Delivered);
                    }
                    let backoff = self.config.retry.backoff(record.attempts - 1);
                    record.next_attempt_at = Some(now + backoff);
                    debug!(message = %id, attempt = record.attempts, backoff_ms = backoff.as_millis() as u64, "Redelivered");
                }
            }
            report.redelivered.push(id);
        }

        for (sender, message_id, kind, reason) in failure_notices {
            self.notify_sender(&sender, message_id, kind, &reason).await;
        }
        report
    }

    /// Best-effort `ErrorReport` to the original sender.
    async fn notify_sender(&self, sender: &AgentId, message_id: MessageId, kind: &str, reason: &str) {
        if !self.has_endpoint(sender) {
            return;
        }
        let request = SendRequest::new(
            BUS_SENDER,
            vec![sender.clone()],
            MessageType::ErrorReport,
            serde_json::json!({
                "message_id": message_id,
                "error": kind,
                "reason": reason,
            }),
        )
        .with_mode(DeliveryMode::FireAndForget)
        .with_priority(MessagePriority::High)
        .correlated_with(message_id);
        if let Err(e) = self.send(request).await {
            debug!(sender = %sender, error = %e, "Could not report delivery failure");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Endpoint that counts deliveries and optionally fails every one.
    struct CountingEndpoint {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Endpoint for CountingEndpoint {
        async fn deliver(&self, envelope: Envelope) -> ConductorResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ConductorError::DeliveryFailed {
                    message: envelope.id.to_string(),
                    reason: "offline".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn bus() -> CommunicationBus {
        CommunicationBus::new(BusConfig {
            retry: RetryPolicy {
                max_retries: 2,
                backoff_base_ms: 100,
                backoff_max_ms: 1_000,
            },
            ..BusConfig::default()
        })
    }

    fn counting(bus: &CommunicationBus, agent: &str, fail: bool) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        bus.register_endpoint(
            &AgentId::from(agent),
            Arc::new(CountingEndpoint {
                count: count.clone(),
                fail,
            }),
        );
        count
    }

    fn request(to: &str, mode: DeliveryMode) -> SendRequest {
        SendRequest::new(
            "sender",
            vec![AgentId::from(to)],
            MessageType::StatusUpdate,
            serde_json::json!({"step": 1}),
        )
        .with_mode(mode)
    }

    #[tokio::test]
    async fn test_mailbox_delivery() {
        let bus = bus();
        let mut rx = bus.open_mailbox(&AgentId::from("b"));
        let receipt = bus.send(request("b", DeliveryMode::Asynchronous)).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id, receipt.message_id);
        assert_eq!(envelope.payload["step"], 1);
        assert_eq!(bus.message_status(receipt.message_id), Some(DeliveryStatus::Delivered));
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_untracked() {
        let bus = bus();
        let count = counting(&bus, "b", true);
        let receipt = bus.send(request("b", DeliveryMode::FireAndForget)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.message_status(receipt.message_id).is_none());
        assert!(bus.acknowledge(receipt.message_id).is_err());
    }

    #[tokio::test]
    async fn test_async_failure_is_recorded_once() {
        let bus = bus();
        let count = counting(&bus, "b", true);
        let receipt = bus.send(request("b", DeliveryMode::Asynchronous)).await.unwrap();
        assert!(matches!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Failed { .. })
        ));
        bus.sweep_at(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_recipients_rejected() {
        let bus = bus();
        let req = SendRequest::new("a", vec![], MessageType::StatusUpdate, serde_json::Value::Null);
        assert!(matches!(
            bus.send(req).await.unwrap_err(),
            ConductorError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_but_sender() {
        let bus = bus();
        let a = counting(&bus, "a", false);
        let b = counting(&bus, "b", false);
        let c = counting(&bus, "c", false);
        let req = SendRequest::new("a", vec![], MessageType::Broadcast, serde_json::json!("hi"));
        bus.send(req).await.unwrap();
        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guaranteed_retries_until_acknowledged() {
        let bus = bus();
        let count = counting(&bus, "b", false);
        let start = Instant::now();
        let receipt = bus.send(request("b", DeliveryMode::Guaranteed)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let report = bus.sweep_at(start + Duration::from_millis(150)).await;
        assert_eq!(report.redelivered, vec![receipt.message_id]);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bus.acknowledge(receipt.message_id).unwrap();
        let report = bus.sweep_at(start + Duration::from_secs(2)).await;
        assert!(report.redelivered.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Acknowledged)
        );
    }

    #[tokio::test]
    async fn test_guaranteed_fails_after_max_retries() {
        let bus = bus();
        let count = counting(&bus, "b", true);
        let mut sender_box = bus.open_mailbox(&AgentId::from("sender"));
        let start = Instant::now();
        let receipt = bus.send(request("b", DeliveryMode::Guaranteed)).await.unwrap();

        // Backoff 100ms then 200ms; third due check fails the message.
        bus.sweep_at(start + Duration::from_millis(150)).await;
        bus.sweep_at(start + Duration::from_millis(400)).await;
        let report = bus.sweep_at(start + Duration::from_millis(900)).await;
        assert_eq!(report.failed, vec![receipt.message_id]);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(matches!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Failed { .. })
        ));

        let notice = sender_box.recv().await.unwrap();
        assert_eq!(notice.message_type, MessageType::ErrorReport);
        assert_eq!(notice.correlation_id, Some(receipt.message_id));
        assert_eq!(notice.payload["error"], "delivery_failed");
    }

    #[tokio::test]
    async fn test_ttl_expiry_reported() {
        let bus = bus();
        counting(&bus, "b", false);
        let start = Instant::now();
        let receipt = bus
            .send(request("b", DeliveryMode::Guaranteed).with_ttl(Duration::from_millis(50)))
            .await
            .unwrap();
        let report = bus.sweep_at(start + Duration::from_millis(60)).await;
        assert_eq!(report.expired, vec![receipt.message_id]);
        assert_eq!(bus.wait_final(receipt.message_id).await.unwrap(), DeliveryStatus::Expired);
        assert!(matches!(
            bus.acknowledge(receipt.message_id).unwrap_err(),
            ConductorError::TtlExpired(_)
        ));
    }

    #[tokio::test]
    async fn test_synchronous_request_response() {
        let bus = Arc::new(bus());
        let mut inbox = bus.open_mailbox(&AgentId::from("b"));
        let responder = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let request = inbox.recv().await.unwrap();
                bus.respond(request.id, &AgentId::from("b"), serde_json::json!({"answer": 42}))
                    .await
                    .unwrap();
            })
        };

        let receipt = bus
            .send(request("b", DeliveryMode::Synchronous).with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        responder.await.unwrap();
        let response = receipt.response.unwrap();
        assert_eq!(response.payload["answer"], 42);
        assert_eq!(response.correlation_id, Some(receipt.message_id));
        assert_eq!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Acknowledged)
        );
    }

    #[tokio::test]
    async fn test_synchronous_ack_before_response_keeps_waiting() {
        let bus = Arc::new(bus());
        let mut inbox = bus.open_mailbox(&AgentId::from("b"));
        let responder = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let request = inbox.recv().await.unwrap();
                bus.acknowledge(request.id).unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                bus.respond(request.id, &AgentId::from("b"), serde_json::json!({"answer": 7}))
                    .await
                    .unwrap();
            })
        };

        let receipt = bus
            .send(request("b", DeliveryMode::Synchronous).with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(receipt.response.unwrap().payload["answer"], 7);
        assert_eq!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Acknowledged)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_ack_without_response_times_out() {
        let bus = Arc::new(bus());
        let mut inbox = bus.open_mailbox(&AgentId::from("b"));
        let acker = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let request = inbox.recv().await.unwrap();
                bus.acknowledge(request.id).unwrap();
            })
        };
        let err = bus
            .send(request("b", DeliveryMode::Synchronous).with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        acker.await.unwrap();
        assert!(matches!(err, ConductorError::DeliveryTimeout(_)));
    }

    #[tokio::test]
    async fn test_withdrawn_message_is_not_redelivered() {
        let bus = bus();
        let count = counting(&bus, "b", false);
        let mut sender_box = bus.open_mailbox(&AgentId::from("sender"));
        let start = Instant::now();
        let receipt = bus.send(request("b", DeliveryMode::Guaranteed)).await.unwrap();
        bus.withdraw(receipt.message_id, "no longer needed").unwrap();

        let report = bus.sweep_at(start + Duration::from_millis(500)).await;
        assert!(report.redelivered.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.in_flight(), 0);
        assert!(matches!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Failed { reason }) if reason == "no longer needed"
        ));
        assert!(sender_box.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_synchronous_timeout() {
        let bus = bus();
        let _inbox = bus.open_mailbox(&AgentId::from("b"));
        let err = bus
            .send(request("b", DeliveryMode::Synchronous).with_timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::DeliveryTimeout(_)));
    }

    #[tokio::test]
    async fn test_synchronous_to_missing_endpoint_fails_fast() {
        let bus = bus();
        let err = bus
            .send(request("nobody", DeliveryMode::Synchronous))
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::DeliveryFailed { .. }));
    }

    #[tokio::test]
    async fn test_respond_without_waiter_delivers_response() {
        let bus = bus();
        let _b = bus.open_mailbox(&AgentId::from("b"));
        let mut sender_box = bus.open_mailbox(&AgentId::from("sender"));
        let receipt = bus
            .send(request("b", DeliveryMode::Asynchronous).requiring_ack())
            .await
            .unwrap();
        bus.respond(receipt.message_id, &AgentId::from("b"), serde_json::json!("done"))
            .await
            .unwrap();
        let response = sender_box.recv().await.unwrap();
        assert_eq!(response.message_type, MessageType::TaskResponse);
        assert_eq!(response.correlation_id, Some(receipt.message_id));
        assert_eq!(
            bus.message_status(receipt.message_id),
            Some(DeliveryStatus::Acknowledged)
        );
    }

    #[tokio::test]
    async fn test_redelivery_in_priority_order() {
        let bus = bus();
        let mut inbox = bus.open_mailbox(&AgentId::from("b"));
        let start = Instant::now();
        let low = bus
            .send(request("b", DeliveryMode::Guaranteed).with_priority(MessagePriority::Low))
            .await
            .unwrap();
        let high = bus
            .send(request("b", DeliveryMode::Guaranteed).with_priority(MessagePriority::Critical))
            .await
            .unwrap();
        // Drain first attempts.
        inbox.recv().await.unwrap();
        inbox.recv().await.unwrap();

        bus.sweep_at(start + Duration::from_millis(150)).await;
        assert_eq!(inbox.recv().await.unwrap().id, high.message_id);
        let second = inbox.recv().await.unwrap();
        assert_eq!(second.id, low.message_id);
        assert_eq!(second.attempt, 2);
    }

    #[tokio::test]
    async fn test_finished_records_are_purged() {
        let bus = bus();
        counting(&bus, "b", false);
        let receipt = bus.send(request("b", DeliveryMode::Asynchronous)).await.unwrap();
        let report = bus
            .sweep_at(Instant::now() + Duration::from_millis(60_001))
            .await;
        assert_eq!(report.purged, 1);
        assert!(bus.message_status(receipt.message_id).is_none());
    }
}
