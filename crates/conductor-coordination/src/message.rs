use chrono::{DateTime, Utc};
use conductor_core::AgentId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Identifier assigned to every sent message.
pub type MessageId = Uuid;

/// Closed set of message kinds carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    ResourceRequest,
    ResourceGrant,
    CoordinationSync,
    HandoffInitiate,
    HandoffAcknowledge,
    Broadcast,
    Heartbeat,
    ErrorReport,
}

/// Orders delivery attempts; never affects correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Reliability contract of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Best effort, no tracking.
    FireAndForget,
    /// One attempt; outcome queryable by id.
    #[default]
    Asynchronous,
    /// The sender waits for a correlated response or a timeout.
    Synchronous,
    /// Retried with backoff until acknowledged, expired, or out of retries.
    Guaranteed,
}

/// A message as handed to an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub sender: AgentId,
    pub recipients: Vec<AgentId>,
    pub message_type: MessageType,
    /// Owned by the caller; the bus never inspects it.
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub mode: DeliveryMode,
    pub requires_ack: bool,
    /// Links a response to the request it answers.
    pub correlation_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    /// 1 for the first delivery, incremented on each redelivery.
    pub attempt: u32,
}

/// Parameters of a send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender: AgentId,
    /// Empty with [`MessageType::Broadcast`] means every endpoint but the sender.
    pub recipients: Vec<AgentId>,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub mode: DeliveryMode,
    pub requires_ack: bool,
    /// Falls back to the bus default.
    pub ttl: Option<Duration>,
    /// Synchronous mode only; falls back to the bus default.
    pub timeout: Option<Duration>,
    pub correlation_id: Option<MessageId>,
}

impl SendRequest {
    /// An asynchronous, normal-priority send with no ack requirement.
    pub fn new(
        sender: impl Into<AgentId>,
        recipients: Vec<AgentId>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipients,
            message_type,
            payload,
            priority: MessagePriority::Normal,
            mode: DeliveryMode::Asynchronous,
            requires_ack: false,
            ttl: None,
            timeout: None,
            correlation_id: None,
        }
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn correlated_with(mut self, request: MessageId) -> Self {
        self.correlation_id = Some(request);
        self
    }
}

/// Delivery-state bookkeeping for a tracked message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    /// At least one recipient endpoint accepted it.
    Delivered,
    Acknowledged,
    Failed { reason: String },
    /// TTL elapsed before acknowledgment.
    Expired,
}

impl DeliveryStatus {
    /// No further transitions will happen.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Acknowledged | DeliveryStatus::Failed { .. } | DeliveryStatus::Expired
        )
    }
}

/// What `send` returns.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: MessageId,
    /// The correlated response, for synchronous sends.
    pub response: Option<Envelope>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::Low < MessagePriority::Normal);
    }

    #[test]
    fn test_send_request_builder() {
        let req = SendRequest::new(
            "a",
            vec![AgentId::from("b")],
            MessageType::StatusUpdate,
            serde_json::json!({"progress": 0.5}),
        )
        .with_mode(DeliveryMode::Guaranteed)
        .with_priority(MessagePriority::High)
        .with_ttl(Duration::from_secs(1))
        .requiring_ack();
        assert_eq!(req.mode, DeliveryMode::Guaranteed);
        assert!(req.requires_ack);
        assert_eq!(req.ttl, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(DeliveryStatus::Failed { reason: "x".into() }).unwrap();
        assert_eq!(json["state"], "failed");
        assert!(DeliveryStatus::Expired.is_final());
        assert!(!DeliveryStatus::Delivered.is_final());
    }
}
