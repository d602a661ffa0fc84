use crate::scheduler::SchedulerCounts;
use chrono::{DateTime, Utc};
use conductor_core::{AgentId, ResourceAmounts};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Read-only view of one agent for a monitoring collector.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetricsView {
    pub agent_id: AgentId,
    pub agent_type: String,
    /// Σ in_use / Σ max_capacity over every declared resource type.
    pub utilization: f64,
    pub in_use: ResourceAmounts,
    pub max_capacity: ResourceAmounts,
    pub performance_score: f64,
    /// Allocations currently holding resources on this agent.
    pub queue_depth: usize,
    pub completed: u64,
    pub failed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Point-in-time metrics for the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub strategy: String,
    pub agents: Vec<AgentMetricsView>,
    pub tasks: SchedulerCounts,
    /// Reported completions per second since the engine started.
    pub throughput_per_sec: f64,
    /// Successful share of reported completions; 0 before any report.
    pub success_rate: f64,
    /// Mean time from submission to allocation.
    pub avg_coordination_latency_ms: f64,
    pub messages_in_flight: usize,
    pub handoffs: BTreeMap<String, usize>,
}

#[derive(Default)]
struct Counters {
    succeeded: u64,
    failed: u64,
    allocations: u64,
    latency_total_ms: f64,
    heartbeats: HashMap<AgentId, (Instant, DateTime<Utc>)>,
}

/// Running counters that feed [`MetricsSnapshot`].
pub struct MetricsRecorder {
    started: Instant,
    counters: Mutex<Counters>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn heartbeat(&self, agent: &AgentId) {
        self.counters
            .lock()
            .heartbeats
            .insert(agent.clone(), (Instant::now(), Utc::now()));
    }

    pub fn remove_agent(&self, agent: &AgentId) {
        self.counters.lock().heartbeats.remove(agent);
    }

    pub fn last_heartbeat(&self, agent: &AgentId) -> Option<DateTime<Utc>> {
        self.counters.lock().heartbeats.get(agent).map(|(_, at)| *at)
    }

    /// Agents whose last heartbeat is older than `max_silence` at `now`.
    pub fn stale_agents(&self, now: Instant, max_silence: Duration) -> Vec<AgentId> {
        let mut stale: Vec<AgentId> = self
            .counters
            .lock()
            .heartbeats
            .iter()
            .filter(|(_, (seen, _))| now.saturating_duration_since(*seen) > max_silence)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn record_allocation(&self, latency_ms: f64) {
        let mut counters = self.counters.lock();
        counters.allocations += 1;
        counters.latency_total_ms += latency_ms.max(0.0);
    }

    pub fn record_completion(&self, success: bool) {
        let mut counters = self.counters.lock();
        if success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// (throughput per second, success rate, mean latency in ms).
    pub fn rates(&self) -> (f64, f64, f64) {
        let counters = self.counters.lock();
        let reported = counters.succeeded + counters.failed;
        let elapsed = self.uptime().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            reported as f64 / elapsed
        } else {
            0.0
        };
        let success_rate = if reported > 0 {
            counters.succeeded as f64 / reported as f64
        } else {
            0.0
        };
        let latency = if counters.allocations > 0 {
            counters.latency_total_ms / counters.allocations as f64
        } else {
            0.0
        };
        (throughput, success_rate, latency)
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Serialize for a dashboard or log line.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_start_at_zero() {
        let recorder = MetricsRecorder::new();
        let (throughput, success_rate, latency) = recorder.rates();
        assert_eq!(throughput, 0.0);
        assert_eq!(success_rate, 0.0);
        assert_eq!(latency, 0.0);
    }

    #[test]
    fn test_success_rate_and_latency() {
        let recorder = MetricsRecorder::new();
        recorder.record_completion(true);
        recorder.record_completion(true);
        recorder.record_completion(true);
        recorder.record_completion(false);
        recorder.record_allocation(10.0);
        recorder.record_allocation(30.0);
        let (_, success_rate, latency) = recorder.rates();
        assert!((success_rate - 0.75).abs() < 1e-9);
        assert!((latency - 20.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_agents() {
        let recorder = MetricsRecorder::new();
        recorder.heartbeat(&AgentId::from("quiet"));
        tokio::time::advance(Duration::from_secs(10)).await;
        recorder.heartbeat(&AgentId::from("chatty"));

        let stale = recorder.stale_agents(Instant::now(), Duration::from_secs(5));
        assert_eq!(stale, vec![AgentId::from("quiet")]);
        assert!(recorder.last_heartbeat(&AgentId::from("chatty")).is_some());

        recorder.remove_agent(&AgentId::from("quiet"));
        assert!(recorder.stale_agents(Instant::now(), Duration::from_secs(5)).is_empty());
    }
}
