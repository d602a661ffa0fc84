use crate::strategy::AllocationStrategy;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a [`Coordinator`](crate::Coordinator).
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub strategy: AllocationStrategy,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub handoff: HandoffConfig,
    /// Period of the background sweep (message retries, TTLs, handoff timeouts).
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    /// Run a dispatch pass after submissions, completions and handoff resolution.
    #[serde(default = "default_auto_dispatch")]
    pub auto_dispatch: bool,
}

/// Base weights of the allocation score
/// `performance * score + availability * (1 - utilization)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_weight")]
    pub performance: f64,
    #[serde(default = "default_weight")]
    pub availability: f64,
}

/// Learning parameters for the performance tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// EMA learning rate (alpha).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Score given to a freshly registered agent.
    #[serde(default = "default_initial_score")]
    pub initial_score: f64,
}

/// Communication bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// TTL applied when a send does not specify one.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    /// How long a synchronous send waits for its response by default.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// How long finished messages stay queryable by id.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Bound of each mailbox opened with `open_mailbox`.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Configures retry behaviour for guaranteed delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of redeliveries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

/// Handoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// How long the destination has to accept or reject.
    #[serde(default = "default_handoff_timeout_ms")]
    pub timeout_ms: u64,
    /// How long resolved handoff records stay queryable.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
}

fn default_maintenance_interval_ms() -> u64 {
    250
}

fn default_auto_dispatch() -> bool {
    true
}

fn default_weight() -> f64 {
    0.5
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_initial_score() -> f64 {
    0.5
}

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_sync_timeout_ms() -> u64 {
    5_000
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_handoff_timeout_ms() -> u64 {
    30_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: AllocationStrategy::default(),
            weights: ScoringWeights::default(),
            performance: PerformanceConfig::default(),
            bus: BusConfig::default(),
            handoff: HandoffConfig::default(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            auto_dispatch: default_auto_dispatch(),
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            performance: default_weight(),
            availability: default_weight(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            initial_score: default_initial_score(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            retention_ms: default_retention_ms(),
            mailbox_capacity: default_mailbox_capacity(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handoff_timeout_ms(),
            retention_ms: default_retention_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before redelivery number `attempt` (0-based), capped at
    /// `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl BusConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl HandoffConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl CoordinatorConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> ConductorResult<Self> {
        let config: CoordinatorConfig = toml::from_str(content)
            .map_err(|e| ConductorError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub fn from_file(path: &Path) -> ConductorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn handoff_timeout(&self) -> Duration {
        self.handoff.timeout()
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> ConductorResult<()> {
        let alpha = self.performance.learning_rate;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConductorError::Config(format!(
                "performance.learning_rate must be in (0, 1], got {alpha}"
            )));
        }
        let initial = self.performance.initial_score;
        if !(0.0..=1.0).contains(&initial) {
            return Err(ConductorError::Config(format!(
                "performance.initial_score must be in [0, 1], got {initial}"
            )));
        }
        for (name, weight) in [
            ("performance", self.weights.performance),
            ("availability", self.weights.availability),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConductorError::Config(format!(
                    "weights.{name} must be a finite non-negative number, got {weight}"
                )));
            }
        }
        if self.bus.default_ttl_ms == 0 || self.bus.sync_timeout_ms == 0 {
            return Err(ConductorError::Config(
                "bus.default_ttl_ms and bus.sync_timeout_ms must be positive".to_string(),
            ));
        }
        if self.bus.mailbox_capacity == 0 {
            return Err(ConductorError::Config(
                "bus.mailbox_capacity must be positive".to_string(),
            ));
        }
        if self.handoff.timeout_ms == 0 || self.maintenance_interval_ms == 0 {
            return Err(ConductorError::Config(
                "handoff.timeout_ms and maintenance_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = CoordinatorConfig::from_toml_str("").unwrap();
        assert_eq!(config.performance.learning_rate, 0.1);
        assert_eq!(config.performance.initial_score, 0.5);
        assert_eq!(config.strategy, AllocationStrategy::Adaptive);
        assert_eq!(config.bus.retry.max_retries, 3);
        assert!(config.auto_dispatch);
    }

    #[test]
    fn test_parse_full_document() {
        let config = CoordinatorConfig::from_toml_str(
            r#"
auto_dispatch = false

[strategy]
kind = "priority_based"
threshold = 7

[weights]
performance = 0.7
availability = 0.3

[bus]
default_ttl_ms = 1000

[bus.retry]
max_retries = 5
backoff_base_ms = 100
backoff_max_ms = 800

[handoff]
timeout_ms = 2000
"#,
        )
        .unwrap();
        assert_eq!(config.strategy, AllocationStrategy::PriorityBased { threshold: 7 });
        assert_eq!(config.weights.performance, 0.7);
        assert_eq!(config.bus.default_ttl(), Duration::from_secs(1));
        assert_eq!(config.bus.retry.max_retries, 5);
        assert_eq!(config.handoff_timeout(), Duration::from_secs(2));
        assert!(!config.auto_dispatch);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(5), Duration::from_millis(16_000));
        assert_eq!(policy.backoff(6), Duration::from_millis(30_000)); // capped
        assert_eq!(policy.backoff(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_validate_rejects_bad_learning_rate() {
        let err = CoordinatorConfig::from_toml_str("[performance]\nlearning_rate = 0.0\n")
            .unwrap_err();
        assert!(err.to_string().contains("learning_rate"), "unexpected error: {err}");
    }

    #[test]
    fn test_validate_rejects_zero_mailbox() {
        let mut config = CoordinatorConfig::default();
        config.bus.mailbox_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_weights() {
        for bad in [f64::NAN, f64::INFINITY, -0.1] {
            let mut config = CoordinatorConfig::default();
            config.weights.availability = bad;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("weights.availability"), "unexpected error: {err}");
        }
        let mut config = CoordinatorConfig::default();
        config.weights.performance = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "maintenance_interval_ms = 50").unwrap();
        let config = CoordinatorConfig::from_file(tmp.path()).unwrap();
        assert_eq!(config.maintenance_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_from_missing_file() {
        let err = CoordinatorConfig::from_file(Path::new("/nonexistent/conductor.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = CoordinatorConfig::from_toml_str("{{{{invalid").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
