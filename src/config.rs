//! Per-session configuration.
//!
//! A `SessionConfig` is supplied when a session is created and frozen for
//! the session's lifetime; it travels inside every snapshot so replays see
//! the thresholds that were in force at the time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default iteration budget before forced escalation.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Default wall-clock bound for a single reviewer capability call.
const DEFAULT_CAPABILITY_TIMEOUT_SECS: u64 = 120;

/// Default transient-failure retries per capability call.
const DEFAULT_CAPABILITY_RETRIES: u32 = 2;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_capability_timeout() -> Duration {
    Duration::from_secs(DEFAULT_CAPABILITY_TIMEOUT_SECS)
}

fn default_capability_retries() -> u32 {
    DEFAULT_CAPABILITY_RETRIES
}

fn default_allow_escalated_approval() -> bool {
    true
}

/// Minimum scores per review dimension, on the 0-10 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholds {
    /// Minimum safety score for the gate to pass.
    pub safety: f64,
    /// Minimum clinical score for the gate to pass.
    pub clinical: f64,
    /// Minimum empathy score for the gate to pass.
    pub empathy: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            safety: 7.0,
            clinical: 6.0,
            empathy: 6.0,
        }
    }
}

/// Configuration for one session, frozen at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Score thresholds the gate evaluates against.
    #[serde(default)]
    pub thresholds: ScoreThresholds,
    /// Maximum revision iterations before forced escalation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Wall-clock bound for a single capability call.
    #[serde(default = "default_capability_timeout")]
    pub capability_timeout: Duration,
    /// Transient-failure retries before a capability call is treated as
    /// permanently rejected.
    #[serde(default = "default_capability_retries")]
    pub capability_retries: u32,
    /// Whether a force-escalated session may still be approved by a human.
    /// The observed policy allows it; operators who want escalated sessions
    /// to be reject-only can turn this off.
    #[serde(default = "default_allow_escalated_approval")]
    pub allow_escalated_approval: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thresholds: ScoreThresholds::default(),
            max_iterations: default_max_iterations(),
            capability_timeout: default_capability_timeout(),
            capability_retries: default_capability_retries(),
            allow_escalated_approval: default_allow_escalated_approval(),
        }
    }
}

impl SessionConfig {
    /// Set the score thresholds.
    pub fn with_thresholds(mut self, thresholds: ScoreThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Set the iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the capability call timeout.
    pub fn with_capability_timeout(mut self, timeout: Duration) -> Self {
        self.capability_timeout = timeout;
        self
    }

    /// Set the transient-failure retry bound.
    pub fn with_capability_retries(mut self, retries: u32) -> Self {
        self.capability_retries = retries;
        self
    }

    /// Allow or disallow human approval of force-escalated sessions.
    pub fn with_allow_escalated_approval(mut self, allow: bool) -> Self {
        self.allow_escalated_approval = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let thresholds = ScoreThresholds::default();
        assert_eq!(thresholds.safety, 7.0);
        assert_eq!(thresholds.clinical, 6.0);
        assert_eq!(thresholds.empathy, 6.0);
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.capability_timeout, Duration::from_secs(120));
        assert_eq!(config.capability_retries, 2);
        assert!(config.allow_escalated_approval);
    }

    #[test]
    fn test_builder_methods() {
        let config = SessionConfig::default()
            .with_max_iterations(3)
            .with_capability_timeout(Duration::from_secs(30))
            .with_capability_retries(0)
            .with_allow_escalated_approval(false)
            .with_thresholds(ScoreThresholds {
                safety: 9.0,
                clinical: 8.0,
                empathy: 7.0,
            });

        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.capability_timeout, Duration::from_secs(30));
        assert_eq!(config.capability_retries, 0);
        assert!(!config.allow_escalated_approval);
        assert_eq!(config.thresholds.safety, 9.0);
    }

    #[test]
    fn test_deserialization_fills_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = SessionConfig::default().with_max_iterations(7);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
