//! Orchestrator configuration model.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Timing and retry settings for the orchestration engine.
///
/// Per-probe settings in a deployment document take precedence over the
/// health values here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Interval between health probe attempts.
    pub health_interval: Duration,
    /// Deadline for a health probe to pass.
    pub health_timeout: Duration,
    /// First restart backoff delay.
    pub backoff_initial: Duration,
    /// Maximum restart backoff delay.
    pub backoff_ceiling: Duration,
    /// Grace period before a stop escalates to a kill.
    pub stop_grace: Duration,
    /// Attempt budget for `on-failure` services without an explicit count.
    pub on_failure_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_interval: constants::DEFAULT_HEALTH_INTERVAL,
            health_timeout: constants::DEFAULT_HEALTH_TIMEOUT,
            backoff_initial: constants::DEFAULT_BACKOFF_INITIAL,
            backoff_ceiling: constants::DEFAULT_BACKOFF_CEILING,
            stop_grace: constants::DEFAULT_STOP_GRACE,
            on_failure_attempts: constants::DEFAULT_ON_FAILURE_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.health_interval, Duration::from_secs(2));
        assert_eq!(config.health_timeout, Duration::from_secs(30));
        assert_eq!(config.backoff_ceiling, Duration::from_secs(30));
        assert_eq!(config.stop_grace, Duration::from_secs(10));
        assert_eq!(config.on_failure_attempts, 5);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"on_failure_attempts": 3}"#).expect("parse");
        assert_eq!(config.on_failure_attempts, 3);
        assert_eq!(config.stop_grace, constants::DEFAULT_STOP_GRACE);
    }
}
