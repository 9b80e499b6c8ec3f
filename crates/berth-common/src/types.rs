//! Domain primitive types used across the Berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference to a container, network, or volume in the runtime.
///
/// The orchestrator stores handles keyed by the owning spec name but
/// never looks inside them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeHandle(String);

impl RuntimeHandle {
    /// Creates a handle from the runtime's identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first twelve characters, the way container ids are usually shown.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Declared but nothing exists in the runtime yet.
    Planned,
    /// The container exists but has not been started.
    Created,
    /// A start request is in flight.
    Starting,
    /// The container process is running.
    Running,
    /// The health probe passed (or none is declared).
    Healthy,
    /// A stop request is in flight.
    Stopping,
    /// The container exists but is not running.
    Stopped,
    /// The container has been deleted.
    Removed,
    /// The service could not reach its target state in this operation.
    Failed,
}

impl ServiceState {
    /// Whether a lifecycle controller may move from `self` to `next`.
    ///
    /// `Failed` is reachable from every non-terminal state. A failed
    /// service may still be torn down, so `Failed -> Stopping` is allowed,
    /// and a dead container may be removed directly (`Failed -> Removed`).
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ServiceState::{
            Created, Failed, Healthy, Planned, Removed, Running, Starting, Stopped, Stopping,
        };
        match (self, next) {
            (Removed | Failed, Failed) => false,
            (_, Failed)
            | (Planned | Removed, Planned)
            | (Planned | Starting, Created)
            | (Created | Stopped, Starting)
            | (Starting, Running)
            | (Running, Healthy)
            | (Created | Starting | Running | Healthy | Stopped | Failed, Stopping)
            | (Stopping, Stopped)
            | (Stopped | Created | Failed, Removed) => true,
            _ => false,
        }
    }

    /// Whether the container is up (running, healthy or not).
    #[must_use]
    pub const fn is_up(self) -> bool {
        matches!(self, Self::Running | Self::Healthy)
    }

    /// Whether a container exists in the runtime for this state.
    #[must_use]
    pub const fn has_container(self) -> bool {
        !matches!(self, Self::Planned | Self::Removed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Planned => "planned",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What the orchestrator does when a container fails to come up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never retry.
    #[default]
    Never,
    /// Retry without an attempt limit.
    Always,
    /// Retry on failure, optionally with an explicit attempt budget.
    OnFailure {
        /// Total attempts allowed; `None` uses the configured default.
        max_attempts: Option<u32>,
    },
}

impl RestartPolicy {
    /// Total number of bring-up attempts allowed under this policy.
    ///
    /// Returns `None` when attempts are unbounded.
    #[must_use]
    pub const fn attempt_budget(self, on_failure_default: u32) -> Option<u32> {
        match self {
            Self::Never => Some(1),
            Self::Always => None,
            Self::OnFailure { max_attempts } => match max_attempts {
                Some(n) => Some(n),
                None => Some(on_failure_default),
            },
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "none"),
            Self::Always => write!(f, "always"),
            Self::OnFailure { max_attempts: None } => write!(f, "on-failure"),
            Self::OnFailure {
                max_attempts: Some(n),
            } => write!(f, "on-failure:{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_allowed() {
        let path = [
            ServiceState::Planned,
            ServiceState::Created,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Healthy,
            ServiceState::Stopping,
            ServiceState::Stopped,
            ServiceState::Removed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failed_reachable_from_non_terminal_states_only() {
        assert!(ServiceState::Planned.can_transition_to(ServiceState::Failed));
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Failed));
        assert!(ServiceState::Running.can_transition_to(ServiceState::Failed));
        assert!(!ServiceState::Failed.can_transition_to(ServiceState::Failed));
        assert!(!ServiceState::Removed.can_transition_to(ServiceState::Failed));
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!ServiceState::Planned.can_transition_to(ServiceState::Running));
        assert!(!ServiceState::Created.can_transition_to(ServiceState::Healthy));
        assert!(!ServiceState::Healthy.can_transition_to(ServiceState::Removed));
    }

    #[test]
    fn dead_container_can_be_replaced() {
        assert!(ServiceState::Failed.can_transition_to(ServiceState::Removed));
        assert!(ServiceState::Removed.can_transition_to(ServiceState::Planned));
    }

    #[test]
    fn retry_edge_returns_to_created() {
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Created));
    }

    #[test]
    fn attempt_budgets() {
        assert_eq!(RestartPolicy::Never.attempt_budget(5), Some(1));
        assert_eq!(RestartPolicy::Always.attempt_budget(5), None);
        assert_eq!(
            RestartPolicy::OnFailure { max_attempts: None }.attempt_budget(5),
            Some(5)
        );
        assert_eq!(
            RestartPolicy::OnFailure {
                max_attempts: Some(2)
            }
            .attempt_budget(5),
            Some(2)
        );
    }

    #[test]
    fn handle_short_form() {
        let handle = RuntimeHandle::new("0123456789abcdef");
        assert_eq!(handle.short(), "0123456789ab");
        assert_eq!(RuntimeHandle::new("abc").short(), "abc");
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceState::Healthy).expect("serialize");
        assert_eq!(json, "\"healthy\"");
    }
}
