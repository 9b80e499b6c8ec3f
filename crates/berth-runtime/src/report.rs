//! Operation results returned by the engine.

use std::fmt;

use berth_common::error::ServiceError;
use berth_common::types::{RuntimeHandle, ServiceState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kind of a non-container resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// A network.
    Network,
    /// A volume.
    Volume,
}

impl ResourceKind {
    /// Lowercase label, also used as the `kind` of a not-found error.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a resource during an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceAction {
    /// Did not exist and was created.
    Created,
    /// Already existed with the expected name.
    Reused,
    /// Deleted from the runtime.
    Removed,
    /// Kept on purpose.
    Preserved,
    /// The runtime rejected the request.
    Failed,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Reused => "reused",
            Self::Removed => "removed",
            Self::Preserved => "preserved",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One resource line of an operation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceReport {
    /// Network or volume.
    pub kind: ResourceKind,
    /// Runtime name.
    pub name: String,
    /// What happened.
    pub action: ResourceAction,
    /// Runtime message when `action` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceReport {
    /// A successful entry.
    #[must_use]
    pub const fn new(kind: ResourceKind, name: String, action: ResourceAction) -> Self {
        Self {
            kind,
            name,
            action,
            error: None,
        }
    }

    /// A failed entry.
    #[must_use]
    pub const fn failed(kind: ResourceKind, name: String, error: String) -> Self {
        Self {
            kind,
            name,
            action: ResourceAction::Failed,
            error: Some(error),
        }
    }
}

/// Final state of one service after an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    /// Service name.
    pub name: String,
    /// Lifecycle state.
    pub state: ServiceState,
    /// Container handle, if a container exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<RuntimeHandle>,
    /// Bring-up attempts made.
    pub attempts: u32,
    /// Why the service failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

/// Overall outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Every service and resource reached its target.
    Success,
    /// At least one service or resource failed.
    PartialFailure,
}

/// Which engine operation produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// `up`
    Up,
    /// `down`
    Down,
    /// `stop`
    Stop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Stop => "stop",
        })
    }
}

/// Per-service and per-resource outcome of an engine operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Operation that ran.
    pub operation: Operation,
    /// Deployment name.
    pub deployment: String,
    /// Services in startup order.
    pub services: Vec<ServiceReport>,
    /// Networks and volumes touched.
    pub resources: Vec<ResourceReport>,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// The operation was interrupted before it reached its target.
    pub cancelled: bool,
}

impl OperationResult {
    /// `PartialFailure` if any service or resource failed, or if the
    /// operation was interrupted.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if self.cancelled {
            return Outcome::PartialFailure;
        }
        let service_failed = self.services.iter().any(|s| s.state == ServiceState::Failed);
        let resource_failed = self
            .resources
            .iter()
            .any(|r| r.action == ResourceAction::Failed);
        if service_failed || resource_failed {
            Outcome::PartialFailure
        } else {
            Outcome::Success
        }
    }

    /// Services that ended in `Failed`.
    pub fn failed(&self) -> impl Iterator<Item = &ServiceReport> {
        self.services
            .iter()
            .filter(|s| s.state == ServiceState::Failed)
    }

    /// Report of one service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }
}
