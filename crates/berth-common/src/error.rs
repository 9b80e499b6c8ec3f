//! Unified error types for the Berth workspace.
//!
//! [`BerthError`] covers failures that abort an operation or a single
//! call into a collaborator. [`ServiceError`] describes why one service
//! did not reach its target state; it is carried inside operation
//! reports rather than propagated.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::ServiceState;

/// Classification of a deployment document rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// The document or one of its embedded strings is malformed.
    Syntax,
    /// A name refers to a service, network, or volume that is not declared.
    UnknownReference,
    /// Service dependencies form a cycle.
    CyclicDependency,
    /// The same name is declared twice in one section.
    DuplicateName,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::UnknownReference => write!(f, "unknown reference"),
            Self::CyclicDependency => write!(f, "cyclic dependency"),
            Self::DuplicateName => write!(f, "duplicate name"),
        }
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The deployment document was rejected.
    #[error("{kind} error: {message}")]
    Parse {
        /// What class of problem was found.
        kind: ParseErrorKind,
        /// Human-readable description.
        message: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Services along the cycle, first element repeated at the end.
        cycle: Vec<String>,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The container runtime cannot be reached at all.
    #[error("container runtime unavailable: {message}")]
    RuntimeUnavailable {
        /// Description of the connection failure.
        message: String,
    },

    /// A runtime call was rejected.
    #[error("runtime {operation} failed: {message}")]
    Runtime {
        /// Name of the runtime operation.
        operation: &'static str,
        /// Message reported by the runtime.
        message: String,
    },

    /// The requested image is not present and cannot be obtained.
    #[error("image unavailable: {image}")]
    ImageUnavailable {
        /// Image reference.
        image: String,
    },

    /// A host port is already bound by another container or process.
    #[error("host port {port} is already allocated")]
    PortAllocated {
        /// The contested host port.
        port: u16,
    },

    /// A lifecycle transition that the state machine forbids.
    #[error("service {service}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Service whose state was being changed.
        service: String,
        /// Current state.
        from: ServiceState,
        /// Requested state.
        to: ServiceState,
    },

    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Builds a [`BerthError::Parse`].
    pub fn parse(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            message: message.into(),
        }
    }

    /// Builds a [`BerthError::Runtime`].
    pub fn runtime(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Runtime {
            operation,
            message: message.into(),
        }
    }

    /// Returns the document-level classification of this error, if any.
    ///
    /// A cycle found by the resolver reports
    /// [`ParseErrorKind::CyclicDependency`] just like one found while parsing.
    #[must_use]
    pub const fn parse_kind(&self) -> Option<ParseErrorKind> {
        match self {
            Self::Parse { kind, .. } => Some(*kind),
            Self::CyclicDependency { .. } => Some(ParseErrorKind::CyclicDependency),
            _ => None,
        }
    }

    /// Whether this error aborts a whole operation rather than one service.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Parse { .. }
                | Self::CyclicDependency { .. }
                | Self::RuntimeUnavailable { .. }
        )
    }
}

/// Why a single service failed during an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ServiceError {
    /// The container could not be created.
    #[error("create failed: {message}")]
    Create {
        /// Runtime-reported reason.
        message: String,
    },

    /// The container could not be started.
    #[error("start failed: {message}")]
    Start {
        /// Runtime-reported reason.
        message: String,
    },

    /// The health probe did not pass in time.
    #[error("health probe did not pass within {}s", .timeout.as_secs_f64())]
    HealthTimeout {
        /// Probe deadline that elapsed.
        timeout: Duration,
    },

    /// A dependency never became healthy, so this service was held back.
    #[error("dependency \"{dependency}\" did not become healthy")]
    DependencyFailed {
        /// Name of the failed dependency.
        dependency: String,
    },

    /// A network or volume the service needs could not be provided.
    #[error("required resource unavailable: {message}")]
    Resource {
        /// Description of the failed resource.
        message: String,
    },

    /// Stopping or removing the container failed.
    #[error("teardown failed: {message}")]
    Teardown {
        /// Runtime-reported reason.
        message: String,
    },

    /// The operation was cancelled before this service settled.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
