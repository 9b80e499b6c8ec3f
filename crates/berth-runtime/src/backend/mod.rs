//! Container runtime abstraction.
//!
//! The orchestrator drives containers, networks, and volumes only through
//! [`ContainerRuntime`]. Handles returned by a runtime are opaque.

pub mod docker;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use berth_common::error::Result;
use berth_common::types::{RuntimeHandle, ServiceState};
use berth_compose::model::PortMapping;
use tokio::sync::mpsc;

/// Key/value labels attached to runtime objects.
pub type Labels = BTreeMap<String, String>;

/// Raw output chunks of a container log stream.
///
/// The stream ends when the sender side is dropped.
pub type LogChunks = mpsc::Receiver<Vec<u8>>;

/// Where a container mount's data comes from, in runtime terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingSource {
    /// A runtime volume, by runtime name.
    Volume(String),
    /// A host path.
    Host(PathBuf),
}

/// A mount as handed to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    /// Data source.
    pub source: BindingSource,
    /// Absolute path inside the container.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Volume and bind mounts.
    pub mounts: Vec<MountBinding>,
    /// Runtime names of the networks to attach.
    pub networks: Vec<String>,
    /// Labels identifying the owning deployment and service.
    pub labels: Labels,
}

/// Observed status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created, never started.
    Created,
    /// The main process is running.
    Running,
    /// The main process has exited.
    Exited {
        /// Exit code, when the runtime reports one.
        code: Option<i64>,
    },
    /// The runtime gave up on the container.
    Dead,
}

impl ContainerStatus {
    /// Lifecycle state this status corresponds to.
    #[must_use]
    pub const fn as_service_state(self) -> ServiceState {
        match self {
            Self::Created => ServiceState::Created,
            Self::Running => ServiceState::Running,
            Self::Exited { .. } => ServiceState::Stopped,
            Self::Dead => ServiceState::Failed,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited { code: Some(code) } => write!(f, "exited ({code})"),
            Self::Exited { code: None } => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// One entry of a runtime snapshot.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Runtime handle.
    pub handle: RuntimeHandle,
    /// Container name.
    pub name: String,
    /// Value of the service label, if present.
    pub service: Option<String>,
    /// Image reference.
    pub image: String,
    /// Current status.
    pub status: ContainerStatus,
}

/// The container runtime collaborator.
///
/// Implementations map failures onto the shared error type:
/// [`RuntimeUnavailable`](berth_common::error::BerthError::RuntimeUnavailable)
/// when the runtime cannot be reached at all,
/// [`ImageUnavailable`](berth_common::error::BerthError::ImageUnavailable)
/// and [`PortAllocated`](berth_common::error::BerthError::PortAllocated)
/// for the create failures the lifecycle distinguishes, and
/// [`Runtime`](berth_common::error::BerthError::Runtime) otherwise.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks that the runtime is reachable.
    async fn ping(&self) -> Result<()>;

    /// Creates a container without starting it.
    async fn create_container(&self, config: &ContainerConfig) -> Result<RuntimeHandle>;

    /// Starts a created or stopped container.
    async fn start(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Asks a container to stop, letting the runtime kill it after `grace`.
    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<()>;

    /// Kills a container immediately.
    async fn kill(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Deletes a stopped container.
    async fn remove(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Reports a container's status.
    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus>;

    /// Lists every container labelled with the given deployment.
    async fn list_containers(&self, deployment: &str) -> Result<Vec<ContainerSummary>>;

    /// Creates a bridge network.
    async fn create_network(&self, name: &str, labels: &Labels) -> Result<RuntimeHandle>;

    /// Looks up a network by name.
    async fn find_network(&self, name: &str) -> Result<Option<RuntimeHandle>>;

    /// Deletes a network.
    async fn remove_network(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Creates a volume.
    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<RuntimeHandle>;

    /// Looks up a volume by name.
    async fn find_volume(&self, name: &str) -> Result<Option<RuntimeHandle>>;

    /// Deletes a volume.
    async fn remove_volume(&self, handle: &RuntimeHandle) -> Result<()>;

    /// Streams a container's output.
    ///
    /// Without `follow` the stream ends after the output produced so far.
    /// With `follow` it continues until the container exits or the
    /// receiver is dropped.
    async fn stream_logs(&self, handle: &RuntimeHandle, follow: bool) -> Result<LogChunks>;
}
