//! Idempotent convergence of networks and volumes.
//!
//! `ensure` asks the runtime for a resource with the expected name and
//! reuses it, or creates it. Concurrent calls for one name are funnelled
//! through a per-name [`OnceCell`], so at most one creation is issued;
//! distinct names proceed in parallel. A cell only lives while a call for
//! its name is in flight, so every later call sees the runtime as it is
//! then. The name table lock is only held to fetch or drop a cell.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use berth_common::constants::{LABEL_ANONYMOUS, LABEL_DEPLOYMENT, LABEL_SERVICE};
use berth_common::error::{BerthError, Result};
use berth_common::types::RuntimeHandle;
use berth_compose::model::{Deployment, NetworkSpec, VolumeScope, VolumeSpec};
use tokio::sync::OnceCell;

use crate::backend::{ContainerRuntime, Labels};
use crate::report::{ResourceAction, ResourceKind, ResourceReport};

/// A network or volume to converge.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// A declared network.
    Network(&'a NetworkSpec),
    /// A named or anonymous volume.
    Volume(&'a VolumeSpec),
}

impl Resource<'_> {
    /// Kind of the resource.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Network(_) => ResourceKind::Network,
            Self::Volume(_) => ResourceKind::Volume,
        }
    }

    const fn external(&self) -> bool {
        match self {
            Self::Network(n) => n.external,
            Self::Volume(v) => v.external,
        }
    }

    fn runtime_name(&self, deployment: &Deployment) -> String {
        match self {
            Self::Network(n) => deployment.network_runtime_name(n),
            Self::Volume(v) => deployment.volume_runtime_name(v),
        }
    }

    fn labels(&self, deployment: &Deployment) -> Labels {
        let mut labels = Labels::from([(LABEL_DEPLOYMENT.to_string(), deployment.name.clone())]);
        if let Self::Volume(VolumeSpec {
            scope: VolumeScope::Container { owner },
            ..
        }) = self
        {
            let _ = labels.insert(LABEL_SERVICE.to_string(), owner.clone());
            let _ = labels.insert(LABEL_ANONYMOUS.to_string(), "true".to_string());
        }
        labels
    }
}

/// What to do with named volumes on release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasePolicy {
    /// Remove deployment-scoped named volumes too.
    pub purge: bool,
}

/// A converged resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    /// Runtime handle.
    pub handle: RuntimeHandle,
    /// Whether it was created or reused.
    pub action: ResourceAction,
}

type CellKey = (ResourceKind, String);

/// Converges networks and volumes against the runtime.
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    cells: Mutex<HashMap<CellKey, Arc<OnceCell<RuntimeHandle>>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler").finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over a runtime.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, key: CellKey) -> Arc<OnceCell<RuntimeHandle>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(key).or_default())
    }

    /// Drops `cell` from the table unless a newer cell replaced it.
    fn settle(&self, key: &CellKey, cell: &Arc<OnceCell<RuntimeHandle>>) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        if cells.get(key).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            let _ = cells.remove(key);
        }
    }

    /// Makes sure a resource exists, returning its handle.
    ///
    /// External resources are only looked up.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::NotFound`] for a missing external resource, or
    /// the runtime's error if lookup or creation fails. A failed creation
    /// leaves the name unclaimed so a later call can retry.
    pub async fn ensure(&self, deployment: &Deployment, resource: Resource<'_>) -> Result<Ensured> {
        let kind = resource.kind();
        let name = resource.runtime_name(deployment);
        let key = (kind, name.clone());
        let cell = self.cell(key.clone());

        let mut created = false;
        let created_flag = &mut created;
        let lookup = name.clone();
        let resolved = cell
            .get_or_try_init(|| async move {
                if let Some(existing) = self.find(kind, &lookup).await? {
                    return Ok(existing);
                }
                if resource.external() {
                    return Err(BerthError::NotFound {
                        kind: kind.as_str(),
                        id: lookup,
                    });
                }
                let labels = resource.labels(deployment);
                let handle = match kind {
                    ResourceKind::Network => self.runtime.create_network(&lookup, &labels).await?,
                    ResourceKind::Volume => self.runtime.create_volume(&lookup, &labels).await?,
                };
                *created_flag = true;
                Ok::<_, BerthError>(handle)
            })
            .await
            .cloned();
        self.settle(&key, &cell);
        let handle = resolved?;

        let action = if created {
            ResourceAction::Created
        } else {
            ResourceAction::Reused
        };
        tracing::debug!(kind = %kind, name = %name, handle = %handle, action = ?action, "resource ensured");
        Ok(Ensured { handle, action })
    }

    /// Ensures a resource and describes the result as a report entry.
    ///
    /// # Errors
    ///
    /// Only [`BerthError::RuntimeUnavailable`] is returned; other failures
    /// are reported as [`ResourceAction::Failed`].
    pub async fn ensure_reported(
        &self,
        deployment: &Deployment,
        resource: Resource<'_>,
    ) -> Result<ResourceReport> {
        let name = resource.runtime_name(deployment);
        match self.ensure(deployment, resource).await {
            Ok(ensured) => Ok(ResourceReport::new(resource.kind(), name, ensured.action)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(kind = %resource.kind(), name = %name, error = %e, "resource could not be ensured");
                Ok(ResourceReport::failed(resource.kind(), name, e.to_string()))
            }
        }
    }

    /// Releases a resource at the end of its life.
    ///
    /// Anonymous volumes and networks are removed. Named volumes are
    /// preserved unless `policy.purge` is set. External resources are never
    /// removed.
    ///
    /// # Errors
    ///
    /// Only [`BerthError::RuntimeUnavailable`] is returned; other failures
    /// are reported as [`ResourceAction::Failed`].
    pub async fn release(
        &self,
        deployment: &Deployment,
        resource: Resource<'_>,
        policy: ReleasePolicy,
    ) -> Result<ResourceReport> {
        let kind = resource.kind();
        let name = resource.runtime_name(deployment);
        let keep = resource.external()
            || matches!(
                resource,
                Resource::Volume(VolumeSpec {
                    scope: VolumeScope::Deployment,
                    ..
                })
            ) && !policy.purge;
        if keep {
            tracing::debug!(kind = %kind, name = %name, "resource preserved");
            return Ok(ResourceReport::new(kind, name, ResourceAction::Preserved));
        }

        let outcome = async {
            if let Some(handle) = self.find(kind, &name).await? {
                match kind {
                    ResourceKind::Network => self.runtime.remove_network(&handle).await?,
                    ResourceKind::Volume => self.runtime.remove_volume(&handle).await?,
                }
            }
            Ok::<_, BerthError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                tracing::info!(kind = %kind, name = %name, "resource removed");
                Ok(ResourceReport::new(kind, name, ResourceAction::Removed))
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(kind = %kind, name = %name, error = %e, "resource could not be removed");
                Ok(ResourceReport::failed(kind, name, e.to_string()))
            }
        }
    }

    async fn find(&self, kind: ResourceKind, name: &str) -> Result<Option<RuntimeHandle>> {
        match kind {
            ResourceKind::Network => self.runtime.find_network(name).await,
            ResourceKind::Volume => self.runtime.find_volume(name).await,
        }
    }
}
