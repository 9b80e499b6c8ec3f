//! Per-service lifecycle: create, start, health-gate, stop, and remove.
//!
//! A [`ServiceController`] drives one service at a time through the state
//! machine in [`ServiceState`], recording every transition in the shared
//! [`ServiceTable`]. Per-service failures are contained in the table;
//! only fatal runtime errors and cancellation are returned as `Err`.

use std::sync::Arc;
use std::time::Duration;

use berth_common::config::OrchestratorConfig;
use berth_common::constants::{LABEL_DEPLOYMENT, LABEL_SERVICE};
use berth_common::error::{BerthError, Result, ServiceError};
use berth_common::types::{RuntimeHandle, ServiceState};
use berth_compose::model::{Deployment, MountSource, ServiceSpec, VolumeSpec};
use tokio_util::sync::CancellationToken;

use crate::backend::{BindingSource, ContainerConfig, ContainerRuntime, Labels, MountBinding};
use crate::health::{self, ProbeOutcome};
use crate::reconciler::{ReleasePolicy, Reconciler, Resource};
use crate::report::ResourceReport;
use crate::restart::RetryPlan;
use crate::state::ServiceTable;

/// Extra time granted to a graceful stop beyond the grace period.
const STOP_MARGIN: Duration = Duration::from_secs(5);

/// Outcome of a single create-and-start attempt.
enum Attempt {
    /// Abort the whole operation.
    Abort(BerthError),
    /// This attempt failed; the restart policy decides what happens next.
    Failed(ServiceError),
}

impl Attempt {
    fn from_error(error: BerthError, wrap: impl FnOnce(String) -> ServiceError) -> Self {
        if error.is_fatal() || matches!(error, BerthError::Cancelled) {
            Self::Abort(error)
        } else {
            Self::Failed(wrap(error.to_string()))
        }
    }
}

impl From<BerthError> for Attempt {
    fn from(error: BerthError) -> Self {
        Self::Abort(error)
    }
}

/// Drives individual services through their lifecycle.
pub struct ServiceController {
    runtime: Arc<dyn ContainerRuntime>,
    reconciler: Arc<Reconciler>,
    table: ServiceTable,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceController {
    /// Creates a controller writing to `table`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reconciler: Arc<Reconciler>,
        table: ServiceTable,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            reconciler,
            table,
            config,
        }
    }

    /// Brings a service up to `Healthy`, or records why it could not.
    ///
    /// The service must already be in the table. Where it starts from
    /// depends on its current state: a planned service is created, a
    /// created or stopped one is started, a running one is only
    /// health-checked. A dead container counts as one failed attempt; it
    /// is removed and replaced if the restart policy allows another.
    ///
    /// Returns the state the service settled in, `Healthy` or `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Cancelled`] if `cancel` fires, or any fatal
    /// runtime error. Neither is recorded against the service.
    pub async fn bring_up(
        &self,
        deployment: &Deployment,
        service: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> Result<ServiceState> {
        let name = service.name.as_str();
        let mut plan = RetryPlan::new(service.restart, &self.config);
        loop {
            if cancel.is_cancelled() {
                return Err(BerthError::Cancelled);
            }
            match self.attempt(deployment, service, cancel).await {
                Ok(()) => break,
                Err(Attempt::Abort(e)) => return Err(e),
                Err(Attempt::Failed(error)) => {
                    let Some(delay) = plan.record_failure() else {
                        self.table.fail(name, error);
                        return Ok(ServiceState::Failed);
                    };
                    tracing::warn!(
                        service = name,
                        error = %error,
                        attempt = plan.used(),
                        retry_in = ?delay,
                        "bring-up attempt failed, retrying"
                    );
                    self.table.set_error(name, error);
                    tokio::select! {
                        () = cancel.cancelled() => return Err(BerthError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if self.table.state(name) == Some(ServiceState::Healthy) {
            return Ok(ServiceState::Healthy);
        }
        let handle = self.require_handle(name)?;
        match health::wait_healthy(self.runtime.as_ref(), &handle, service, &self.config, cancel)
            .await?
        {
            ProbeOutcome::Healthy => {
                self.table.transition(name, ServiceState::Healthy)?;
                Ok(ServiceState::Healthy)
            }
            ProbeOutcome::TimedOut(timeout) => {
                self.table.fail(name, ServiceError::HealthTimeout { timeout });
                Ok(ServiceState::Failed)
            }
        }
    }

    /// One pass from the current state to `Running`.
    async fn attempt(
        &self,
        deployment: &Deployment,
        service: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Attempt> {
        let name = service.name.as_str();
        let mut state = self.table.state(name).ok_or_else(|| BerthError::NotFound {
            kind: "service",
            id: name.to_string(),
        })?;
        if state.is_up() {
            return Ok(());
        }
        let _ = self.table.record_attempt(name);

        if state == ServiceState::Failed {
            return Err(self.discard_dead(name).await);
        }
        if state == ServiceState::Removed {
            self.table.transition(name, ServiceState::Planned)?;
            state = ServiceState::Planned;
        }
        if state == ServiceState::Planned {
            for volume in deployment.anonymous_volumes(service) {
                self.reconciler
                    .ensure(deployment, Resource::Volume(&volume))
                    .await
                    .map_err(|e| {
                        Attempt::from_error(e, |message| ServiceError::Resource { message })
                    })?;
            }
            let config = container_config(deployment, service);
            tracing::debug!(service = name, container = %config.name, image = %config.image, "creating container");
            let handle = self
                .runtime
                .create_container(&config)
                .await
                .map_err(|e| Attempt::from_error(e, |message| ServiceError::Create { message }))?;
            self.table.set_created(name, handle);
            self.table.transition(name, ServiceState::Created)?;
        }

        if cancel.is_cancelled() {
            return Err(Attempt::Abort(BerthError::Cancelled));
        }
        let handle = self.require_handle(name)?;
        self.table.transition(name, ServiceState::Starting)?;
        if let Err(e) = self.runtime.start(&handle).await {
            let outcome = Attempt::from_error(e, |message| ServiceError::Start { message });
            if matches!(outcome, Attempt::Failed(_)) {
                self.table.transition(name, ServiceState::Created)?;
            }
            return Err(outcome);
        }
        self.table.transition(name, ServiceState::Running)?;
        Ok(())
    }

    /// Removes a container the runtime reports as dead and puts the
    /// service back to `Planned`, so the next attempt creates a new one.
    async fn discard_dead(&self, name: &str) -> Attempt {
        let dead = ServiceError::Start {
            message: "container is dead".into(),
        };
        let Some(handle) = self.table.handle(name) else {
            return Attempt::Failed(dead);
        };
        tracing::warn!(service = name, handle = %handle, "container is dead, replacing it");
        if let Err(e) = self.runtime.remove(&handle).await {
            return Attempt::from_error(e, |message| ServiceError::Teardown { message });
        }
        self.table.clear_handle(name);
        let moved = self
            .table
            .transition(name, ServiceState::Removed)
            .and_then(|()| self.table.transition(name, ServiceState::Planned));
        match moved {
            Ok(()) => Attempt::Failed(dead),
            Err(e) => Attempt::Abort(e),
        }
    }

    /// Stops and removes a service's container, then releases its
    /// anonymous volumes.
    ///
    /// Teardown failures are recorded against the service as
    /// [`ServiceError::Teardown`]. Once `cancel` fires no further runtime
    /// call is issued; a stop already in flight still completes.
    ///
    /// # Errors
    ///
    /// Returns only fatal runtime errors.
    pub async fn tear_down(
        &self,
        deployment: &Deployment,
        service: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceReport>> {
        let name = service.name.as_str();
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let state = self.table.state(name).unwrap_or(ServiceState::Planned);
        if let Some(handle) = self.table.handle(name).filter(|_| state.has_container()) {
            if !matches!(state, ServiceState::Created | ServiceState::Stopped)
                && !self.halt(name, &handle).await?
            {
                return Ok(Vec::new());
            }
            if cancel.is_cancelled() {
                tracing::info!(service = name, "teardown interrupted, container left stopped");
                return Ok(Vec::new());
            }
            if let Err(e) = self.runtime.remove(&handle).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.table.fail(
                    name,
                    ServiceError::Teardown {
                        message: e.to_string(),
                    },
                );
                return Ok(Vec::new());
            }
            self.table.transition(name, ServiceState::Removed)?;
            self.table.clear_handle(name);
        }

        let mut reports = Vec::new();
        for volume in deployment.anonymous_volumes(service) {
            reports.push(self.release_anonymous(deployment, &volume).await?);
        }
        Ok(reports)
    }

    async fn release_anonymous(
        &self,
        deployment: &Deployment,
        volume: &VolumeSpec,
    ) -> Result<ResourceReport> {
        self.reconciler
            .release(deployment, Resource::Volume(volume), ReleasePolicy::default())
            .await
    }

    /// Stops a running service without removing its container.
    ///
    /// Returns the state the service is left in.
    ///
    /// # Errors
    ///
    /// Returns only fatal runtime errors.
    pub async fn stop(&self, service: &str) -> Result<ServiceState> {
        let Some(state) = self.table.state(service) else {
            return Ok(ServiceState::Planned);
        };
        if !matches!(
            state,
            ServiceState::Starting | ServiceState::Running | ServiceState::Healthy
        ) {
            return Ok(state);
        }
        let handle = self.require_handle(service)?;
        let _ = self.halt(service, &handle).await?;
        Ok(self.table.state(service).unwrap_or(ServiceState::Stopped))
    }

    /// `Stopping -> Stopped` with kill escalation. Returns whether the
    /// container stopped.
    async fn halt(&self, service: &str, handle: &RuntimeHandle) -> Result<bool> {
        self.table.transition(service, ServiceState::Stopping)?;
        let grace = self.config.stop_grace;
        let graceful = match tokio::time::timeout(grace + STOP_MARGIN, self.runtime.stop(handle, grace)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                tracing::warn!(service, handle = %handle, error = %e, "graceful stop failed, killing");
                false
            }
            Err(_) => {
                tracing::warn!(service, handle = %handle, ?grace, "stop timed out, killing");
                false
            }
        };
        if !graceful {
            if let Err(e) = self.runtime.kill(handle).await {
                if e.is_fatal() {
                    return Err(e);
                }
                self.table.fail(
                    service,
                    ServiceError::Teardown {
                        message: e.to_string(),
                    },
                );
                return Ok(false);
            }
        }
        self.table.transition(service, ServiceState::Stopped)?;
        Ok(true)
    }

    fn require_handle(&self, service: &str) -> Result<RuntimeHandle> {
        self.table.handle(service).ok_or_else(|| BerthError::NotFound {
            kind: "container",
            id: service.to_string(),
        })
    }
}

/// Translates a service spec into the runtime's container request.
#[must_use]
pub fn container_config(deployment: &Deployment, service: &ServiceSpec) -> ContainerConfig {
    let mut anonymous = deployment.anonymous_volumes(service).into_iter();
    let mounts = service
        .mounts
        .iter()
        .filter_map(|mount| {
            let source = match &mount.source {
                MountSource::Named(volume) => BindingSource::Volume(
                    deployment
                        .volume(volume)
                        .map_or_else(|| deployment.scoped_name(volume), |v| deployment.volume_runtime_name(v)),
                ),
                MountSource::Anonymous => {
                    BindingSource::Volume(deployment.volume_runtime_name(&anonymous.next()?))
                }
                MountSource::Bind(path) => BindingSource::Host(path.clone()),
            };
            Some(MountBinding {
                source,
                target: mount.target.clone(),
                read_only: mount.read_only,
            })
        })
        .collect();
    let networks = service
        .networks
        .iter()
        .map(|network| {
            deployment
                .network(network)
                .map_or_else(|| deployment.scoped_name(network), |n| deployment.network_runtime_name(n))
        })
        .collect();

    ContainerConfig {
        name: deployment.container_name(&service.name),
        image: service.image_ref(&deployment.name),
        command: service.command.clone(),
        env: service.environment.clone(),
        ports: service.ports.clone(),
        mounts,
        networks,
        labels: Labels::from([
            (LABEL_DEPLOYMENT.to_string(), deployment.name.clone()),
            (LABEL_SERVICE.to_string(), service.name.clone()),
        ]),
    }
}
