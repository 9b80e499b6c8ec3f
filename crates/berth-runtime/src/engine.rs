//! Orchestration engine: `up`, `down`, `stop`, `ps`, `logs`, and `attach`.
//!
//! The engine owns one [`ServiceTable`] and one [`Reconciler`]. Every
//! operation starts from a snapshot of the runtime's containers for the
//! deployment, so an engine can pick up containers created by an earlier
//! process.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use berth_common::config::OrchestratorConfig;
use berth_common::error::{BerthError, Result, ServiceError};
use berth_common::types::ServiceState;
use berth_compose::model::{Deployment, MountSource, ServiceSpec};
use berth_compose::resolver;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{ContainerRuntime, ContainerSummary};
use crate::lifecycle::ServiceController;
use crate::logs::LogStream;
use crate::reconciler::{ReleasePolicy, Reconciler, Resource};
use crate::report::{
    Operation, OperationResult, ResourceAction, ResourceKind, ResourceReport, ServiceReport,
};
use crate::state::ServiceTable;

/// Options for [`Engine::up`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpOptions {
    /// Return once every service has settled instead of staying in the
    /// foreground until cancelled.
    pub detached: bool,
    /// Abort the whole bring-up on the first failed service and roll back
    /// what this operation created.
    pub fail_fast: bool,
}

/// Options for [`Engine::down`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownOptions {
    /// Also remove deployment-scoped named volumes.
    pub purge_volumes: bool,
}

type Snapshot = HashMap<String, ContainerSummary>;

/// Drives whole deployments.
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    reconciler: Arc<Reconciler>,
    table: ServiceTable,
    controller: Arc<ServiceController>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine over a runtime.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: OrchestratorConfig) -> Self {
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&runtime)));
        let table = ServiceTable::new();
        let controller = Arc::new(ServiceController::new(
            Arc::clone(&runtime),
            Arc::clone(&reconciler),
            table.clone(),
            config,
        ));
        Self {
            runtime,
            reconciler,
            table,
            controller,
        }
    }

    /// The engine's service table.
    #[must_use]
    pub const fn table(&self) -> &ServiceTable {
        &self.table
    }

    /// Brings a deployment up.
    ///
    /// Networks and named volumes are reconciled first; then every
    /// service is started as soon as all of its dependencies are healthy.
    /// Independent services start concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error only for fatal conditions: a dependency cycle
    /// (before any runtime call) or an unreachable runtime. Per-service
    /// failures are reported in the result.
    pub async fn up(
        &self,
        deployment: &Deployment,
        options: UpOptions,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let started_at = Utc::now();
        let order = resolver::order(deployment)?;
        tracing::info!(
            deployment = %deployment.name,
            services = order.len(),
            detached = options.detached,
            fail_fast = options.fail_fast,
            "bringing deployment up"
        );
        self.runtime.ping().await?;
        let snapshot = self.snapshot(deployment).await?;

        let mut resources = Vec::new();
        let mut failed_networks = BTreeSet::new();
        let mut failed_volumes = BTreeSet::new();
        for network in &deployment.networks {
            let report = self
                .reconciler
                .ensure_reported(deployment, Resource::Network(network))
                .await?;
            if report.action == ResourceAction::Failed {
                let _ = failed_networks.insert(network.name.as_str());
            }
            resources.push(report);
        }
        for volume in &deployment.volumes {
            let report = self
                .reconciler
                .ensure_reported(deployment, Resource::Volume(volume))
                .await?;
            if report.action == ResourceAction::Failed {
                let _ = failed_volumes.insert(volume.name.as_str());
            }
            resources.push(report);
        }

        for service in &order {
            self.observe(service, &snapshot);
            if let Some(missing) = missing_resource(service, &failed_networks, &failed_volumes) {
                self.table.fail(
                    &service.name,
                    ServiceError::Resource {
                        message: missing,
                    },
                );
            }
        }

        let run = cancel.child_token();
        let fatal = self.start_services(deployment, &order, options, &run).await;
        if let Some(error) = fatal {
            tracing::error!(deployment = %deployment.name, error = %error, "bring-up aborted");
            return Err(error);
        }

        let mut services = self.service_reports(&order);
        let rolled_back = options.fail_fast && run.is_cancelled() && !cancel.is_cancelled();
        if rolled_back {
            let released = self.roll_back(deployment, &order, &resources, cancel).await?;
            resources.extend(released);
            for report in &mut services {
                if let Some(record) = self.table.get(&report.name) {
                    if report.state != ServiceState::Failed {
                        report.state = record.state;
                    }
                    report.handle = record.handle;
                }
            }
        } else if !options.detached {
            tracing::info!(deployment = %deployment.name, "deployment up, waiting for cancellation");
            cancel.cancelled().await;
            for service in order.iter().rev() {
                let _ = self.controller.stop(&service.name).await?;
            }
            services = self.service_reports(&order);
        }

        let result = OperationResult {
            operation: Operation::Up,
            deployment: deployment.name.clone(),
            services,
            resources,
            started_at,
            finished_at: Utc::now(),
            cancelled: options.detached && cancel.is_cancelled(),
        };
        tracing::info!(deployment = %deployment.name, outcome = ?result.outcome(), "up finished");
        Ok(result)
    }

    /// Runs one task per service and collects their outcomes. Returns the
    /// first fatal error, if any.
    async fn start_services(
        &self,
        deployment: &Deployment,
        order: &[&ServiceSpec],
        options: UpOptions,
        run: &CancellationToken,
    ) -> Option<BerthError> {
        let shared = Arc::new(deployment.clone());
        let mut tasks = JoinSet::new();
        for service in order {
            let dependencies: Vec<Dependency> = service
                .depends_on
                .iter()
                .filter_map(|dep| {
                    self.table
                        .subscribe_dependency(dep)
                        .map(|(rx, replacing)| Dependency {
                            name: dep.clone(),
                            rx,
                            replacing,
                        })
                })
                .collect();
            let name = service.name.clone();
            let controller = Arc::clone(&self.controller);
            let table = self.table.clone();
            let deployment = Arc::clone(&shared);
            let token = run.clone();
            let _ = tasks.spawn(async move {
                let outcome =
                    run_service(&controller, &table, &deployment, &name, dependencies, &token).await;
                (name, outcome)
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "service task did not complete");
                    continue;
                }
            };
            match outcome {
                Ok(ServiceState::Failed) if options.fail_fast && !run.is_cancelled() => {
                    tracing::warn!(service = %name, "service failed, cancelling remaining startups");
                    run.cancel();
                }
                Ok(_) => {}
                Err(BerthError::Cancelled) => self.table.fail(&name, ServiceError::Cancelled),
                Err(e) if e.is_fatal() => {
                    run.cancel();
                    let _ = fatal.get_or_insert(e);
                }
                Err(e) => self.table.fail(
                    &name,
                    ServiceError::Start {
                        message: e.to_string(),
                    },
                ),
            }
        }
        fatal
    }

    /// Tears down what a failed `up` created: its containers and the
    /// networks and volumes that did not exist before.
    async fn roll_back(
        &self,
        deployment: &Deployment,
        order: &[&ServiceSpec],
        ensured: &[ResourceReport],
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceReport>> {
        tracing::warn!(deployment = %deployment.name, "rolling back bring-up");
        let mut reports = Vec::new();
        for service in order.iter().rev() {
            let created = self
                .table
                .get(&service.name)
                .is_some_and(|r| r.created_by_operation && r.handle.is_some());
            if created {
                reports.extend(self.controller.tear_down(deployment, service, cancel).await?);
            }
        }
        if cancel.is_cancelled() {
            return Ok(reports);
        }

        let created = |kind: ResourceKind, name: &str| {
            ensured
                .iter()
                .any(|r| r.kind == kind && r.name == name && r.action == ResourceAction::Created)
        };
        let purge = ReleasePolicy { purge: true };
        for network in &deployment.networks {
            if created(ResourceKind::Network, &deployment.network_runtime_name(network)) {
                reports.push(
                    self.reconciler
                        .release(deployment, Resource::Network(network), purge)
                        .await?,
                );
            }
        }
        for volume in &deployment.volumes {
            if created(ResourceKind::Volume, &deployment.volume_runtime_name(volume)) {
                reports.push(
                    self.reconciler
                        .release(deployment, Resource::Volume(volume), purge)
                        .await?,
                );
            }
        }
        Ok(reports)
    }

    /// Tears a deployment down in reverse dependency order, then removes
    /// its networks and, with `purge_volumes`, its named volumes.
    ///
    /// Once `cancel` fires no new teardown step is started; a runtime call
    /// already in flight completes and the partial result is returned
    /// with `cancelled` set.
    ///
    /// # Errors
    ///
    /// Returns an error for a dependency cycle or an unreachable runtime.
    pub async fn down(
        &self,
        deployment: &Deployment,
        options: DownOptions,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let started_at = Utc::now();
        let order = resolver::teardown_order(deployment)?;
        tracing::info!(deployment = %deployment.name, purge_volumes = options.purge_volumes, "tearing deployment down");
        self.runtime.ping().await?;
        let snapshot = self.snapshot(deployment).await?;

        let mut resources = Vec::new();
        for service in &order {
            self.observe(service, &snapshot);
        }
        for service in &order {
            if cancel.is_cancelled() {
                break;
            }
            resources.extend(self.controller.tear_down(deployment, service, cancel).await?);
        }

        let policy = ReleasePolicy {
            purge: options.purge_volumes,
        };
        let resources_to_release = deployment
            .networks
            .iter()
            .map(Resource::Network)
            .chain(deployment.volumes.iter().map(Resource::Volume));
        for resource in resources_to_release {
            if cancel.is_cancelled() {
                break;
            }
            resources.push(self.reconciler.release(deployment, resource, policy).await?);
        }
        let cancelled = cancel.is_cancelled();
        if cancelled {
            tracing::warn!(deployment = %deployment.name, "teardown interrupted");
        }

        let mut services = self.service_reports(&order);
        services.reverse();
        for service in &order {
            if self.table.state(&service.name) == Some(ServiceState::Removed) {
                self.table.forget(&service.name);
            }
        }

        let result = OperationResult {
            operation: Operation::Down,
            deployment: deployment.name.clone(),
            services,
            resources,
            started_at,
            finished_at: Utc::now(),
            cancelled,
        };
        tracing::info!(deployment = %deployment.name, outcome = ?result.outcome(), "down finished");
        Ok(result)
    }

    /// Stops every running service in reverse dependency order without
    /// removing containers. Stops nothing further once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error for a dependency cycle or an unreachable runtime.
    pub async fn stop(
        &self,
        deployment: &Deployment,
        cancel: &CancellationToken,
    ) -> Result<OperationResult> {
        let started_at = Utc::now();
        let order = resolver::teardown_order(deployment)?;
        self.runtime.ping().await?;
        let snapshot = self.snapshot(deployment).await?;
        for service in &order {
            self.observe(service, &snapshot);
        }
        for service in &order {
            if cancel.is_cancelled() {
                break;
            }
            let _ = self.controller.stop(&service.name).await?;
        }
        let mut services = self.service_reports(&order);
        services.reverse();
        Ok(OperationResult {
            operation: Operation::Stop,
            deployment: deployment.name.clone(),
            services,
            resources: Vec::new(),
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
        })
    }

    /// Reports every service's state in startup order.
    ///
    /// Services this engine manages are read from its table; the rest
    /// from the runtime. Nothing is modified.
    ///
    /// # Errors
    ///
    /// Returns an error for a dependency cycle, or if the runtime must be
    /// consulted and cannot be reached.
    pub async fn ps(&self, deployment: &Deployment) -> Result<Vec<ServiceReport>> {
        let order = resolver::order(deployment)?;
        let snapshot = if order.iter().all(|s| self.table.contains(&s.name)) {
            Snapshot::new()
        } else {
            self.snapshot(deployment).await?
        };
        Ok(order
            .iter()
            .map(|service| {
                self.table.get(&service.name).map_or_else(
                    || match snapshot.get(&service.name) {
                        Some(container) => ServiceReport {
                            name: service.name.clone(),
                            state: container.status.as_service_state(),
                            handle: Some(container.handle.clone()),
                            attempts: 0,
                            error: None,
                        },
                        None => ServiceReport {
                            name: service.name.clone(),
                            state: ServiceState::Planned,
                            handle: None,
                            attempts: 0,
                            error: None,
                        },
                    },
                    |record| ServiceReport {
                        name: service.name.clone(),
                        state: record.state,
                        handle: record.handle,
                        attempts: record.attempts,
                        error: record.error,
                    },
                )
            })
            .collect())
    }

    /// Streams one service's log.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::NotFound`] for an unknown service or one with
    /// no container, or the runtime's error.
    pub async fn logs(&self, deployment: &Deployment, service: &str, follow: bool) -> Result<LogStream> {
        if deployment.service(service).is_none() {
            return Err(BerthError::NotFound {
                kind: "service",
                id: service.to_string(),
            });
        }
        let handle = match self.table.handle(service) {
            Some(handle) => handle,
            None => self
                .snapshot(deployment)
                .await?
                .remove(service)
                .map(|c| c.handle)
                .ok_or_else(|| BerthError::NotFound {
                    kind: "container",
                    id: deployment.container_name(service),
                })?,
        };
        let chunks = self.runtime.stream_logs(&handle, follow).await?;
        Ok(LogStream::single(service, chunks))
    }

    /// Follows the logs of every service that has a container, prefixing
    /// each line with its service name.
    ///
    /// # Errors
    ///
    /// Returns an error for a dependency cycle or if the runtime cannot
    /// stream a container's log.
    pub async fn attach(&self, deployment: &Deployment) -> Result<LogStream> {
        let order = resolver::order(deployment)?;
        let snapshot = self.snapshot(deployment).await?;
        let mut sources = Vec::new();
        for service in order {
            let handle = self
                .table
                .handle(&service.name)
                .or_else(|| snapshot.get(&service.name).map(|c| c.handle.clone()));
            if let Some(handle) = handle {
                sources.push((service.name.clone(), self.runtime.stream_logs(&handle, true).await?));
            }
        }
        Ok(LogStream::merge(sources))
    }

    async fn snapshot(&self, deployment: &Deployment) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for container in self.runtime.list_containers(&deployment.name).await? {
            let Some(service) = container.service.clone() else {
                continue;
            };
            if deployment.service(&service).is_some() {
                let _ = snapshot.entry(service).or_insert(container);
            }
        }
        tracing::debug!(deployment = %deployment.name, containers = snapshot.len(), "runtime snapshot taken");
        Ok(snapshot)
    }

    fn observe(&self, service: &ServiceSpec, snapshot: &Snapshot) {
        match snapshot.get(&service.name) {
            Some(container) => self.table.observe(
                &service.name,
                container.status.as_service_state(),
                Some(container.handle.clone()),
            ),
            None => self.table.observe(&service.name, ServiceState::Planned, None),
        }
    }

    fn service_reports(&self, order: &[&ServiceSpec]) -> Vec<ServiceReport> {
        order
            .iter()
            .map(|service| {
                let record = self.table.get(&service.name);
                ServiceReport {
                    name: service.name.clone(),
                    state: record.as_ref().map_or(ServiceState::Planned, |r| r.state),
                    handle: record.as_ref().and_then(|r| r.handle.clone()),
                    attempts: record.as_ref().map_or(0, |r| r.attempts),
                    error: record.and_then(|r| r.error),
                }
            })
            .collect()
    }
}

/// Waits for every dependency to be healthy, then brings the service up.
async fn run_service(
    controller: &ServiceController,
    table: &ServiceTable,
    deployment: &Deployment,
    name: &str,
    dependencies: Vec<Dependency>,
    cancel: &CancellationToken,
) -> Result<ServiceState> {
    // Held back before bring-up, e.g. by a missing network. A dead
    // container observed in the snapshot is Failed without an error and
    // still goes through the restart policy.
    if table
        .get(name)
        .is_some_and(|r| r.state == ServiceState::Failed && r.error.is_some())
    {
        return Ok(ServiceState::Failed);
    }
    for Dependency {
        name: dependency,
        mut rx,
        replacing,
    } in dependencies
    {
        let settled = tokio::select! {
            () = cancel.cancelled() => return Err(BerthError::Cancelled),
            settled = dependency_settled(&mut rx, replacing) => settled,
        };
        if settled != Some(ServiceState::Healthy) {
            tracing::warn!(service = name, dependency = %dependency, "dependency did not become healthy");
            table.fail(name, ServiceError::DependencyFailed { dependency });
            return Ok(ServiceState::Failed);
        }
    }
    let service = deployment.service(name).ok_or_else(|| BerthError::NotFound {
        kind: "service",
        id: name.to_string(),
    })?;
    controller.bring_up(deployment, service, cancel).await
}

/// A service another one waits on.
struct Dependency {
    name: String,
    rx: watch::Receiver<ServiceState>,
    /// The dependency is a dead container awaiting replacement.
    replacing: bool,
}

/// Waits until a dependency is healthy or has failed for good. `None`
/// means its state channel closed.
async fn dependency_settled(
    rx: &mut watch::Receiver<ServiceState>,
    replacing: bool,
) -> Option<ServiceState> {
    if replacing {
        rx.changed().await.ok()?;
    }
    rx.wait_for(|s| matches!(s, ServiceState::Healthy | ServiceState::Failed))
        .await
        .ok()
        .map(|s| *s)
}

/// Name of the first network or volume the service needs that could not
/// be provided.
fn missing_resource(
    service: &ServiceSpec,
    failed_networks: &BTreeSet<&str>,
    failed_volumes: &BTreeSet<&str>,
) -> Option<String> {
    service
        .networks
        .iter()
        .find(|n| failed_networks.contains(n.as_str()))
        .map(|n| format!("network {n}"))
        .or_else(|| {
            service.mounts.iter().find_map(|m| match &m.source {
                MountSource::Named(v) if failed_volumes.contains(v.as_str()) => {
                    Some(format!("volume {v}"))
                }
                _ => None,
            })
        })
}
