//! In-process simulated runtime.
//!
//! Keeps containers, networks, and volumes in memory and supports fault
//! injection, so orchestration can be exercised without a container
//! engine. Every call is recorded in a journal, including calls that fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_common::constants::{LABEL_DEPLOYMENT, LABEL_SERVICE};
use berth_common::error::{BerthError, Result};
use berth_common::types::RuntimeHandle;
use tokio::sync::{broadcast, mpsc};

use super::{
    BindingSource, ContainerConfig, ContainerRuntime, ContainerStatus, ContainerSummary, Labels,
    LogChunks,
};

const LOG_CHANNEL_CAPACITY: usize = 64;

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Trait method name, e.g. `create_container`.
    pub operation: &'static str,
    /// Container, network, or volume the call targeted.
    pub target: String,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Always,
    Times(u32),
}

impl Fault {
    /// Consumes one occurrence, returning whether this call fails.
    fn trip(&mut self) -> bool {
        match self {
            Self::Always => true,
            Self::Times(0) => false,
            Self::Times(n) => {
                *n -= 1;
                true
            }
        }
    }
}

#[derive(Debug)]
struct Container {
    name: String,
    config: ContainerConfig,
    status: ContainerStatus,
    log: Vec<u8>,
    log_tx: broadcast::Sender<Option<Vec<u8>>>,
}

impl Container {
    fn service(&self) -> Option<&str> {
        self.config.labels.get(LABEL_SERVICE).map(String::as_str)
    }

    fn append_log(&mut self, line: &str) {
        let mut chunk = line.as_bytes().to_vec();
        chunk.push(b'\n');
        self.log.extend_from_slice(&chunk);
        let _ = self.log_tx.send(Some(chunk));
    }

    fn finish_log(&self) {
        let _ = self.log_tx.send(None);
    }
}

#[derive(Debug, Clone)]
struct Resource {
    handle: RuntimeHandle,
    labels: Labels,
}

#[derive(Debug, Default)]
struct State {
    unavailable: bool,
    containers: BTreeMap<RuntimeHandle, Container>,
    networks: BTreeMap<String, Resource>,
    volumes: BTreeMap<String, Resource>,
    create_faults: HashMap<String, Fault>,
    start_faults: HashMap<String, Fault>,
    start_delays: HashMap<String, Duration>,
    stop_delays: HashMap<String, Duration>,
    stalled_logs: HashSet<String>,
    boot_logs: HashMap<String, Vec<String>>,
    missing_images: HashSet<String>,
    occupied_ports: HashSet<u16>,
    journal: Vec<Call>,
}

impl State {
    fn record(&mut self, operation: &'static str, target: impl Into<String>) -> Result<()> {
        self.journal.push(Call {
            operation,
            target: target.into(),
        });
        if self.unavailable {
            return Err(BerthError::RuntimeUnavailable {
                message: "simulated runtime is offline".into(),
            });
        }
        Ok(())
    }

    fn container(&self, handle: &RuntimeHandle) -> Result<&Container> {
        self.containers.get(handle).ok_or_else(|| not_found("container", handle))
    }

    fn container_mut(&mut self, handle: &RuntimeHandle) -> Result<&mut Container> {
        self.containers
            .get_mut(handle)
            .ok_or_else(|| not_found("container", handle))
    }

    fn service_of(&self, handle: &RuntimeHandle) -> Option<String> {
        self.containers
            .get(handle)
            .and_then(Container::service)
            .map(str::to_string)
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.occupied_ports.contains(&port)
            || self.containers.values().any(|c| {
                c.status == ContainerStatus::Running
                    && c.config.ports.iter().any(|p| p.host == Some(port))
            })
    }
}

fn not_found(kind: &'static str, id: impl ToString) -> BerthError {
    BerthError::NotFound {
        kind,
        id: id.to_string(),
    }
}

/// A runtime that lives entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

impl MemoryRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every `create_container` for `service` fail.
    pub fn fail_create(&self, service: &str) {
        let _ = self.lock().create_faults.insert(service.into(), Fault::Always);
    }

    /// Makes the next `times` creates for `service` fail.
    pub fn fail_create_times(&self, service: &str, times: u32) {
        let _ = self
            .lock()
            .create_faults
            .insert(service.into(), Fault::Times(times));
    }

    /// Makes every `start` for `service` fail.
    pub fn fail_start(&self, service: &str) {
        let _ = self.lock().start_faults.insert(service.into(), Fault::Always);
    }

    /// Makes the next `times` starts for `service` fail.
    pub fn fail_start_times(&self, service: &str, times: u32) {
        let _ = self
            .lock()
            .start_faults
            .insert(service.into(), Fault::Times(times));
    }

    /// Delays every `start` for `service` by `delay`.
    pub fn delay_start(&self, service: &str, delay: Duration) {
        let _ = self.lock().start_delays.insert(service.into(), delay);
    }

    /// Delays every `stop` for `service` by `delay`.
    pub fn delay_stop(&self, service: &str, delay: Duration) {
        let _ = self.lock().stop_delays.insert(service.into(), delay);
    }

    /// Keeps every log stream of a running `service` open, even one that
    /// was not asked to follow.
    pub fn stall_logs(&self, service: &str) {
        let _ = self.lock().stalled_logs.insert(service.into());
    }

    /// Lines `service` prints each time its container starts.
    pub fn boot_logs(&self, service: &str, lines: &[&str]) {
        let _ = self.lock().boot_logs.insert(
            service.into(),
            lines.iter().map(|l| (*l).to_string()).collect(),
        );
    }

    /// Appends a line to the output of every running container of `service`.
    pub fn write_log(&self, service: &str, line: &str) {
        let mut state = self.lock();
        for container in state.containers.values_mut() {
            if container.service() == Some(service) && container.status == ContainerStatus::Running
            {
                container.append_log(line);
            }
        }
    }

    /// Simulates the main process of `service` exiting with `code`.
    pub fn exit_container(&self, service: &str, code: i64) {
        let mut state = self.lock();
        for container in state.containers.values_mut() {
            if container.service() == Some(service) && container.status == ContainerStatus::Running
            {
                container.status = ContainerStatus::Exited { code: Some(code) };
                container.finish_log();
            }
        }
    }

    /// Simulates the runtime giving up on every container of `service`.
    pub fn mark_dead(&self, service: &str) {
        let mut state = self.lock();
        for container in state.containers.values_mut() {
            if container.service() == Some(service) {
                container.status = ContainerStatus::Dead;
                container.finish_log();
            }
        }
    }

    /// Makes `image` unavailable to `create_container`.
    pub fn remove_image(&self, image: &str) {
        let _ = self.lock().missing_images.insert(image.into());
    }

    /// Marks a host port as bound by something outside the runtime.
    pub fn occupy_port(&self, port: u16) {
        let _ = self.lock().occupied_ports.insert(port);
    }

    /// Takes the runtime offline or brings it back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of recorded calls to `operation`.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Every recorded call, oldest first.
    #[must_use]
    pub fn journal(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    /// Names of existing containers, sorted.
    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Status of the container with the given name.
    #[must_use]
    pub fn container_status(&self, name: &str) -> Option<ContainerStatus> {
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.status)
    }

    /// Names of existing networks, sorted.
    #[must_use]
    pub fn network_names(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }

    /// Names of existing volumes, sorted.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.lock().volumes.keys().cloned().collect()
    }

    /// Labels a volume was created with.
    #[must_use]
    pub fn volume_labels(&self, name: &str) -> Option<Labels> {
        self.lock().volumes.get(name).map(|r| r.labels.clone())
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn ping(&self) -> Result<()> {
        self.lock().record("ping", "runtime")
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<RuntimeHandle> {
        let mut state = self.lock();
        state.record("create_container", &config.name)?;

        let service = config.labels.get(LABEL_SERVICE).cloned().unwrap_or_default();
        if state
            .create_faults
            .get_mut(&service)
            .is_some_and(Fault::trip)
        {
            return Err(BerthError::runtime("create", "simulated create failure"));
        }
        if state.missing_images.contains(&config.image) {
            return Err(BerthError::ImageUnavailable {
                image: config.image.clone(),
            });
        }
        if let Some(port) = config
            .ports
            .iter()
            .filter_map(|p| p.host)
            .find(|&port| state.port_in_use(port))
        {
            return Err(BerthError::PortAllocated { port });
        }
        if state.containers.values().any(|c| c.name == config.name) {
            return Err(BerthError::runtime(
                "create",
                format!("container name \"{}\" is already in use", config.name),
            ));
        }
        for mount in &config.mounts {
            if let BindingSource::Volume(volume) = &mount.source {
                if !state.volumes.contains_key(volume) {
                    return Err(BerthError::runtime(
                        "create",
                        format!("no such volume: {volume}"),
                    ));
                }
            }
        }
        if let Some(network) = config
            .networks
            .iter()
            .find(|n| !state.networks.contains_key(*n))
        {
            return Err(BerthError::runtime(
                "create",
                format!("network {network} not found"),
            ));
        }

        let handle = RuntimeHandle::generate();
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        let _ = state.containers.insert(
            handle.clone(),
            Container {
                name: config.name.clone(),
                config: config.clone(),
                status: ContainerStatus::Created,
                log: Vec::new(),
                log_tx,
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.record("start", handle.as_str())?;
            let _ = state.container(handle)?;
            state
                .service_of(handle)
                .and_then(|s| state.start_delays.get(&s).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let service = state.service_of(handle).unwrap_or_default();
        if state.start_faults.get_mut(&service).is_some_and(Fault::trip) {
            let container = state.container_mut(handle)?;
            container.status = ContainerStatus::Exited { code: Some(1) };
            return Err(BerthError::runtime("start", "simulated start failure"));
        }
        let boot = state.boot_logs.get(&service).cloned().unwrap_or_default();
        let container = state.container_mut(handle)?;
        container.status = ContainerStatus::Running;
        for line in &boot {
            container.append_log(line);
        }
        Ok(())
    }

    async fn stop(&self, handle: &RuntimeHandle, _grace: Duration) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.record("stop", handle.as_str())?;
            let _ = state.container(handle)?;
            state
                .service_of(handle)
                .and_then(|s| state.stop_delays.get(&s).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let container = state.container_mut(handle)?;
        if container.status == ContainerStatus::Running {
            container.status = ContainerStatus::Exited { code: Some(0) };
            container.finish_log();
        }
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<()> {
        let mut state = self.lock();
        state.record("kill", handle.as_str())?;
        let container = state.container_mut(handle)?;
        container.status = ContainerStatus::Exited { code: Some(137) };
        container.finish_log();
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
        let mut state = self.lock();
        state.record("remove", handle.as_str())?;
        if state.container(handle)?.status == ContainerStatus::Running {
            return Err(BerthError::runtime(
                "remove",
                "cannot remove a running container",
            ));
        }
        if let Some(container) = state.containers.remove(handle) {
            container.finish_log();
        }
        Ok(())
    }

    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus> {
        let mut state = self.lock();
        state.record("status", handle.as_str())?;
        Ok(state.container(handle)?.status)
    }

    async fn list_containers(&self, deployment: &str) -> Result<Vec<ContainerSummary>> {
        let mut state = self.lock();
        state.record("list_containers", deployment)?;
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.config.labels.get(LABEL_DEPLOYMENT).map(String::as_str) == Some(deployment))
            .map(|(handle, c)| ContainerSummary {
                handle: handle.clone(),
                name: c.name.clone(),
                service: c.service().map(str::to_string),
                image: c.config.image.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn create_network(&self, name: &str, labels: &Labels) -> Result<RuntimeHandle> {
        let mut state = self.lock();
        state.record("create_network", name)?;
        if state.networks.contains_key(name) {
            return Err(BerthError::runtime(
                "create_network",
                format!("network with name {name} already exists"),
            ));
        }
        let handle = RuntimeHandle::generate();
        let _ = state.networks.insert(
            name.to_string(),
            Resource {
                handle: handle.clone(),
                labels: labels.clone(),
            },
        );
        Ok(handle)
    }

    async fn find_network(&self, name: &str) -> Result<Option<RuntimeHandle>> {
        let mut state = self.lock();
        state.record("find_network", name)?;
        Ok(state.networks.get(name).map(|r| r.handle.clone()))
    }

    async fn remove_network(&self, handle: &RuntimeHandle) -> Result<()> {
        let mut state = self.lock();
        state.record("remove_network", handle.as_str())?;
        let name = state
            .networks
            .iter()
            .find(|(_, r)| &r.handle == handle)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| not_found("network", handle))?;
        if state.containers.values().any(|c| c.config.networks.contains(&name)) {
            return Err(BerthError::runtime(
                "remove_network",
                format!("network {name} has active endpoints"),
            ));
        }
        let _ = state.networks.remove(&name);
        Ok(())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<RuntimeHandle> {
        let mut state = self.lock();
        state.record("create_volume", name)?;
        if state.volumes.contains_key(name) {
            return Err(BerthError::runtime(
                "create_volume",
                format!("volume {name} already exists"),
            ));
        }
        let handle = RuntimeHandle::new(name);
        let _ = state.volumes.insert(
            name.to_string(),
            Resource {
                handle: handle.clone(),
                labels: labels.clone(),
            },
        );
        Ok(handle)
    }

    async fn find_volume(&self, name: &str) -> Result<Option<RuntimeHandle>> {
        let mut state = self.lock();
        state.record("find_volume", name)?;
        Ok(state.volumes.get(name).map(|r| r.handle.clone()))
    }

    async fn remove_volume(&self, handle: &RuntimeHandle) -> Result<()> {
        let mut state = self.lock();
        state.record("remove_volume", handle.as_str())?;
        let name = state
            .volumes
            .iter()
            .find(|(_, r)| &r.handle == handle)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| not_found("volume", handle))?;
        let in_use = state.containers.values().any(|c| {
            c.config
                .mounts
                .iter()
                .any(|m| m.source == BindingSource::Volume(name.clone()))
        });
        if in_use {
            return Err(BerthError::runtime(
                "remove_volume",
                format!("volume {name} is in use"),
            ));
        }
        let _ = state.volumes.remove(&name);
        Ok(())
    }

    async fn stream_logs(&self, handle: &RuntimeHandle, follow: bool) -> Result<LogChunks> {
        let (backlog, live) = {
            let mut state = self.lock();
            state.record("stream_logs", handle.as_str())?;
            let stalled = state
                .service_of(handle)
                .is_some_and(|s| state.stalled_logs.contains(&s));
            let container = state.container(handle)?;
            let live = ((follow || stalled) && container.status == ContainerStatus::Running)
                .then(|| container.log_tx.subscribe());
            (container.log.clone(), live)
        };

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        drop(tokio::spawn(async move {
            if !backlog.is_empty() && tx.send(backlog).await.is_err() {
                return;
            }
            let Some(mut live) = live else {
                return;
            };
            loop {
                match live.recv().await {
                    Ok(Some(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        }));
        Ok(rx)
    }
}
