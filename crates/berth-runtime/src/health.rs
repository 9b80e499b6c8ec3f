//! Health probes gating a service's dependents.
//!
//! A probe is polled until it passes or its deadline elapses, unless the
//! operation is cancelled first. A single check is cut off at the deadline
//! too. Without a probe a running service is healthy immediately.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use berth_common::config::OrchestratorConfig;
use berth_common::constants::TCP_PROBE_CONNECT_TIMEOUT;
use berth_common::error::{BerthError, Result};
use berth_common::types::RuntimeHandle;
use berth_compose::model::{HealthProbe, ProbeCheck, ServiceSpec};
use regex::Regex;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ContainerRuntime;

/// Result of waiting on a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe passed.
    Healthy,
    /// The deadline elapsed first.
    TimedOut(Duration),
}

/// A probe bound to one container.
#[derive(Debug)]
pub enum Probe {
    /// Connect to a host address.
    Tcp(SocketAddr),
    /// Search the container log.
    Log(Regex),
}

impl Probe {
    /// Builds the probe for a service's declared check.
    ///
    /// # Errors
    ///
    /// Returns a runtime error if the TCP port is not published or the
    /// log pattern does not compile. Both are rejected at parse time, so
    /// this only fires for hand-built models.
    pub fn for_service(service: &ServiceSpec, probe: &HealthProbe) -> Result<Self> {
        match &probe.check {
            ProbeCheck::Tcp { port } => {
                let mapping = service
                    .ports
                    .iter()
                    .find(|p| p.container == *port && p.host.is_some())
                    .ok_or_else(|| {
                        BerthError::runtime("probe", format!("port {port} is not published"))
                    })?;
                let ip = mapping
                    .host_ip
                    .as_deref()
                    .and_then(|ip| ip.parse::<IpAddr>().ok())
                    .filter(|ip| !ip.is_unspecified())
                    .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
                Ok(Self::Tcp(SocketAddr::new(ip, mapping.host.unwrap_or(*port))))
            }
            ProbeCheck::Log { pattern } => Regex::new(pattern)
                .map(Self::Log)
                .map_err(|e| BerthError::runtime("probe", e.to_string())),
        }
    }

    /// Runs the probe once.
    ///
    /// # Errors
    ///
    /// Propagates [`BerthError::RuntimeUnavailable`] from a log probe;
    /// every other failure counts as "not yet healthy".
    pub async fn check(&self, runtime: &dyn ContainerRuntime, handle: &RuntimeHandle) -> Result<bool> {
        match self {
            Self::Tcp(addr) => Ok(matches!(
                tokio::time::timeout(TCP_PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
                Ok(Ok(_))
            )),
            Self::Log(pattern) => {
                let mut chunks = match runtime.stream_logs(handle, false).await {
                    Ok(chunks) => chunks,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::debug!(handle = %handle, error = %e, "log probe could not read logs");
                        return Ok(false);
                    }
                };
                let mut output = Vec::new();
                while let Some(chunk) = chunks.recv().await {
                    output.extend_from_slice(&chunk);
                }
                Ok(String::from_utf8_lossy(&output)
                    .lines()
                    .any(|line| pattern.is_match(line)))
            }
        }
    }
}

/// Waits until a service is healthy.
///
/// # Errors
///
/// Returns [`BerthError::Cancelled`] if `cancel` fires first, or a fatal
/// runtime error raised while probing.
pub async fn wait_healthy(
    runtime: &dyn ContainerRuntime,
    handle: &RuntimeHandle,
    service: &ServiceSpec,
    config: &OrchestratorConfig,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome> {
    let Some(spec) = &service.healthcheck else {
        return Ok(ProbeOutcome::Healthy);
    };
    let probe = Probe::for_service(service, spec)?;
    let interval = spec.interval.unwrap_or(config.health_interval);
    let timeout = spec.timeout.unwrap_or(config.health_timeout);
    let deadline = Instant::now() + timeout;
    tracing::debug!(service = %service.name, ?interval, ?timeout, "waiting for health probe");

    loop {
        let checked = tokio::select! {
            () = cancel.cancelled() => return Err(BerthError::Cancelled),
            checked = tokio::time::timeout_at(deadline, probe.check(runtime, handle)) => checked,
        };
        let Ok(passed) = checked else {
            tracing::debug!(service = %service.name, "health check still running at the deadline");
            return Ok(ProbeOutcome::TimedOut(timeout));
        };
        if passed? {
            return Ok(ProbeOutcome::Healthy);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(ProbeOutcome::TimedOut(timeout));
        }
        let pause = interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return Err(BerthError::Cancelled),
            () = tokio::time::sleep(pause) => {}
        }
    }
}
