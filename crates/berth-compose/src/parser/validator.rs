//! Static analysis of a lowered deployment.
//!
//! Checks for duplicate names, undefined references, unreachable probes,
//! and dependency cycles before anything is handed to the runtime.

use std::collections::HashSet;

use berth_common::error::{BerthError, ParseErrorKind, Result};

use crate::graph::DependencyGraph;
use crate::model::{Deployment, MountSource, ProbeCheck};

/// Validates a deployment for semantic correctness.
///
/// # Checks performed
///
/// 1. At least one service is declared.
/// 2. No duplicate service, network, or volume names.
/// 3. Every dependency, named mount source, and network reference resolves.
/// 4. A TCP probe targets a container port published to the host.
/// 5. Dependencies are acyclic; the error carries the cycle path.
///
/// # Errors
///
/// Returns the first failing check as a parse error of the matching kind.
pub fn validate(deployment: &Deployment) -> Result<()> {
    tracing::debug!(deployment = %deployment.name, "validating deployment");
    if deployment.services.is_empty() {
        return Err(BerthError::parse(
            ParseErrorKind::Syntax,
            "document declares no services",
        ));
    }
    check_duplicates("service", deployment.services.iter().map(|s| s.name.as_str()))?;
    check_duplicates("network", deployment.networks.iter().map(|n| n.name.as_str()))?;
    check_duplicates("volume", deployment.volumes.iter().map(|v| v.name.as_str()))?;
    check_references(deployment)?;
    check_probes(deployment)?;
    check_acyclic(deployment)?;
    Ok(())
}

fn check_duplicates<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(BerthError::parse(
                ParseErrorKind::DuplicateName,
                format!("duplicate {kind} name: \"{name}\""),
            ));
        }
    }
    Ok(())
}

fn unknown(message: String) -> BerthError {
    BerthError::parse(ParseErrorKind::UnknownReference, message)
}

fn check_references(deployment: &Deployment) -> Result<()> {
    for service in &deployment.services {
        for dependency in &service.depends_on {
            if deployment.service(dependency).is_none() {
                return Err(unknown(format!(
                    "service \"{}\" depends on undefined service \"{dependency}\"",
                    service.name
                )));
            }
        }
        for mount in &service.mounts {
            if let MountSource::Named(volume) = &mount.source {
                if deployment.volume(volume).is_none() {
                    return Err(unknown(format!(
                        "service \"{}\" mounts undefined volume \"{volume}\"",
                        service.name
                    )));
                }
            }
        }
        for network in &service.networks {
            if deployment.network(network).is_none() {
                return Err(unknown(format!(
                    "service \"{}\" attaches to undefined network \"{network}\"",
                    service.name
                )));
            }
        }
    }
    Ok(())
}

fn check_probes(deployment: &Deployment) -> Result<()> {
    for service in &deployment.services {
        let Some(probe) = &service.healthcheck else {
            continue;
        };
        if let ProbeCheck::Tcp { port } = probe.check {
            if service.published_port(port).is_none() {
                return Err(BerthError::parse(
                    ParseErrorKind::Syntax,
                    format!(
                        "service \"{}\" probes port {port}, which is not published to the host",
                        service.name
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_acyclic(deployment: &Deployment) -> Result<()> {
    let graph = DependencyGraph::from_deployment(deployment)?;
    match graph.find_cycle() {
        Some(cycle) => Err(BerthError::parse(
            ParseErrorKind::CyclicDependency,
            cycle.join(" -> "),
        )),
        None => Ok(()),
    }
}
