//! Startup and teardown ordering for a deployment.

use berth_common::error::Result;

use crate::graph::DependencyGraph;
use crate::model::{Deployment, ServiceSpec};

/// Returns services in startup order, dependencies first.
///
/// Among services that are ready at the same time, names are taken in
/// lexicographic order, so the result is identical across runs.
///
/// # Errors
///
/// Returns [`berth_common::error::BerthError::CyclicDependency`] with the
/// cycle path if the dependencies are cyclic. No partial order is returned.
pub fn order(deployment: &Deployment) -> Result<Vec<&ServiceSpec>> {
    let graph = DependencyGraph::from_deployment(deployment)?;
    let names = graph.resolve_order()?;
    Ok(names
        .iter()
        .filter_map(|name| deployment.service(name))
        .collect())
}

/// Returns services in teardown order, the reverse of [`order`].
///
/// # Errors
///
/// Same as [`order`].
pub fn teardown_order(deployment: &Deployment) -> Result<Vec<&ServiceSpec>> {
    let mut services = order(deployment)?;
    services.reverse();
    Ok(services)
}
