//! `berth plan`: show the resolved deployment without touching the runtime.

use berth_compose::model::{Deployment, ImageSource};
use berth_compose::resolver;
use clap::Args;
use serde::Serialize;

use super::{Context, Status};
use crate::output;

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct Plan<'a> {
    deployment: &'a Deployment,
    order: Vec<&'a str>,
}

/// Executes the `plan` command.
///
/// Parses and validates the document, resolves the startup order, and
/// prints both.
///
/// # Errors
///
/// Returns an error if the document is invalid or its dependencies are
/// cyclic.
pub fn execute(args: &PlanArgs, ctx: &Context) -> anyhow::Result<Status> {
    let deployment = ctx.deployment()?;
    let order: Vec<&str> = resolver::order(&deployment)?
        .into_iter()
        .map(|s| s.name.as_str())
        .collect();

    if args.json {
        let plan = Plan {
            deployment: &deployment,
            order,
        };
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(Status::Success);
    }

    output::heading(&format!("Deployment plan for: {}", deployment.name));
    for name in &order {
        let Some(service) = deployment.service(name) else {
            continue;
        };
        println!("  + {name}");
        match &service.source {
            ImageSource::Image(image) => println!("      image: {image}"),
            ImageSource::Build { context, .. } => println!(
                "      build: {} (as {})",
                context.display(),
                service.image_ref(&deployment.name)
            ),
        }
        if !service.depends_on.is_empty() {
            let deps: Vec<&str> = service.depends_on.iter().map(String::as_str).collect();
            println!("      after: {}", deps.join(", "));
        }
        for port in &service.ports {
            println!("      port: {port}");
        }
        if let Some(probe) = &service.healthcheck {
            println!("      health: {}", output::describe_probe(probe));
        }
        if service.restart != berth_common::types::RestartPolicy::Never {
            println!("      restart: {}", service.restart);
        }
    }

    println!();
    for network in &deployment.networks {
        println!("  network {}", deployment.network_runtime_name(network));
    }
    for volume in &deployment.volumes {
        println!("  volume  {}", deployment.volume_runtime_name(volume));
    }
    println!();
    println!("  {} service(s) will be started.", order.len());
    Ok(Status::Success)
}
