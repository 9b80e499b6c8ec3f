//! `berth ps`: show the state of every service.

use clap::Args;

use super::{Context, Status};
use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `ps` command.
///
/// Services without a container are listed as `planned`.
///
/// # Errors
///
/// Returns an error if the document is invalid or the runtime cannot be
/// reached.
pub async fn execute(args: PsArgs, ctx: &Context) -> anyhow::Result<Status> {
    let deployment = ctx.deployment()?;
    let engine = ctx.engine()?;
    let services = engine.ps(&deployment).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&services)?);
    } else {
        output::print_services(&services);
    }
    Ok(Status::Success)
}
