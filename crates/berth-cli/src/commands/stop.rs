//! `berth stop`: stop containers without removing them.

use anyhow::Context as _;
use clap::Args;

use super::{Context, Status};
use crate::output;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the document is invalid or the runtime cannot be
/// reached.
pub async fn execute(_args: StopArgs, ctx: &Context) -> anyhow::Result<Status> {
    let deployment = ctx.deployment()?;
    let engine = ctx.engine()?;
    let result = engine
        .stop(&deployment, ctx.cancel())
        .await
        .with_context(|| format!("cannot stop {}", deployment.name))?;
    output::print_operation(&result);
    Ok(result.outcome().into())
}
