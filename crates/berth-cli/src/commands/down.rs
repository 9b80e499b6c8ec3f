//! `berth down`: stop and remove containers, networks, and optionally volumes.

use anyhow::Context as _;
use berth_runtime::engine::DownOptions;
use clap::Args;

use super::{Context, Status};
use crate::output;

/// Arguments for the `down` command.
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Also remove named volumes declared in the document.
    #[arg(short = 'v', long)]
    pub purge_volumes: bool,
}

/// Executes the `down` command.
///
/// Ctrl-C lets the current runtime call finish, then stops the teardown.
///
/// # Errors
///
/// Returns an error if the document is invalid or the runtime cannot be
/// reached.
pub async fn execute(args: DownArgs, ctx: &Context) -> anyhow::Result<Status> {
    let deployment = ctx.deployment()?;
    let engine = ctx.engine()?;
    let result = engine
        .down(
            &deployment,
            DownOptions {
                purge_volumes: args.purge_volumes,
            },
            ctx.cancel(),
        )
        .await
        .with_context(|| format!("cannot tear down {}", deployment.name))?;
    output::print_operation(&result);
    Ok(result.outcome().into())
}
