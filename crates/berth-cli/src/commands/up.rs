//! `berth up`: create and start every service in dependency order.

use anyhow::Context as _;
use berth_runtime::engine::UpOptions;
use clap::Args;

use super::{Context, Status};
use crate::output;

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Return once every service has settled instead of staying in the
    /// foreground until interrupted.
    #[arg(short, long)]
    pub detach: bool,

    /// Roll back everything this run created as soon as one service fails.
    #[arg(long)]
    pub fail_fast: bool,
}

/// Executes the `up` command.
///
/// In the foreground, services are stopped (not removed) on Ctrl-C.
///
/// # Errors
///
/// Returns an error if the document is invalid, the dependencies are
/// cyclic, or the runtime cannot be reached.
pub async fn execute(args: UpArgs, ctx: &Context) -> anyhow::Result<Status> {
    let deployment = ctx.deployment()?;
    let engine = ctx.engine()?;
    let options = UpOptions {
        detached: args.detach,
        fail_fast: args.fail_fast,
    };
    if !args.detach {
        output::note("services will be stopped on Ctrl-C");
    }
    let result = engine
        .up(&deployment, options, ctx.cancel())
        .await
        .with_context(|| format!("cannot bring up {}", deployment.name))?;
    output::print_operation(&result);
    Ok(result.outcome().into())
}
