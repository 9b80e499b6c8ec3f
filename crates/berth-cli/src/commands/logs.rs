//! `berth logs`: print service logs.

use anyhow::Context as _;
use berth_compose::resolver;
use berth_runtime::logs::LogStream;
use clap::Args;
use tokio_util::sync::CancellationToken;

use super::{Context, Status};
use crate::output;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Service name; every service when omitted.
    pub service: Option<String>,

    /// Keep streaming new output until interrupted.
    #[arg(short, long)]
    pub follow: bool,
}

/// Executes the `logs` command.
///
/// Output of a single service is printed as-is; output of several
/// services is prefixed with the service name.
///
/// # Errors
///
/// Returns an error if the service is unknown, has no container, or the
/// runtime cannot stream its log.
pub async fn execute(args: LogsArgs, ctx: &Context) -> anyhow::Result<Status> {
    let deployment = ctx.deployment()?;
    let engine = ctx.engine()?;

    if let Some(service) = &args.service {
        let stream = engine
            .logs(&deployment, service, args.follow)
            .await
            .with_context(|| format!("cannot read logs of {service}"))?;
        drain(stream, ctx.cancel(), false).await;
        return Ok(Status::Success);
    }

    if args.follow {
        let stream = engine.attach(&deployment).await?;
        drain(stream, ctx.cancel(), true).await;
        return Ok(Status::Success);
    }

    for service in resolver::order(&deployment)? {
        match engine.logs(&deployment, &service.name, false).await {
            Ok(stream) => drain(stream, ctx.cancel(), true).await,
            Err(e) => tracing::debug!(service = %service.name, error = %e, "no logs"),
        }
    }
    Ok(Status::Success)
}

async fn drain(mut stream: LogStream, cancel: &CancellationToken, prefixed: bool) {
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => return,
            line = stream.next() => line,
        };
        match line {
            Some(line) if prefixed => println!("{}", output::prefixed_line(&line)),
            Some(line) => println!("{}", line.text),
            None => return,
        }
    }
}
