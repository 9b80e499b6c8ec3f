//! CLI command definitions and dispatch.

pub mod down;
pub mod logs;
pub mod plan;
pub mod ps;
pub mod stop;
pub mod up;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use berth_common::config::OrchestratorConfig;
use berth_compose::model::Deployment;
use berth_compose::parser;
use berth_compose::parser::syntax::parse_duration;
use berth_runtime::backend::ContainerRuntime;
use berth_runtime::backend::docker::DockerRuntime;
use berth_runtime::engine::Engine;
use berth_runtime::report::Outcome;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Berth: multi-service container orchestration.
#[derive(Parser, Debug)]
#[command(name = "berth", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Deployment document; defaults to the first of `berth.yaml`,
    /// `compose.yaml`, ... in the current directory.
    #[arg(short = 'f', long = "file", global = true, env = "BERTH_FILE")]
    pub file: Option<PathBuf>,

    /// Deployment name; defaults to the document's `name:` or its directory.
    #[arg(short = 'p', long = "project-name", global = true, env = "BERTH_PROJECT_NAME")]
    pub project_name: Option<String>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Default health probe deadline, e.g. `30s`.
    #[arg(long, global = true, env = "BERTH_HEALTH_TIMEOUT", value_parser = parse_duration)]
    pub health_timeout: Option<Duration>,

    /// Default interval between health probe attempts.
    #[arg(long, global = true, env = "BERTH_HEALTH_INTERVAL", value_parser = parse_duration)]
    pub health_interval: Option<Duration>,

    /// Grace period before a stop escalates to a kill.
    #[arg(long, global = true, env = "BERTH_STOP_GRACE", value_parser = parse_duration)]
    pub stop_grace: Option<Duration>,

    /// Upper bound of the restart backoff.
    #[arg(long, global = true, env = "BERTH_BACKOFF_CEILING", value_parser = parse_duration)]
    pub backoff_ceiling: Option<Duration>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and start every service in dependency order.
    Up(up::UpArgs),
    /// Stop and remove containers and networks.
    Down(down::DownArgs),
    /// Show the state of every service.
    Ps(ps::PsArgs),
    /// Print service logs.
    Logs(logs::LogsArgs),
    /// Stop containers without removing them.
    Stop(stop::StopArgs),
    /// Show the resolved deployment and startup order without touching the runtime.
    Plan(plan::PlanArgs),
}

/// How a command ended, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Everything reached its target.
    Success,
    /// Some services or resources failed.
    PartialFailure,
}

impl Status {
    /// Exit code of a fatal error.
    pub const FATAL: u8 = 2;
}

impl From<Outcome> for Status {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::PartialFailure => Self::PartialFailure,
        }
    }
}

impl From<Status> for ExitCode {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => Self::SUCCESS,
            Status::PartialFailure => Self::from(1),
        }
    }
}

/// Per-invocation state shared by command handlers.
#[derive(Debug)]
pub struct Context {
    global: GlobalArgs,
    cancel: CancellationToken,
}

impl Context {
    /// Orchestrator settings with command-line overrides applied.
    pub fn config(&self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            health_interval: self.global.health_interval.unwrap_or(defaults.health_interval),
            health_timeout: self.global.health_timeout.unwrap_or(defaults.health_timeout),
            stop_grace: self.global.stop_grace.unwrap_or(defaults.stop_grace),
            backoff_ceiling: self.global.backoff_ceiling.unwrap_or(defaults.backoff_ceiling),
            ..defaults
        }
    }

    /// Loads and validates the deployment document.
    ///
    /// # Errors
    ///
    /// Returns an error if no document is found or it is rejected.
    pub fn deployment(&self) -> anyhow::Result<Deployment> {
        let path = match &self.global.file {
            Some(path) => path.clone(),
            None => {
                let cwd = std::env::current_dir().context("cannot read current directory")?;
                parser::find_document(&cwd)?
            }
        };
        let deployment = parser::load(&path, self.global.project_name.as_deref())
            .with_context(|| format!("invalid deployment document {}", path.display()))?;
        tracing::debug!(deployment = %deployment.name, services = deployment.services.len(), "deployment loaded");
        Ok(deployment)
    }

    /// Builds an engine over the local Docker engine.
    ///
    /// # Errors
    ///
    /// Returns an error if no `docker` client is installed.
    pub fn engine(&self) -> anyhow::Result<Engine> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::detect()?);
        Ok(Engine::new(runtime, self.config()))
    }

    /// Token cancelled on Ctrl-C.
    pub const fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command cannot run to completion. Per-service
/// failures are reported through [`Status::PartialFailure`] instead.
pub async fn execute(cli: Cli) -> anyhow::Result<Status> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received, shutting down");
        on_signal.cancel();
    })
    .context("cannot install the interrupt handler")?;

    let ctx = Context {
        global: cli.global,
        cancel,
    };
    match cli.command {
        Command::Up(args) => up::execute(args, &ctx).await,
        Command::Down(args) => down::execute(args, &ctx).await,
        Command::Ps(args) => ps::execute(args, &ctx).await,
        Command::Logs(args) => logs::execute(args, &ctx).await,
        Command::Stop(args) => stop::execute(args, &ctx).await,
        Command::Plan(args) => plan::execute(&args, &ctx),
    }
}
