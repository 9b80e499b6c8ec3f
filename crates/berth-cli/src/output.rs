//! Formatted output helpers for CLI commands.
//!
//! Provides consistent table formatting, colored state indicators, and
//! human-readable durations. Colors are only emitted on a terminal.

use std::io::IsTerminal;
use std::time::Duration;

use berth_common::types::ServiceState;
use berth_compose::model::{HealthProbe, ProbeCheck};
use berth_runtime::logs::LogLine;
use berth_runtime::report::{OperationResult, Outcome, ResourceAction, ServiceReport};

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

const SERVICE_COLORS: &[&str] = &["\x1b[36m", "\x1b[33m", "\x1b[32m", "\x1b[35m", "\x1b[34m"];

fn paint(text: &str, color: &str, enabled: bool) -> String {
    if enabled {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

fn stdout_colored() -> bool {
    std::io::stdout().is_terminal()
}

/// `error:` label for fatal messages on stderr.
pub fn error_label() -> String {
    paint("error:", RED, std::io::stderr().is_terminal())
}

/// Prints an informational note to stderr.
pub fn note(message: &str) {
    eprintln!("{}", paint(message, DIM, std::io::stderr().is_terminal()));
}

/// Prints a title with an underline.
pub fn heading(title: &str) {
    println!("{title}");
    println!("{}", "\u{2550}".repeat(title.chars().count()));
    println!();
}

/// Color of a lifecycle state.
#[must_use]
pub const fn state_color(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Healthy | ServiceState::Running => GREEN,
        ServiceState::Failed => RED,
        ServiceState::Created | ServiceState::Starting | ServiceState::Stopping => YELLOW,
        ServiceState::Planned | ServiceState::Stopped | ServiceState::Removed => DIM,
    }
}

/// Formats a state, padded to `width` before coloring so columns line up.
#[must_use]
pub fn format_state(state: ServiceState, width: usize, colored: bool) -> String {
    paint(&format!("{:<width$}", state.to_string()), state_color(state), colored)
}

/// Formats a duration as `850ms`, `4.2s`, or `2m05s`.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{millis}ms")
    } else if millis < 60_000 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        let secs = elapsed.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

/// One-line description of a health probe.
#[must_use]
pub fn describe_probe(probe: &HealthProbe) -> String {
    let check = match &probe.check {
        ProbeCheck::Tcp { port } => format!("tcp :{port}"),
        ProbeCheck::Log { pattern } => format!("log /{pattern}/"),
    };
    match probe.timeout {
        Some(timeout) => format!("{check} within {}", format_elapsed(timeout)),
        None => check,
    }
}

/// Renders services as a table.
#[must_use]
pub fn services_table(services: &[ServiceReport], colored: bool) -> String {
    let name_width = services
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    let mut out = format!(
        "{:<name_width$}  {:<8}  {:<12}  {}\n",
        "SERVICE", "STATE", "CONTAINER", "ATTEMPTS"
    );
    for service in services {
        let container = service.handle.as_ref().map_or("-", |h| h.short());
        out.push_str(&format!(
            "{:<name_width$}  {}  {:<12}  {}\n",
            service.name,
            format_state(service.state, 8, colored),
            container,
            service.attempts,
        ));
    }
    out
}

/// Prints the `ps` table.
pub fn print_services(services: &[ServiceReport]) {
    if services.is_empty() {
        println!("No services declared.");
        return;
    }
    print!("{}", services_table(services, stdout_colored()));
}

/// Prints an operation result: services, resources, failures, summary.
pub fn print_operation(result: &OperationResult) {
    let colored = stdout_colored();
    heading(&format!("{} {}", result.operation, result.deployment));
    print!("{}", services_table(&result.services, colored));

    if !result.resources.is_empty() {
        println!();
        for resource in &result.resources {
            let action = resource.action.to_string();
            let action = match resource.action {
                ResourceAction::Failed => paint(&action, RED, colored),
                ResourceAction::Created | ResourceAction::Removed => paint(&action, CYAN, colored),
                ResourceAction::Reused | ResourceAction::Preserved => paint(&action, DIM, colored),
            };
            println!("  {:<7} {:<32} {action}", resource.kind, resource.name);
            if let Some(error) = &resource.error {
                println!("          {error}");
            }
        }
    }

    let failures: Vec<_> = result.failed().collect();
    if !failures.is_empty() {
        println!();
        for service in failures {
            let reason = service
                .error
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string);
            println!("  {} {}: {reason}", paint("\u{2717}", RED, colored), service.name);
        }
    }

    let elapsed = (result.finished_at - result.started_at)
        .to_std()
        .unwrap_or_default();
    let summary = match result.outcome() {
        _ if result.cancelled => paint("interrupted", YELLOW, colored),
        Outcome::Success => paint("done", GREEN, colored),
        Outcome::PartialFailure => paint("finished with failures", RED, colored),
    };
    println!();
    println!("  {summary} in {}", format_elapsed(elapsed));
}

/// `service | text` with a stable per-service color.
#[must_use]
pub fn prefixed_line(line: &LogLine) -> String {
    let index = line
        .service
        .bytes()
        .fold(0_usize, |acc, b| acc.wrapping_mul(31).wrapping_add(usize::from(b)));
    let color = SERVICE_COLORS[index % SERVICE_COLORS.len()];
    format!(
        "{} | {}",
        paint(&line.service, color, stdout_colored()),
        line.text
    )
}
