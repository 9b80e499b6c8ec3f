//! System-wide constants and defaults.

use std::time::Duration;

/// Application name used in CLI output and resource labels.
pub const APP_NAME: &str = "berth";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";

/// Document file names searched, in order, when no file is given.
pub const DEFAULT_DOCUMENT_FILES: &[&str] = &[
    "berth.yaml",
    "berth.yml",
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Name of the network synthesized when a document declares none.
pub const DEFAULT_NETWORK: &str = "default";

/// Label carrying the owning deployment name.
pub const LABEL_DEPLOYMENT: &str = "io.berth.deployment";

/// Label carrying the owning service name.
pub const LABEL_SERVICE: &str = "io.berth.service";

/// Label marking a volume as anonymous (container-scoped).
pub const LABEL_ANONYMOUS: &str = "io.berth.anonymous";

/// Interval between health probe attempts.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Time a probe may take to pass before the service is marked failed.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// First delay between bring-up attempts.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Upper bound for the exponential restart backoff.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Grace period between a graceful stop and a forced kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Attempt budget for `on-failure` when the document gives none.
pub const DEFAULT_ON_FAILURE_ATTEMPTS: u32 = 5;

/// Timeout for a single TCP reachability probe connect.
pub const TCP_PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
