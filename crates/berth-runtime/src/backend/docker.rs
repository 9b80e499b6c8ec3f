//! Docker engine adapter driven through the `docker` command-line client.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use berth_common::constants::{LABEL_DEPLOYMENT, LABEL_SERVICE};
use berth_common::error::{BerthError, Result};
use berth_common::types::RuntimeHandle;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{
    BindingSource, ContainerConfig, ContainerRuntime, ContainerStatus, ContainerSummary, Labels,
    LogChunks,
};

const LOG_CHUNK_SIZE: usize = 8 * 1024;
const LOG_CHANNEL_CAPACITY: usize = 64;

/// Runtime backed by a local Docker engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: PathBuf,
}

/// `docker ps --format '{{json .}}'` row.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    image: String,
    names: String,
    state: String,
    #[serde(default)]
    labels: String,
}

/// `docker inspect --format '{{json .State}}'` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
}

impl DockerRuntime {
    /// Locates the `docker` client on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::RuntimeUnavailable`] if no client is installed.
    pub fn detect() -> Result<Self> {
        let binary = which::which("docker").map_err(|e| BerthError::RuntimeUnavailable {
            message: format!("docker client not found on PATH: {e}"),
        })?;
        tracing::debug!(binary = %binary.display(), "using docker client");
        Ok(Self { binary })
    }

    /// Uses an explicit client binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Path of the client binary in use.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs the client and returns trimmed stdout.
    async fn run(&self, operation: &'static str, args: &[String]) -> Result<String> {
        tracing::debug!(operation, args = ?args, "docker call");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BerthError::RuntimeUnavailable {
                message: format!("failed to run {}: {e}", self.binary.display()),
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(classify(
                operation,
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    /// Runs an inspect-style command, mapping "no such object" to `None`.
    async fn lookup(&self, operation: &'static str, args: &[String]) -> Result<Option<String>> {
        match self.run(operation, args).await {
            Ok(out) => Ok(Some(out)),
            Err(BerthError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

/// Maps client stderr onto the shared error type.
fn classify(operation: &'static str, stderr: &str) -> BerthError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return BerthError::RuntimeUnavailable {
            message: stderr.to_string(),
        };
    }
    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        if let Some(port) = allocated_port(stderr) {
            return BerthError::PortAllocated { port };
        }
    }
    if lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("no such image")
        || lower.contains("repository does not exist")
    {
        return BerthError::ImageUnavailable {
            image: stderr.to_string(),
        };
    }
    if lower.contains("no such") || lower.contains("not found") {
        return BerthError::NotFound {
            kind: "runtime object",
            id: stderr.to_string(),
        };
    }
    BerthError::runtime(operation, stderr)
}

/// Extracts the host port from "Bind for 0.0.0.0:8080 failed: port is already allocated".
fn allocated_port(stderr: &str) -> Option<u16> {
    let (before, _) = stderr.split_once(" failed")?;
    before.rsplit(':').next()?.trim().parse().ok()
}

fn parse_labels(raw: &str) -> Labels {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn parse_status(state: &str, exit_code: Option<i64>) -> ContainerStatus {
    match state {
        "created" => ContainerStatus::Created,
        "running" | "restarting" | "paused" => ContainerStatus::Running,
        "dead" => ContainerStatus::Dead,
        _ => ContainerStatus::Exited { code: exit_code },
    }
}

fn label_args(labels: &Labels) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{k}={v}")])
        .collect()
}

fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut out = args(["create", "--name"]);
    out.push(config.name.clone());
    out.extend(label_args(&config.labels));
    for (key, value) in &config.env {
        out.push("--env".into());
        out.push(format!("{key}={value}"));
    }
    for port in &config.ports {
        out.push("--publish".into());
        out.push(port.to_string());
    }
    for mount in &config.mounts {
        let source = match &mount.source {
            BindingSource::Volume(name) => name.clone(),
            BindingSource::Host(path) => path.display().to_string(),
        };
        let mode = if mount.read_only { ":ro" } else { "" };
        out.push("--volume".into());
        out.push(format!("{source}:{}{mode}", mount.target));
    }
    if let Some(first) = config.networks.first() {
        out.push("--network".into());
        out.push(first.clone());
    }
    out.push(config.image.clone());
    out.extend(config.command.iter().cloned());
    out
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        let _ = self
            .run("ping", &args(["version", "--format", "{{.Server.Version}}"]))
            .await
            .map_err(|e| match e {
                BerthError::Runtime { message, .. } => BerthError::RuntimeUnavailable { message },
                other => other,
            })?;
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<RuntimeHandle> {
        let id = self.run("create", &create_args(config)).await?;
        let handle = RuntimeHandle::new(id);
        for network in config.networks.iter().skip(1) {
            let _ = self
                .run(
                    "network connect",
                    &args(["network", "connect", network.as_str(), handle.as_str()]),
                )
                .await?;
        }
        Ok(handle)
    }

    async fn start(&self, handle: &RuntimeHandle) -> Result<()> {
        let _ = self.run("start", &args(["start", handle.as_str()])).await?;
        Ok(())
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let _ = self
            .run("stop", &args(["stop", "--time", secs.as_str(), handle.as_str()]))
            .await?;
        Ok(())
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<()> {
        let _ = self.run("kill", &args(["kill", handle.as_str()])).await?;
        Ok(())
    }

    async fn remove(&self, handle: &RuntimeHandle) -> Result<()> {
        let _ = self.run("remove", &args(["rm", handle.as_str()])).await?;
        Ok(())
    }

    async fn status(&self, handle: &RuntimeHandle) -> Result<ContainerStatus> {
        let out = self
            .run(
                "inspect",
                &args([
                    "inspect",
                    "--type",
                    "container",
                    "--format",
                    "{{json .State}}",
                    handle.as_str(),
                ]),
            )
            .await?;
        let state: InspectState = serde_json::from_str(&out)?;
        Ok(parse_status(&state.status, state.exit_code))
    }

    async fn list_containers(&self, deployment: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("label={LABEL_DEPLOYMENT}={deployment}");
        let out = self
            .run(
                "list",
                &args([
                    "ps",
                    "--all",
                    "--no-trunc",
                    "--filter",
                    filter.as_str(),
                    "--format",
                    "{{json .}}",
                ]),
            )
            .await?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let row: PsRow = serde_json::from_str(line)?;
                let labels = parse_labels(&row.labels);
                Ok(ContainerSummary {
                    handle: RuntimeHandle::new(row.id),
                    name: row.names,
                    service: labels.get(LABEL_SERVICE).cloned(),
                    image: row.image,
                    status: parse_status(&row.state, None),
                })
            })
            .collect()
    }

    async fn create_network(&self, name: &str, labels: &Labels) -> Result<RuntimeHandle> {
        let mut cmd = args(["network", "create", "--driver", "bridge"]);
        cmd.extend(label_args(labels));
        cmd.push(name.to_string());
        Ok(RuntimeHandle::new(self.run("network create", &cmd).await?))
    }

    async fn find_network(&self, name: &str) -> Result<Option<RuntimeHandle>> {
        Ok(self
            .lookup(
                "network inspect",
                &args(["network", "inspect", "--format", "{{.Id}}", name]),
            )
            .await?
            .map(RuntimeHandle::new))
    }

    async fn remove_network(&self, handle: &RuntimeHandle) -> Result<()> {
        let _ = self
            .run("network rm", &args(["network", "rm", handle.as_str()]))
            .await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<RuntimeHandle> {
        let mut cmd = args(["volume", "create"]);
        cmd.extend(label_args(labels));
        cmd.push(name.to_string());
        Ok(RuntimeHandle::new(self.run("volume create", &cmd).await?))
    }

    async fn find_volume(&self, name: &str) -> Result<Option<RuntimeHandle>> {
        Ok(self
            .lookup(
                "volume inspect",
                &args(["volume", "inspect", "--format", "{{.Name}}", name]),
            )
            .await?
            .map(RuntimeHandle::new))
    }

    async fn remove_volume(&self, handle: &RuntimeHandle) -> Result<()> {
        let _ = self
            .run("volume rm", &args(["volume", "rm", handle.as_str()]))
            .await?;
        Ok(())
    }

    async fn stream_logs(&self, handle: &RuntimeHandle, follow: bool) -> Result<LogChunks> {
        let mut cmd = Command::new(&self.binary);
        let _ = cmd.arg("logs");
        if follow {
            let _ = cmd.arg("--follow");
        }
        let mut child = cmd
            .arg(handle.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BerthError::RuntimeUnavailable {
                message: format!("failed to run {}: {e}", self.binary.display()),
            })?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        drop(tokio::spawn(async move {
            let out = pump(stdout, tx.clone());
            let err = pump(stderr, tx);
            let _ = tokio::join!(out, err);
            let _ = child.wait().await;
        }));
        Ok(rx)
    }
}

/// Copies a pipe into the chunk channel until EOF or the receiver goes away.
async fn pump<R>(reader: Option<R>, tx: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0_u8; LOG_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use berth_compose::model::{PortMapping, Protocol};

    use super::*;
    use crate::backend::MountBinding;

    #[test]
    fn classifies_common_failures() {
        assert!(matches!(
            classify(
                "create",
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock."
            ),
            BerthError::RuntimeUnavailable { .. }
        ));
        assert!(matches!(
            classify(
                "start",
                "driver failed programming external connectivity: Bind for 0.0.0.0:8080 failed: port is already allocated"
            ),
            BerthError::PortAllocated { port: 8080 }
        ));
        assert!(matches!(
            classify("create", "pull access denied for nope, repository does not exist"),
            BerthError::ImageUnavailable { .. }
        ));
        assert!(matches!(
            classify("network inspect", "Error: No such network: app_default"),
            BerthError::NotFound { .. }
        ));
        assert!(matches!(
            classify("start", "exec format error"),
            BerthError::Runtime { .. }
        ));
    }

    #[test]
    fn parses_ps_rows() {
        let line = r#"{"ID":"abc123","Image":"postgres:16","Names":"shop-db-1","State":"exited","Labels":"io.berth.deployment=shop,io.berth.service=db"}"#;
        let row: PsRow = serde_json::from_str(line).expect("row");
        let labels = parse_labels(&row.labels);
        assert_eq!(labels.get(LABEL_SERVICE).map(String::as_str), Some("db"));
        assert_eq!(
            parse_status(&row.state, None),
            ContainerStatus::Exited { code: None }
        );
    }

    #[test]
    fn builds_create_arguments() {
        let config = ContainerConfig {
            name: "shop-db-1".into(),
            image: "postgres:16".into(),
            command: vec!["postgres".into(), "-c".into(), "fsync=off".into()],
            env: BTreeMap::from([("POSTGRES_PASSWORD".into(), "secret".into())]),
            ports: vec![PortMapping {
                host_ip: None,
                host: Some(15432),
                container: 5432,
                protocol: Protocol::Tcp,
            }],
            mounts: vec![MountBinding {
                source: BindingSource::Volume("shop_data".into()),
                target: "/var/lib/postgresql/data".into(),
                read_only: false,
            }],
            networks: vec!["shop_default".into()],
            labels: Labels::from([(LABEL_SERVICE.into(), "db".into())]),
        };
        let cmd = create_args(&config).join(" ");
        assert!(cmd.starts_with("create --name shop-db-1"));
        assert!(cmd.contains("--label io.berth.service=db"));
        assert!(cmd.contains("--env POSTGRES_PASSWORD=secret"));
        assert!(cmd.contains("--publish 15432:5432/tcp"));
        assert!(cmd.contains("--volume shop_data:/var/lib/postgresql/data"));
        assert!(cmd.contains("--network shop_default"));
        assert!(cmd.ends_with("postgres:16 postgres -c fsync=off"));
    }
}
