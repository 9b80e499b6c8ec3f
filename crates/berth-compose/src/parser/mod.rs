//! Deployment document parser.
//!
//! Turns YAML text into a validated [`Deployment`] in four phases:
//! variable interpolation, deserialization into the raw document,
//! lowering into the typed model, and static validation.

pub mod document;
pub mod interpolate;
pub mod syntax;
pub mod validator;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use berth_common::constants::{DEFAULT_DOCUMENT_FILES, DEFAULT_NETWORK};
use berth_common::error::{BerthError, ParseErrorKind, Result};
use berth_common::types::RestartPolicy;

use self::document::{
    RawBuild, RawCommand, RawDependsOn, RawDocument, RawEnvironment, RawHealthcheck, RawPort,
    RawService, RawServiceNetworks,
};
use crate::model::{
    Deployment, HealthProbe, ImageSource, MountSource, NetworkDriver, NetworkSpec, ProbeCheck,
    ServiceSpec, VolumeSpec,
};

/// Inputs that influence parsing besides the document text.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Name forced by the caller; wins over the document's `name:` key.
    pub project_name: Option<String>,
    /// Name used when neither the caller nor the document provides one.
    pub default_name: String,
    /// Directory relative build contexts and bind mounts resolve against.
    pub base_dir: PathBuf,
    /// Variables available to `${VAR}` interpolation.
    pub env: BTreeMap<String, String>,
}

/// Parses a document with no interpolation variables.
///
/// `default_name` names the deployment unless the document carries a
/// `name:` key.
///
/// # Errors
///
/// Returns a parse error describing the first problem found.
pub fn parse(document: &str, default_name: &str) -> Result<Deployment> {
    parse_with(
        document,
        &ParseOptions {
            default_name: default_name.to_string(),
            base_dir: PathBuf::from("."),
            ..ParseOptions::default()
        },
    )
}

/// Parses a document with explicit options.
///
/// # Errors
///
/// Returns a parse error describing the first problem found.
pub fn parse_with(document: &str, options: &ParseOptions) -> Result<Deployment> {
    let text = interpolate::interpolate(document, &options.env)?;
    let raw: RawDocument = serde_yaml::from_str(&text).map_err(yaml_error)?;

    let name = options
        .project_name
        .as_deref()
        .or(raw.name.as_deref())
        .unwrap_or(&options.default_name);
    let name = normalize_name(name);
    if name.is_empty() {
        return Err(BerthError::parse(
            ParseErrorKind::Syntax,
            "deployment name is empty after normalisation",
        ));
    }

    let deployment = lower(&raw, name, options)?;
    validator::validate(&deployment)?;
    tracing::debug!(
        deployment = %deployment.name,
        services = deployment.services.len(),
        networks = deployment.networks.len(),
        volumes = deployment.volumes.len(),
        "parsed deployment"
    );
    Ok(deployment)
}

/// Reads and parses a document file.
///
/// The deployment is named after the directory containing the file unless
/// `project_name` or the document's `name:` key says otherwise. Variables
/// are taken from the process environment.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or a parse error.
pub fn load(path: &Path, project_name: Option<&str>) -> Result<Deployment> {
    let text = std::fs::read_to_string(path).map_err(|source| BerthError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let base_dir = std::fs::canonicalize(&base_dir).unwrap_or(base_dir);
    let default_name = base_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    tracing::info!(path = %path.display(), "loading deployment document");
    parse_with(
        &text,
        &ParseOptions {
            project_name: project_name.map(str::to_string),
            default_name,
            base_dir,
            env: std::env::vars().collect(),
        },
    )
}

/// Finds the first default document file in `dir`.
///
/// # Errors
///
/// Returns [`BerthError::NotFound`] if none of the default names exist.
pub fn find_document(dir: &Path) -> Result<PathBuf> {
    DEFAULT_DOCUMENT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| BerthError::NotFound {
            kind: "deployment document",
            id: dir.display().to_string(),
        })
}

/// Lowercases a name and drops characters outside `[a-z0-9_-]`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        .collect()
}

fn yaml_error(err: serde_yaml::Error) -> BerthError {
    let message = err.to_string();
    let kind = if message.contains("duplicate") {
        ParseErrorKind::DuplicateName
    } else {
        ParseErrorKind::Syntax
    };
    BerthError::parse(kind, message)
}

fn syntax_error(message: impl Into<String>) -> BerthError {
    BerthError::parse(ParseErrorKind::Syntax, message)
}

fn lower(raw: &RawDocument, name: String, options: &ParseOptions) -> Result<Deployment> {
    let mut networks = Vec::new();
    for (net_name, net) in raw.networks.iter() {
        let net = net.as_ref();
        if let Some(driver) = net.and_then(|n| n.driver.as_deref()) {
            if driver != "bridge" {
                return Err(syntax_error(format!(
                    "network \"{net_name}\": unsupported driver \"{driver}\""
                )));
            }
        }
        networks.push(NetworkSpec {
            name: net_name.to_string(),
            driver: NetworkDriver::Bridge,
            external: net.is_some_and(|n| n.external),
        });
    }

    let volumes = raw
        .volumes
        .iter()
        .map(|(vol_name, vol)| VolumeSpec {
            external: vol.as_ref().is_some_and(|v| v.external),
            ..VolumeSpec::named(vol_name)
        })
        .collect();

    let services = raw
        .services
        .iter()
        .map(|(svc_name, svc)| lower_service(svc_name, svc, options))
        .collect::<Result<Vec<_>>>()?;

    let needs_default = services
        .iter()
        .any(|s| s.networks.iter().any(|n| n == DEFAULT_NETWORK));
    if needs_default && !networks.iter().any(|n| n.name == DEFAULT_NETWORK) {
        networks.push(NetworkSpec {
            name: DEFAULT_NETWORK.to_string(),
            driver: NetworkDriver::Bridge,
            external: false,
        });
    }

    Ok(Deployment {
        name,
        services,
        networks,
        volumes,
    })
}

fn is_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn lower_service(name: &str, raw: &RawService, options: &ParseOptions) -> Result<ServiceSpec> {
    if !is_service_name(name) {
        return Err(syntax_error(format!("invalid service name \"{name}\"")));
    }

    let source = match (&raw.image, &raw.build) {
        (Some(image), _) if !image.trim().is_empty() => ImageSource::Image(image.trim().to_string()),
        (_, Some(build)) => lower_build(build, &options.base_dir),
        _ => {
            return Err(syntax_error(format!(
                "service \"{name}\" declares neither image nor build"
            )));
        }
    };

    let command = match &raw.command {
        None => Vec::new(),
        Some(RawCommand::Shell(line)) => vec!["/bin/sh".into(), "-c".into(), line.clone()],
        Some(RawCommand::Exec(args)) => args.clone(),
    };

    let ports = raw
        .ports
        .iter()
        .map(|port| match port {
            RawPort::Number(n) => syntax::parse_port(&n.to_string()),
            RawPort::Text(text) => syntax::parse_port(text),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut mounts = raw
        .volumes
        .iter()
        .map(|m| syntax::parse_mount(m))
        .collect::<Result<Vec<_>>>()?;
    for mount in &mut mounts {
        if let MountSource::Bind(path) = &mut mount.source {
            *path = resolve_host_path(path, options);
        }
    }

    let depends_on: BTreeSet<String> = match &raw.depends_on {
        None => BTreeSet::new(),
        Some(RawDependsOn::List(names)) => names.iter().cloned().collect(),
        Some(RawDependsOn::Map(map)) => map.iter().map(|(k, _)| k.to_string()).collect(),
    };

    let networks = match &raw.networks {
        None => vec![DEFAULT_NETWORK.to_string()],
        Some(RawServiceNetworks::List(names)) => names.clone(),
        Some(RawServiceNetworks::Map(map)) => map.iter().map(|(k, _)| k.to_string()).collect(),
    };

    let restart = raw
        .restart
        .as_deref()
        .map(syntax::parse_restart)
        .transpose()?
        .unwrap_or(RestartPolicy::Never);

    let healthcheck = raw
        .healthcheck
        .as_ref()
        .map(|h| lower_healthcheck(name, h))
        .transpose()?;

    Ok(ServiceSpec {
        name: name.to_string(),
        source,
        command,
        ports,
        environment: lower_environment(name, raw.environment.as_ref(), &options.env)?,
        mounts,
        depends_on,
        restart,
        healthcheck,
        networks,
    })
}

fn lower_build(build: &RawBuild, base_dir: &Path) -> ImageSource {
    let (context, dockerfile) = match build {
        RawBuild::Context(context) => (Some(context.as_str()), None),
        RawBuild::Full {
            context,
            dockerfile,
        } => (context.as_deref(), dockerfile.clone()),
    };
    ImageSource::Build {
        context: base_dir.join(context.unwrap_or(".")),
        dockerfile,
    }
}

fn resolve_host_path(path: &Path, options: &ParseOptions) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = options.env.get("HOME") {
            return Path::new(home).join(rest);
        }
        return path.to_path_buf();
    }
    if path.is_relative() {
        options.base_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

fn lower_environment(
    service: &str,
    raw: Option<&RawEnvironment>,
    env: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    match raw {
        None => {}
        Some(RawEnvironment::List(entries)) => {
            for entry in entries {
                let (key, value) = match entry.split_once('=') {
                    Some((k, v)) => (k, v.to_string()),
                    None => (entry.as_str(), env.get(entry).cloned().unwrap_or_default()),
                };
                let _ = out.insert(key.to_string(), value);
            }
        }
        Some(RawEnvironment::Map(map)) => {
            for (key, value) in map.iter() {
                let value = match value {
                    None | Some(serde_yaml::Value::Null) => {
                        env.get(key).cloned().unwrap_or_default()
                    }
                    Some(serde_yaml::Value::String(s)) => s.clone(),
                    Some(serde_yaml::Value::Number(n)) => n.to_string(),
                    Some(serde_yaml::Value::Bool(b)) => b.to_string(),
                    Some(_) => {
                        return Err(syntax_error(format!(
                            "service \"{service}\": environment variable \"{key}\" must be a scalar"
                        )));
                    }
                };
                let _ = out.insert(key.to_string(), value);
            }
        }
    }
    Ok(out)
}

fn lower_healthcheck(service: &str, raw: &RawHealthcheck) -> Result<HealthProbe> {
    let check = match (raw.tcp, &raw.log) {
        (Some(0), None) => {
            return Err(syntax_error(format!(
                "service \"{service}\": tcp probe port must be non-zero"
            )));
        }
        (Some(port), None) => ProbeCheck::Tcp { port },
        (None, Some(pattern)) => {
            let _ = regex::Regex::new(pattern).map_err(|e| {
                syntax_error(format!("service \"{service}\": invalid log probe pattern: {e}"))
            })?;
            ProbeCheck::Log {
                pattern: pattern.clone(),
            }
        }
        _ => {
            return Err(syntax_error(format!(
                "service \"{service}\": healthcheck needs exactly one of tcp or log"
            )));
        }
    };
    Ok(HealthProbe {
        check,
        interval: raw.interval.as_deref().map(syntax::parse_duration).transpose()?,
        timeout: raw.timeout.as_deref().map(syntax::parse_duration).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const SHOP: &str = r#"
services:
  frontend:
    image: shop/frontend:1.4
    ports: ["8080:80"]
    depends_on: [backend]
  backend:
    build:
      context: ./backend
      dockerfile: Dockerfile.prod
    environment:
      DATABASE_URL: postgres://db:5432/shop
      WORKERS: 4
    depends_on:
      db:
        condition: service_healthy
    restart: on-failure
  db:
    image: postgres:16
    ports: ["15432:5432"]
    volumes:
      - data:/var/lib/postgresql/data
      - /tmp/scratch
    healthcheck:
      tcp: 5432
      interval: 1s
      timeout: 20s
volumes:
  data:
"#;

    fn kind(err: &BerthError) -> Option<ParseErrorKind> {
        err.parse_kind()
    }

    #[test]
    fn parses_full_document() {
        let d = parse(SHOP, "shop").expect("parse");
        assert_eq!(d.name, "shop");
        let names: Vec<&str> = d.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["frontend", "backend", "db"]);

        let backend = d.service("backend").expect("backend");
        assert!(matches!(backend.source, ImageSource::Build { .. }));
        assert_eq!(backend.environment["WORKERS"], "4");
        assert!(backend.depends_on.contains("db"));
        assert_eq!(backend.restart, RestartPolicy::OnFailure { max_attempts: None });

        let db = d.service("db").expect("db");
        assert_eq!(db.mounts.len(), 2);
        assert_eq!(db.mounts[1].source, MountSource::Anonymous);
        let probe = db.healthcheck.as_ref().expect("probe");
        assert_eq!(probe.check, ProbeCheck::Tcp { port: 5432 });
        assert_eq!(probe.interval, Some(Duration::from_secs(1)));
        assert_eq!(probe.timeout, Some(Duration::from_secs(20)));

        assert_eq!(d.networks.len(), 1);
        assert_eq!(d.networks[0].name, DEFAULT_NETWORK);
        assert_eq!(d.volumes, vec![VolumeSpec::named("data")]);
    }

    #[test]
    fn document_name_and_override() {
        let doc = "name: Web Store\nservices:\n  api:\n    image: api\n";
        assert_eq!(parse(doc, "dir").expect("parse").name, "webstore");

        let options = ParseOptions {
            project_name: Some("forced".into()),
            default_name: "dir".into(),
            ..ParseOptions::default()
        };
        assert_eq!(parse_with(doc, &options).expect("parse").name, "forced");
    }

    #[test]
    fn shell_command_and_env_list() {
        let doc = r"
services:
  worker:
    image: busybox
    command: echo hello && sleep 5
    environment:
      - MODE=batch
      - FROM_HOST
";
        let options = ParseOptions {
            default_name: "jobs".into(),
            env: BTreeMap::from([("FROM_HOST".to_string(), "yes".to_string())]),
            ..ParseOptions::default()
        };
        let d = parse_with(doc, &options).expect("parse");
        let worker = d.service("worker").expect("worker");
        assert_eq!(worker.command, vec!["/bin/sh", "-c", "echo hello && sleep 5"]);
        assert_eq!(worker.environment["MODE"], "batch");
        assert_eq!(worker.environment["FROM_HOST"], "yes");
    }

    #[test]
    fn interpolates_before_parsing() {
        let doc = "services:\n  db:\n    image: postgres:${PG_TAG:-15}\n";
        let d = parse(doc, "x").expect("parse");
        assert_eq!(d.services[0].source, ImageSource::Image("postgres:15".into()));
    }

    #[test]
    fn missing_image_and_build_is_syntax_error() {
        let err = parse("services:\n  api:\n    ports: [80]\n", "x").expect_err("no image");
        assert_eq!(kind(&err), Some(ParseErrorKind::Syntax));
    }

    #[test]
    fn bad_port_is_syntax_error() {
        let doc = "services:\n  api:\n    image: api\n    ports: ['eighty']\n";
        let err = parse(doc, "x").expect_err("bad port");
        assert_eq!(kind(&err), Some(ParseErrorKind::Syntax));
    }

    #[test]
    fn duplicate_service_key_is_duplicate_name() {
        let doc = "services:\n  api:\n    image: a\n  api:\n    image: b\n";
        let err = parse(doc, "x").expect_err("duplicate");
        assert_eq!(kind(&err), Some(ParseErrorKind::DuplicateName));
    }

    #[test]
    fn unknown_volume_reference() {
        let doc = "services:\n  db:\n    image: pg\n    volumes: ['data:/data']\n";
        let err = parse(doc, "x").expect_err("unknown");
        assert_eq!(kind(&err), Some(ParseErrorKind::UnknownReference));
    }

    #[test]
    fn cycle_reports_path() {
        let doc = r"
services:
  a:
    image: a
    depends_on: [b]
  b:
    image: b
    depends_on: [a]
";
        let err = parse(doc, "x").expect_err("cycle");
        assert_eq!(kind(&err), Some(ParseErrorKind::CyclicDependency));
        assert!(err.to_string().contains("a -> b -> a"), "got: {err}");
    }

    #[test]
    fn healthcheck_needs_exactly_one_check() {
        let both = "services:\n  a:\n    image: a\n    ports: ['1:1']\n    healthcheck:\n      tcp: 1\n      log: ready\n";
        assert!(parse(both, "x").is_err());
        let bad_regex = "services:\n  a:\n    image: a\n    healthcheck:\n      log: '('\n";
        assert_eq!(
            kind(&parse(bad_regex, "x").expect_err("regex")),
            Some(ParseErrorKind::Syntax)
        );
    }

    #[test]
    fn external_and_custom_networks() {
        let doc = r"
services:
  proxy:
    image: traefik
    networks: [edge]
networks:
  edge:
    external: true
";
        let d = parse(doc, "x").expect("parse");
        assert_eq!(d.networks.len(), 1);
        assert!(d.networks[0].external);
        assert_eq!(d.network_runtime_name(&d.networks[0]), "edge");
    }

    #[test]
    fn unsupported_driver_is_rejected() {
        let doc = "services:\n  a:\n    image: a\nnetworks:\n  default:\n    driver: overlay\n";
        assert!(parse(doc, "x").is_err());
    }

    #[test]
    fn load_names_deployment_after_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("My_Shop");
        std::fs::create_dir(&project).expect("mkdir");
        let file = project.join("compose.yaml");
        std::fs::write(&file, "services:\n  web:\n    image: nginx\n").expect("write");

        assert_eq!(find_document(&project).expect("find"), file);
        let d = load(&file, None).expect("load");
        assert_eq!(d.name, "my_shop");
        let d = load(&file, Some("other")).expect("load");
        assert_eq!(d.name, "other");
    }

    #[test]
    fn find_document_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = find_document(dir.path()).expect_err("missing");
        assert!(matches!(err, BerthError::NotFound { .. }));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = load(Path::new("/definitely/not/here.yaml"), None).expect_err("io");
        assert!(matches!(err, BerthError::Io { .. }));
    }

    #[test]
    fn plan_serializes_to_json() {
        let d = parse(SHOP, "shop").expect("parse");
        let json = serde_json::to_value(&d).expect("json");
        assert_eq!(json["name"], "shop");
        assert_eq!(json["services"][2]["healthcheck"]["check"]["tcp"]["port"], 5432);
    }
}
