//! Strongly typed deployment model.
//!
//! Produced once by [`crate::parser::parse`] and immutable afterwards.
//! Every cross reference in a [`Deployment`] has already been checked.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use berth_common::types::RestartPolicy;
use serde::Serialize;

/// One complete set of services, networks, and volumes managed as a unit.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    /// Deployment name, used to namespace runtime resources.
    pub name: String,
    /// Services in document order.
    pub services: Vec<ServiceSpec>,
    /// Networks in document order.
    pub networks: Vec<NetworkSpec>,
    /// Deployment-scoped named volumes in document order.
    pub volumes: Vec<VolumeSpec>,
}

impl Deployment {
    /// Looks up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Looks up a network by name.
    #[must_use]
    pub fn network(&self, name: &str) -> Option<&NetworkSpec> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// Looks up a named volume by name.
    #[must_use]
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// Runtime name of a deployment-scoped network or volume.
    ///
    /// External resources keep their declared name.
    #[must_use]
    pub fn scoped_name(&self, resource: &str) -> String {
        format!("{}_{resource}", self.name)
    }

    /// Runtime name of a network, honoring `external`.
    #[must_use]
    pub fn network_runtime_name(&self, network: &NetworkSpec) -> String {
        if network.external {
            network.name.clone()
        } else {
            self.scoped_name(&network.name)
        }
    }

    /// Runtime name of a volume, honoring `external` and scope.
    #[must_use]
    pub fn volume_runtime_name(&self, volume: &VolumeSpec) -> String {
        match volume.scope {
            _ if volume.external => volume.name.clone(),
            VolumeScope::Deployment => self.scoped_name(&volume.name),
            VolumeScope::Container { .. } => volume.name.clone(),
        }
    }

    /// Runtime name of the single container backing a service.
    #[must_use]
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{service}-1", self.name)
    }

    /// Anonymous volumes owned by a service's container, one per anonymous mount.
    #[must_use]
    pub fn anonymous_volumes(&self, service: &ServiceSpec) -> Vec<VolumeSpec> {
        let container = self.container_name(&service.name);
        service
            .mounts
            .iter()
            .filter(|m| matches!(m.source, MountSource::Anonymous))
            .enumerate()
            .map(|(index, _)| {
                VolumeSpec::anonymous(format!("{container}-anon-{index}"), &service.name)
            })
            .collect()
    }
}

/// A declared service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Where the image comes from.
    pub source: ImageSource,
    /// Command override; empty keeps the image default.
    pub command: Vec<String>,
    /// Published ports in document order.
    pub ports: Vec<PortMapping>,
    /// Environment variables.
    pub environment: BTreeMap<String, String>,
    /// Volume mounts in document order.
    pub mounts: Vec<Mount>,
    /// Services that must be healthy before this one starts.
    pub depends_on: BTreeSet<String>,
    /// Restart policy applied to failed bring-up attempts.
    pub restart: RestartPolicy,
    /// Readiness probe, if declared.
    pub healthcheck: Option<HealthProbe>,
    /// Networks the container is attached to.
    pub networks: Vec<String>,
}

impl ServiceSpec {
    /// Image reference used to create the container.
    ///
    /// Build-only services use the tag the external build step produces,
    /// `<deployment>-<service>:latest`.
    #[must_use]
    pub fn image_ref(&self, deployment: &str) -> String {
        match &self.source {
            ImageSource::Image(image) => image.clone(),
            ImageSource::Build { .. } => format!("{deployment}-{}:latest", self.name),
        }
    }

    /// Host port bound for a container port, if published.
    #[must_use]
    pub fn published_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container == container_port)
            .and_then(|p| p.host)
    }
}

/// Image reference or build context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// A named, tagged image.
    Image(String),
    /// A build context handed to the external build step.
    Build {
        /// Context directory.
        context: PathBuf,
        /// Alternate build file inside the context.
        dockerfile: Option<String>,
    },
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A `[ip:][host:]container[/protocol]` port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PortMapping {
    /// Host interface to bind, all interfaces when absent.
    pub host_ip: Option<String>,
    /// Host port; absent means the container port is only exposed.
    pub host: Option<u16>,
    /// Port inside the container.
    pub container: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{ip}:")?;
        }
        if let Some(host) = self.host {
            write!(f, "{host}:")?;
        }
        write!(f, "{}/{}", self.container, self.protocol)
    }
}

/// Where a mount's data lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum MountSource {
    /// A deployment-scoped named volume.
    Named(String),
    /// A volume owned by the container that mounts it.
    Anonymous,
    /// A host path.
    Bind(PathBuf),
}

/// A `[source:]target[:ro|rw]` volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Mount {
    /// Data source.
    pub source: MountSource,
    /// Absolute path inside the container.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Network driver. Only isolated bridge networks are supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Isolated bridge network.
    #[default]
    Bridge,
}

impl fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("bridge")
    }
}

/// A declared network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSpec {
    /// Network name as written in the document.
    pub name: String,
    /// Driver mode.
    pub driver: NetworkDriver,
    /// Managed outside this deployment: looked up, never created or removed.
    pub external: bool,
}

/// Ownership scope of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeScope {
    /// Outlives containers; keyed by name.
    Deployment,
    /// Owned by one service's container and removed with it.
    Container {
        /// Owning service.
        owner: String,
    },
}

/// A volume, either declared (named) or derived from an anonymous mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSpec {
    /// Volume name.
    pub name: String,
    /// Ownership scope.
    pub scope: VolumeScope,
    /// Managed outside this deployment: looked up, never created or removed.
    pub external: bool,
}

impl VolumeSpec {
    /// A deployment-scoped named volume.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: VolumeScope::Deployment,
            external: false,
        }
    }

    /// A container-scoped anonymous volume.
    #[must_use]
    pub fn anonymous(name: impl Into<String>, owner: &str) -> Self {
        Self {
            name: name.into(),
            scope: VolumeScope::Container {
                owner: owner.to_string(),
            },
            external: false,
        }
    }

    /// Whether this volume is anonymous.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self.scope, VolumeScope::Container { .. })
    }
}

/// What a health probe checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeCheck {
    /// A TCP connect to the host port publishing this container port succeeds.
    Tcp {
        /// Container port; must be published.
        port: u16,
    },
    /// The container log contains a line matching this regular expression.
    Log {
        /// Regular expression.
        pattern: String,
    },
}

/// A readiness probe gating dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthProbe {
    /// The check to run.
    pub check: ProbeCheck,
    /// Poll interval override.
    pub interval: Option<Duration>,
    /// Deadline override.
    pub timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Deployment {
        Deployment {
            name: "shop".into(),
            services: vec![ServiceSpec {
                name: "db".into(),
                source: ImageSource::Image("postgres:16".into()),
                command: Vec::new(),
                ports: vec![PortMapping {
                    host_ip: None,
                    host: Some(15432),
                    container: 5432,
                    protocol: Protocol::Tcp,
                }],
                environment: BTreeMap::new(),
                mounts: vec![
                    Mount {
                        source: MountSource::Named("data".into()),
                        target: "/var/lib/postgresql/data".into(),
                        read_only: false,
                    },
                    Mount {
                        source: MountSource::Anonymous,
                        target: "/tmp/scratch".into(),
                        read_only: false,
                    },
                ],
                depends_on: BTreeSet::new(),
                restart: RestartPolicy::Never,
                healthcheck: None,
                networks: vec!["default".into()],
            }],
            networks: Vec::new(),
            volumes: vec![VolumeSpec::named("data")],
        }
    }

    #[test]
    fn resource_names_are_namespaced() {
        let d = deployment();
        assert_eq!(d.scoped_name("data"), "shop_data");
        assert_eq!(d.container_name("db"), "shop-db-1");
        let data = d.volume("data").expect("data");
        assert_eq!(d.volume_runtime_name(data), "shop_data");
    }

    #[test]
    fn external_resources_keep_their_name() {
        let d = deployment();
        let mut volume = VolumeSpec::named("shared");
        volume.external = true;
        assert_eq!(d.volume_runtime_name(&volume), "shared");
        let network = NetworkSpec {
            name: "proxy".into(),
            driver: NetworkDriver::Bridge,
            external: true,
        };
        assert_eq!(d.network_runtime_name(&network), "proxy");
    }

    #[test]
    fn anonymous_volumes_are_owned_by_the_container() {
        let d = deployment();
        let db = d.service("db").expect("db");
        let anon = d.anonymous_volumes(db);
        assert_eq!(anon.len(), 1);
        assert_eq!(anon[0].name, "shop-db-1-anon-0");
        assert!(anon[0].is_anonymous());
    }

    #[test]
    fn build_services_use_derived_tag() {
        let mut d = deployment();
        d.services[0].source = ImageSource::Build {
            context: PathBuf::from("./db"),
            dockerfile: None,
        };
        assert_eq!(d.services[0].image_ref("shop"), "shop-db:latest");
    }

    #[test]
    fn port_mapping_display() {
        let d = deployment();
        assert_eq!(d.services[0].ports[0].to_string(), "15432:5432/tcp");
        assert_eq!(d.services[0].published_port(5432), Some(15432));
        assert_eq!(d.services[0].published_port(80), None);
    }
}
