//! Raw, loosely typed view of a deployment document.
//!
//! Mirrors the YAML as written. Flexible forms (lists or maps, strings or
//! integers) are captured with untagged enums and normalised when the
//! document is lowered into the typed model.

use std::fmt;
use std::marker::PhantomData;

use serde::Deserialize;
use serde::de::{IgnoredAny, MapAccess, Visitor};

/// A map that keeps document order and every entry, duplicates included.
///
/// Duplicate detection is left to the validator so it can be reported as
/// a duplicate name rather than a YAML error.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct OrderedMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}

/// Root of a deployment document.
#[derive(Debug, Default, Deserialize)]
pub struct RawDocument {
    /// Explicit deployment name.
    #[serde(default)]
    pub name: Option<String>,
    /// Service definitions.
    #[serde(default)]
    pub services: OrderedMap<RawService>,
    /// Network definitions; a bare key declares a default bridge network.
    #[serde(default)]
    pub networks: OrderedMap<Option<RawNetwork>>,
    /// Named volume definitions; a bare key declares a local volume.
    #[serde(default)]
    pub volumes: OrderedMap<Option<RawVolume>>,
}

/// One service as written.
#[derive(Debug, Default, Deserialize)]
pub struct RawService {
    /// Image reference.
    #[serde(default)]
    pub image: Option<String>,
    /// Build context.
    #[serde(default)]
    pub build: Option<RawBuild>,
    /// Command override.
    #[serde(default)]
    pub command: Option<RawCommand>,
    /// Port mappings.
    #[serde(default)]
    pub ports: Vec<RawPort>,
    /// Environment variables.
    #[serde(default)]
    pub environment: Option<RawEnvironment>,
    /// Volume mount strings.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Dependencies.
    #[serde(default)]
    pub depends_on: Option<RawDependsOn>,
    /// Restart policy string.
    #[serde(default)]
    pub restart: Option<String>,
    /// Health probe.
    #[serde(default)]
    pub healthcheck: Option<RawHealthcheck>,
    /// Attached networks.
    #[serde(default)]
    pub networks: Option<RawServiceNetworks>,
}

/// `build:` as a context path or a mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawBuild {
    /// `build: ./dir`
    Context(String),
    /// `build: { context: ./dir, dockerfile: Alt.Dockerfile }`
    Full {
        /// Context directory.
        #[serde(default)]
        context: Option<String>,
        /// Alternate build file.
        #[serde(default)]
        dockerfile: Option<String>,
    },
}

/// `command:` as a shell string or an argument list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawCommand {
    /// Run through `/bin/sh -c`.
    Shell(String),
    /// Exec form.
    Exec(Vec<String>),
}

/// A port written as an integer or a mapping string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawPort {
    /// `- 80`
    Number(u16),
    /// `- "8080:80/tcp"`
    Text(String),
}

/// `environment:` as a mapping or a `KEY=value` list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawEnvironment {
    /// `KEY: value`
    Map(OrderedMap<Option<serde_yaml::Value>>),
    /// `- KEY=value`
    List(Vec<String>),
}

/// `depends_on:` as a list or a mapping of conditions.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawDependsOn {
    /// `- db`
    List(Vec<String>),
    /// `db: { condition: service_healthy }`; conditions are not interpreted,
    /// every dependency must be healthy.
    Map(OrderedMap<IgnoredAny>),
}

/// A service's `networks:` as a list or a mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawServiceNetworks {
    /// `- backend`
    List(Vec<String>),
    /// `backend: {}`
    Map(OrderedMap<IgnoredAny>),
}

/// `healthcheck:`.
#[derive(Debug, Default, Deserialize)]
pub struct RawHealthcheck {
    /// Container port that must accept TCP connections.
    #[serde(default)]
    pub tcp: Option<u16>,
    /// Regular expression a log line must match.
    #[serde(default)]
    pub log: Option<String>,
    /// Poll interval, e.g. `2s`.
    #[serde(default)]
    pub interval: Option<String>,
    /// Deadline, e.g. `30s`.
    #[serde(default)]
    pub timeout: Option<String>,
}

/// A top-level network definition.
#[derive(Debug, Default, Deserialize)]
pub struct RawNetwork {
    /// Driver name; only `bridge` is accepted.
    #[serde(default)]
    pub driver: Option<String>,
    /// Whether the network is managed outside the deployment.
    #[serde(default)]
    pub external: bool,
}

/// A top-level volume definition.
#[derive(Debug, Default, Deserialize)]
pub struct RawVolume {
    /// Whether the volume is managed outside the deployment.
    #[serde(default)]
    pub external: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_map_keeps_order_and_duplicates() {
        let yaml = "b: 1\na: 2\nb: 3\n";
        let map: OrderedMap<u32> = serde_yaml::from_str(yaml).expect("parse");
        let keys: Vec<&str> = map.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "b"]);
    }

    #[test]
    fn flexible_service_forms() {
        let yaml = r"
services:
  api:
    build: ./api
    command: npm start
    ports: [3000, '8080:80']
    environment:
      - NODE_ENV=production
    depends_on:
      db:
        condition: service_healthy
  db:
    image: postgres
    environment:
      POSTGRES_PORT: 5432
networks:
  backend:
volumes:
  data:
";
        let doc: RawDocument = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(doc.services.0.len(), 2);
        let api = &doc.services.0[0].1;
        assert!(matches!(api.build, Some(RawBuild::Context(_))));
        assert!(matches!(api.command, Some(RawCommand::Shell(_))));
        assert!(matches!(api.ports[0], RawPort::Number(3000)));
        assert!(matches!(api.environment, Some(RawEnvironment::List(_))));
        assert!(matches!(api.depends_on, Some(RawDependsOn::Map(_))));
        let (name, net) = &doc.networks.0[0];
        assert_eq!(name, "backend");
        assert!(net.is_none());
    }
}
