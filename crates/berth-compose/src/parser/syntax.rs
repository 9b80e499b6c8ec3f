//! `nom` grammars for the short-form strings embedded in a document:
//! port mappings, volume mounts, restart policies, and durations.

use std::path::PathBuf;
use std::time::Duration;

use berth_common::error::{BerthError, ParseErrorKind, Result};
use berth_common::types::RestartPolicy;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize, value},
    multi::{many1, separated_list1},
    sequence::{preceded, terminated},
};

use crate::model::{Mount, MountSource, PortMapping, Protocol};

fn syntax_err(what: &str, input: &str) -> BerthError {
    BerthError::parse(ParseErrorKind::Syntax, format!("invalid {what} \"{input}\""))
}

fn number<T: std::str::FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, str::parse::<T>).parse(input)
}

fn ipv4(input: &str) -> IResult<&str, &str> {
    recognize((
        digit1,
        char('.'),
        digit1,
        char('.'),
        digit1,
        char('.'),
        digit1,
    ))
    .parse(input)
}

fn protocol(input: &str) -> IResult<&str, Protocol> {
    alt((
        value(Protocol::Tcp, tag("tcp")),
        value(Protocol::Udp, tag("udp")),
    ))
    .parse(input)
}

fn port_mapping(input: &str) -> IResult<&str, (Option<&str>, u16, Option<u16>, Option<Protocol>)> {
    (
        opt(terminated(ipv4, char(':'))),
        number::<u16>,
        opt(preceded(char(':'), number::<u16>)),
        opt(preceded(char('/'), protocol)),
    )
        .parse(input)
}

/// Parses `[ip:][host:]container[/tcp|udp]`.
///
/// # Errors
///
/// Returns a syntax error for malformed mappings, port `0`, or an
/// interface address without a host port.
pub fn parse_port(input: &str) -> Result<PortMapping> {
    let trimmed = input.trim();
    let (_, (ip, first, second, proto)) = all_consuming(port_mapping)
        .parse(trimmed)
        .map_err(|_| syntax_err("port mapping", input))?;

    let (host, container) = match second {
        Some(container) => (Some(first), container),
        None if ip.is_some() => return Err(syntax_err("port mapping", input)),
        None => (None, first),
    };
    if container == 0 || host == Some(0) {
        return Err(syntax_err("port mapping", input));
    }

    Ok(PortMapping {
        host_ip: ip.map(str::to_string),
        host,
        container,
        protocol: proto.unwrap_or_default(),
    })
}

fn mount_segments(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list1(char(':'), take_while1(|c: char| c != ':')).parse(input)
}

fn is_mode(segment: &str) -> bool {
    matches!(segment, "ro" | "rw")
}

fn is_volume_name(segment: &str) -> bool {
    let mut chars = segment.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn classify_source(source: &str, input: &str) -> Result<MountSource> {
    if source.starts_with('/') || source.starts_with('.') || source.starts_with('~') {
        Ok(MountSource::Bind(PathBuf::from(source)))
    } else if is_volume_name(source) {
        Ok(MountSource::Named(source.to_string()))
    } else {
        Err(syntax_err("volume mount", input))
    }
}

/// Parses `[source:]target[:ro|rw]`.
///
/// A source starting with `/`, `.` or `~` is a bind mount, any other
/// source names a volume, and a missing source declares an anonymous volume.
///
/// # Errors
///
/// Returns a syntax error for malformed mounts or a relative target.
pub fn parse_mount(input: &str) -> Result<Mount> {
    let trimmed = input.trim();
    let (_, segments) = all_consuming(mount_segments)
        .parse(trimmed)
        .map_err(|_| syntax_err("volume mount", input))?;

    let (source, target, mode) = match segments.as_slice() {
        [target] => (None, *target, None),
        [target, mode] if is_mode(mode) && target.starts_with('/') => (None, *target, Some(*mode)),
        [source, target] => (Some(*source), *target, None),
        [source, target, mode] if is_mode(mode) => (Some(*source), *target, Some(*mode)),
        _ => return Err(syntax_err("volume mount", input)),
    };
    if !target.starts_with('/') {
        return Err(syntax_err("volume mount", input));
    }

    let source = match source {
        Some(s) => classify_source(s, input)?,
        None => MountSource::Anonymous,
    };

    Ok(Mount {
        source,
        target: target.to_string(),
        read_only: mode == Some("ro"),
    })
}

fn restart_policy(input: &str) -> IResult<&str, RestartPolicy> {
    alt((
        map_res(
            preceded(tag("on-failure"), opt(preceded(char(':'), number::<u32>))),
            |max_attempts| match max_attempts {
                Some(0) => Err("zero attempts"),
                _ => Ok(RestartPolicy::OnFailure { max_attempts }),
            },
        ),
        value(RestartPolicy::Always, alt((tag("always"), tag("unless-stopped")))),
        value(RestartPolicy::Never, alt((tag("none"), tag("no")))),
    ))
    .parse(input)
}

/// Parses `none`, `no`, `always`, `unless-stopped`, or `on-failure[:N]`.
///
/// # Errors
///
/// Returns a syntax error for unknown policies or `on-failure:0`.
pub fn parse_restart(input: &str) -> Result<RestartPolicy> {
    all_consuming(restart_policy)
        .parse(input.trim())
        .map(|(_, policy)| policy)
        .map_err(|_| syntax_err("restart policy", input))
}

fn duration_unit(input: &str) -> IResult<&str, u64> {
    alt((
        value(1, tag("ms")),
        value(1_000, tag("s")),
        value(60_000, tag("m")),
        value(3_600_000, tag("h")),
    ))
    .parse(input)
}

fn duration_parts(input: &str) -> IResult<&str, Vec<(u64, u64)>> {
    many1((number::<u64>, duration_unit)).parse(input)
}

/// Parses durations such as `500ms`, `2s`, `1m30s`, or a bare number of seconds.
///
/// # Errors
///
/// Returns a syntax error if the input is not a duration.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (_, parts) = all_consuming(duration_parts)
        .parse(trimmed)
        .map_err(|_| syntax_err("duration", input))?;
    let millis = parts
        .iter()
        .try_fold(0_u64, |acc, (n, unit)| acc.checked_add(n.checked_mul(*unit)?))
        .ok_or_else(|| syntax_err("duration", input))?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_host_and_container() {
        let p = parse_port("8080:80").expect("parse");
        assert_eq!(p.host, Some(8080));
        assert_eq!(p.container, 80);
        assert_eq!(p.protocol, Protocol::Tcp);
        assert!(p.host_ip.is_none());
    }

    #[test]
    fn port_container_only_with_protocol() {
        let p = parse_port("53/udp").expect("parse");
        assert_eq!(p.host, None);
        assert_eq!(p.container, 53);
        assert_eq!(p.protocol, Protocol::Udp);
    }

    #[test]
    fn port_with_interface() {
        let p = parse_port("127.0.0.1:5432:5432").expect("parse");
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.host, Some(5432));
    }

    #[test]
    fn port_rejects_garbage() {
        for bad in ["", "http", "80:", ":80", "8080:80:90", "70000:80", "0:80", "127.0.0.1:80", "80/sctp"] {
            let err = parse_port(bad).expect_err(bad);
            assert_eq!(err.parse_kind(), Some(ParseErrorKind::Syntax), "{bad}");
        }
    }

    #[test]
    fn mount_named_volume() {
        let m = parse_mount("data:/var/lib/postgresql/data").expect("parse");
        assert_eq!(m.source, MountSource::Named("data".into()));
        assert_eq!(m.target, "/var/lib/postgresql/data");
        assert!(!m.read_only);
    }

    #[test]
    fn mount_bind_read_only() {
        let m = parse_mount("./config:/etc/app:ro").expect("parse");
        assert_eq!(m.source, MountSource::Bind(PathBuf::from("./config")));
        assert!(m.read_only);
    }

    #[test]
    fn mount_anonymous_forms() {
        assert_eq!(
            parse_mount("/cache").expect("parse").source,
            MountSource::Anonymous
        );
        let m = parse_mount("/cache:ro").expect("parse");
        assert_eq!(m.source, MountSource::Anonymous);
        assert!(m.read_only);
    }

    #[test]
    fn mount_rejects_relative_target_and_bad_mode() {
        assert!(parse_mount("data:relative").is_err());
        assert!(parse_mount("data:/x:rx").is_err());
        assert!(parse_mount("").is_err());
        assert!(parse_mount("$bad:/x").is_err());
    }

    #[test]
    fn restart_policies() {
        assert_eq!(parse_restart("no").expect("no"), RestartPolicy::Never);
        assert_eq!(parse_restart("none").expect("none"), RestartPolicy::Never);
        assert_eq!(parse_restart("always").expect("always"), RestartPolicy::Always);
        assert_eq!(
            parse_restart("on-failure").expect("on-failure"),
            RestartPolicy::OnFailure { max_attempts: None }
        );
        assert_eq!(
            parse_restart("on-failure:3").expect("on-failure:3"),
            RestartPolicy::OnFailure {
                max_attempts: Some(3)
            }
        );
        assert!(parse_restart("on-failure:0").is_err());
        assert!(parse_restart("sometimes").is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("2s").expect("2s"), Duration::from_secs(2));
        assert_eq!(parse_duration("500ms").expect("ms"), Duration::from_millis(500));
        assert_eq!(parse_duration("1m30s").expect("1m30s"), Duration::from_secs(90));
        assert_eq!(parse_duration("15").expect("bare"), Duration::from_secs(15));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
