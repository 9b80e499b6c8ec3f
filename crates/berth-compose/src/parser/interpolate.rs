//! Variable interpolation applied to the raw document text.
//!
//! Supports `$NAME`, `${NAME}`, `${NAME:-default}` (default when unset or
//! empty), `${NAME-default}` (default when unset), and `$$` for a literal
//! dollar sign.

use std::collections::BTreeMap;

use berth_common::error::{BerthError, ParseErrorKind, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::{map, opt, recognize, value},
    sequence::{delimited, pair, preceded},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fragment<'a> {
    Literal(&'a str),
    Variable {
        name: &'a str,
        default: Option<(DefaultMode, &'a str)>,
    },
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefaultMode {
    UnsetOrEmpty,
    Unset,
}

fn var_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn default_clause(input: &str) -> IResult<&str, (DefaultMode, &str)> {
    (
        alt((
            value(DefaultMode::UnsetOrEmpty, tag(":-")),
            value(DefaultMode::Unset, tag("-")),
        )),
        take_while(|c: char| c != '}'),
    )
        .parse(input)
}

fn fragment(input: &str) -> IResult<&str, Fragment<'_>> {
    alt((
        map(take_while1(|c: char| c != '$'), Fragment::Literal),
        value(Fragment::Literal("$"), tag("$$")),
        map(
            delimited(tag("${"), (var_name, opt(default_clause)), char('}')),
            |(name, default)| Fragment::Variable { name, default },
        ),
        value(Fragment::Unterminated, tag("${")),
        map(preceded(char('$'), var_name), |name| Fragment::Variable {
            name,
            default: None,
        }),
        value(Fragment::Literal("$"), char('$')),
    ))
    .parse(input)
}

/// Substitutes variables from `env` into `input`.
///
/// Unset variables without a default expand to an empty string and are
/// logged at `warn`.
///
/// # Errors
///
/// Returns a syntax error for an unterminated or empty `${...}` expression.
pub fn interpolate(input: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while !rest.is_empty() {
        let (next, frag) = fragment(rest).map_err(|_| unterminated(rest))?;
        match frag {
            Fragment::Literal(text) => output.push_str(text),
            Fragment::Variable { name, default } => {
                output.push_str(&resolve(name, default, env));
            }
            Fragment::Unterminated => return Err(unterminated(rest)),
        }
        rest = next;
    }

    Ok(output)
}

fn resolve(name: &str, default: Option<(DefaultMode, &str)>, env: &BTreeMap<String, String>) -> String {
    match (env.get(name), default) {
        (Some(v), Some((DefaultMode::UnsetOrEmpty, fallback))) if v.is_empty() => fallback.to_string(),
        (Some(v), _) => v.clone(),
        (None, Some((_, fallback))) => fallback.to_string(),
        (None, None) => {
            tracing::warn!(variable = name, "variable is not set, substituting an empty string");
            String::new()
        }
    }
}

fn unterminated(at: &str) -> BerthError {
    let excerpt: String = at.chars().take(24).collect();
    BerthError::parse(
        ParseErrorKind::Syntax,
        format!("invalid interpolation near \"{excerpt}\""),
    )
}
