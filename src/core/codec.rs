//! Parsing of save-style rule lines
//!
//! Dump lines look like:
//!
//! ```text
//! -A NODEWALL_EXT_PREROUTING -s 10.244.1.0/24 -d 10.0.0.5/32 -m comment --comment "default/svc-a" -j DNAT --to-destination 10.96.0.10
//! ```
//!
//! [`parse_fields`] is lenient and never fails. [`parse_line`] additionally
//! parses the address fields and reports a [`Error::ParseSkew`] when the line
//! does not fit the grammar, so the drift pass can skip it.

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};

/// Raw string fields of a dumped rule. Missing flags leave a field empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleFields {
    pub owner: String,
    pub source: String,
    pub destination: String,
    pub target: String,
    pub nat_destination: String,
}

/// A dumped rule with its address fields parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpedRule {
    /// The line as dumped
    pub line: String,
    pub chain: String,
    pub owner: Option<String>,
    pub source: Option<IpNetwork>,
    pub destination: Option<IpNetwork>,
    pub target: String,
    pub nat_destination: Option<IpAddr>,
}

/// Splits on whitespace, keeping double-quoted runs together and dropping
/// the quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Value following the first occurrence of `flag`, or `""`.
fn value_of<'a>(tokens: &'a [String], flag: &str) -> &'a str {
    tokens
        .iter()
        .position(|t| t == flag)
        .and_then(|i| tokens.get(i + 1))
        .map_or("", String::as_str)
}

/// Extracts owner tag, source, destination, target and NAT destination.
pub fn parse_fields(line: &str) -> RuleFields {
    let tokens = tokenize(line);
    RuleFields {
        owner: value_of(&tokens, "--comment").to_string(),
        source: value_of(&tokens, "-s").to_string(),
        destination: value_of(&tokens, "-d").to_string(),
        target: value_of(&tokens, "-j").to_string(),
        nat_destination: value_of(&tokens, "--to-destination").to_string(),
    }
}

/// Parses a dumped line, validating its chain marker, target and addresses.
///
/// # Errors
///
/// Returns [`Error::ParseSkew`] when the line has no `-A <chain>` marker,
/// no target, or an address field that does not parse.
pub fn parse_line(line: &str) -> Result<DumpedRule> {
    let skew = |reason: &str| Error::ParseSkew {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let tokens = tokenize(line);
    let chain = match tokens.as_slice() {
        [marker, chain, ..] if marker == "-A" => chain.clone(),
        _ => return Err(skew("missing -A <chain> marker")),
    };

    let fields = parse_fields(line);
    if fields.target.is_empty() {
        return Err(skew("missing -j target"));
    }

    let network = |value: &str, what: &str| -> Result<Option<IpNetwork>> {
        if value.is_empty() {
            return Ok(None);
        }
        value
            .parse::<IpNetwork>()
            .map(Some)
            .map_err(|_| skew(&format!("bad {what} {value:?}")))
    };

    let source = network(&fields.source, "source")?;
    let destination = network(&fields.destination, "destination")?;
    let nat_destination = if fields.nat_destination.is_empty() {
        None
    } else {
        Some(parse_nat_destination(&fields.nat_destination).ok_or_else(|| {
            skew(&format!("bad --to-destination {:?}", fields.nat_destination))
        })?)
    };

    Ok(DumpedRule {
        line: line.to_string(),
        chain,
        owner: (!fields.owner.is_empty()).then_some(fields.owner),
        source,
        destination,
        target: fields.target,
        nat_destination,
    })
}

/// `addr`, `v4:port` or `[v6]:port`.
fn parse_nat_destination(value: &str) -> Option<IpAddr> {
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

/// Converts a dumped line into `<chain> <spec...>` for a `-D` invocation.
pub fn to_delete_args(line: &str) -> Vec<String> {
    let trimmed = line.trim_start();
    let body = trimmed
        .strip_prefix("-A ")
        .or_else(|| trimmed.strip_prefix("-A\t"))
        .unwrap_or(trimmed);
    tokenize(body)
}
