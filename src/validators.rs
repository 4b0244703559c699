//! Address and CIDR validation for nodewall
//!
//! All IP literals that come from outside (environment, Service objects,
//! Node objects) pass through here before they reach a rule.

use crate::core::error::{Error, Result};
use crate::core::iptables::Family;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Returns `true` if `value` is an IPv4 address with a prefix length.
///
/// Host bits may be set (`127.0.0.1/24` is valid).
///
/// # Examples
///
/// ```
/// use nodewall::validators::is_ipv4_cidr;
///
/// assert!(is_ipv4_cidr("127.0.0.1/24"));
/// assert!(!is_ipv4_cidr("127.0.0.1/40"));
/// assert!(!is_ipv4_cidr("127.0.0.1"));
/// ```
pub fn is_ipv4_cidr(value: &str) -> bool {
    matches!(parse_cidr(value), Some(IpNetwork::V4(_)))
}

/// Returns `true` if `value` is an IPv6 address with a prefix length.
///
/// # Examples
///
/// ```
/// use nodewall::validators::is_ipv6_cidr;
///
/// assert!(is_ipv6_cidr("::1/64"));
/// assert!(!is_ipv6_cidr("::fffff/64"));
/// ```
pub fn is_ipv6_cidr(value: &str) -> bool {
    matches!(parse_cidr(value), Some(IpNetwork::V6(_)))
}

fn parse_cidr(value: &str) -> Option<IpNetwork> {
    if !value.contains('/') {
        return None;
    }
    value.parse().ok()
}

/// Parses a CIDR that must belong to `family`. Spaces are ignored.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `field` if the value is not a CIDR of
/// that family.
pub fn parse_family_cidr(field: &str, family: Family, value: &str) -> Result<IpNetwork> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let valid = match family {
        Family::V4 => is_ipv4_cidr(&compact),
        Family::V6 => is_ipv6_cidr(&compact),
    };
    match parse_cidr(&compact) {
        Some(net) if valid => Ok(net),
        _ => Err(Error::Config(format!(
            "{field}: {value:?} is not a valid {family} CIDR"
        ))),
    }
}

/// Parses an IP literal from a Service or Node field.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if `value` is not an address of any family.
pub fn parse_address(field: &str, value: &str) -> Result<IpAddr> {
    value.trim().parse().map_err(|_| Error::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Pod CIDR as the kernel prints it: network address plus prefix.
pub fn network_of(net: IpNetwork) -> IpNetwork {
    // Prefix already valid for the family, so this cannot fail
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}
