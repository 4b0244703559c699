//! Agent configuration
//!
//! Everything is read from the environment (each variable also has a long
//! flag) into [`RunArgs`], then validated once into an [`AgentConfig`].
//! Any validation failure is fatal before reconciliation starts.

use crate::core::error::{Error, Result};
use crate::core::iptables::Family;
use crate::policy::NetworkSettings;
use crate::service::{PodCidrs, ServiceKey};
use crate::validators::parse_family_cidr;
use clap::Args;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const DEFAULT_DNS_SERVICE: &str = "kube-system/kube-dns";

/// Raw settings for `nodewall run`
#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Enabled address families, comma separated (ipv4, ipv6)
    #[arg(long, env = "NET_STACK", default_value = "ipv4")]
    pub net_stack: String,

    /// Node whose spec.podCIDRs supplies the pod CIDR of each family
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// IPv4 pod CIDR, overriding the node's
    #[arg(long, env = "POD_CIDR_IPV4")]
    pub pod_cidr_ipv4: Option<String>,

    /// IPv6 pod CIDR, overriding the node's
    #[arg(long, env = "POD_CIDR_IPV6")]
    pub pod_cidr_ipv6: Option<String>,

    /// Drop packets in conntrack state INVALID (default: true)
    #[arg(long, env = "RULE_DROP_INVALID_INPUT_ENABLE")]
    pub rule_drop_invalid_input_enable: Option<String>,

    /// DNAT externalIP traffic to the clusterIP (default: false)
    #[arg(long, env = "RULE_EXTERNAL_CLUSTER_ENABLE")]
    pub rule_external_cluster_enable: Option<String>,

    /// Skip conntrack for pod DNS traffic (default: false)
    #[arg(long, env = "RULE_NOT_TRACK_DNS_ENABLE")]
    pub rule_not_track_dns_enable: Option<String>,

    /// DNS Services (namespace/name, comma separated) whose clusterIPs skip conntrack
    #[arg(long, env = "NOT_TRACK_DNS_SERVICES", default_value = DEFAULT_DNS_SERVICE)]
    pub not_track_dns_services: String,

    /// Healing timer period
    #[arg(long, env = "HEAL_INTERVAL_SECONDS", default_value_t = 60)]
    pub heal_interval_seconds: u64,

    /// Maximum Service events reconciled concurrently
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = 4)]
    pub reconcile_workers: usize,

    /// Delay before a failed event is retried
    #[arg(long, env = "RETRY_DELAY_SECONDS", default_value_t = 5)]
    pub retry_delay_seconds: u64,

    /// Also run the full drift pass on every healing tick (default: true)
    #[arg(long, env = "DRIFT_RESYNC")]
    pub drift_resync: Option<String>,
}

/// Validated configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentConfig {
    pub families: Vec<Family>,
    pub node_name: Option<String>,
    pub pod_cidr_overrides: PodCidrs,
    pub drop_invalid_input: bool,
    pub external_cluster: bool,
    pub not_track_dns: bool,
    pub dns_services: Vec<ServiceKey>,
    pub heal_interval: Duration,
    pub workers: usize,
    pub retry_delay: Duration,
    pub drift_resync: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            families: vec![Family::V4],
            node_name: None,
            pod_cidr_overrides: PodCidrs::default(),
            drop_invalid_input: true,
            external_cluster: false,
            not_track_dns: false,
            dns_services: vec![ServiceKey::new("kube-system", "kube-dns")],
            heal_interval: Duration::from_secs(60),
            workers: 4,
            retry_delay: Duration::from_secs(5),
            drift_resync: true,
        }
    }
}

impl RunArgs {
    /// Validates every setting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first malformed value.
    pub fn into_config(self) -> Result<AgentConfig> {
        let families = parse_net_stack(&self.net_stack)?;

        let override_for = |field: &str, family: Family, value: Option<&str>| {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| parse_family_cidr(field, family, v))
                .transpose()
        };
        let pod_cidr_overrides = PodCidrs {
            v4: override_for("POD_CIDR_IPV4", Family::V4, self.pod_cidr_ipv4.as_deref())?,
            v6: override_for("POD_CIDR_IPV6", Family::V6, self.pod_cidr_ipv6.as_deref())?,
        };

        let dns_services = self
            .not_track_dns_services
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ServiceKey::from_str)
            .collect::<Result<Vec<_>>>()?;

        if self.heal_interval_seconds == 0 {
            return Err(Error::Config("HEAL_INTERVAL_SECONDS must be positive".into()));
        }
        if self.reconcile_workers == 0 {
            return Err(Error::Config("RECONCILE_WORKERS must be positive".into()));
        }
        if self.reconcile_workers > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "RECONCILE_WORKERS must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        let config = AgentConfig {
            families,
            node_name: self.node_name.filter(|n| !n.trim().is_empty()),
            pod_cidr_overrides,
            drop_invalid_input: parse_toggle(
                "RULE_DROP_INVALID_INPUT_ENABLE",
                self.rule_drop_invalid_input_enable.as_deref(),
                true,
            )?,
            external_cluster: parse_toggle(
                "RULE_EXTERNAL_CLUSTER_ENABLE",
                self.rule_external_cluster_enable.as_deref(),
                false,
            )?,
            not_track_dns: parse_toggle(
                "RULE_NOT_TRACK_DNS_ENABLE",
                self.rule_not_track_dns_enable.as_deref(),
                false,
            )?,
            dns_services,
            heal_interval: Duration::from_secs(self.heal_interval_seconds),
            workers: self.reconcile_workers,
            retry_delay: Duration::from_secs(self.retry_delay_seconds),
            drift_resync: parse_toggle("DRIFT_RESYNC", self.drift_resync.as_deref(), true)?,
        };

        if config.needs_node() && config.node_name.is_none() {
            return Err(Error::Config(
                "NODE_NAME is required unless every enabled family has a POD_CIDR override"
                    .into(),
            ));
        }

        Ok(config)
    }
}

impl AgentConfig {
    /// `true` when some enabled family has no pod CIDR override.
    pub fn needs_node(&self) -> bool {
        self.families
            .iter()
            .any(|f| self.pod_cidr_overrides.get(*f).is_none())
    }

    /// Resolves the pod CIDR of every enabled family, overrides first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an enabled family has no pod CIDR.
    pub fn network_settings(&self, node: PodCidrs) -> Result<NetworkSettings> {
        let mut resolved = PodCidrs::default();
        for family in &self.families {
            let cidr = self
                .pod_cidr_overrides
                .get(*family)
                .or_else(|| node.get(*family))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no {family} pod CIDR: node has none and no override is set"
                    ))
                })?;
            match family {
                Family::V4 => resolved.v4 = Some(cidr),
                Family::V6 => resolved.v6 = Some(cidr),
            }
        }
        Ok(NetworkSettings::new(resolved.v4, resolved.v6))
    }
}

/// `true`/`false`, case-insensitive. Unset or empty yields `default`.
///
/// # Errors
///
/// Returns [`Error::Config`] naming `name` for any other value.
pub fn parse_toggle(name: &str, value: Option<&str>, default: bool) -> Result<bool> {
    let value = value.map(str::trim).unwrap_or_default();
    if value.is_empty() {
        return Ok(default);
    }
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name}: expected true or false, got {value:?}"
        ))),
    }
}

/// Comma separated families, case-insensitive, duplicates ignored.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unknown token or an empty list.
pub fn parse_net_stack(value: &str) -> Result<Vec<Family>> {
    let mut families = Vec::new();
    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let family = Family::from_str(token)
            .map_err(|_| Error::Config(format!("NET_STACK: unknown family {token:?}")))?;
        if !families.contains(&family) {
            families.push(family);
        }
    }
    if families.is_empty() {
        return Err(Error::Config("NET_STACK enables no family".into()));
    }
    families.sort();
    Ok(families)
}
