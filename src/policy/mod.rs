//! Policy modules
//!
//! Each policy owns a set of chains, anchors each of them into a builtin
//! chain with a single JumpLink at position 1, and fills them with content
//! rules:
//!
//! - [`drop_invalid`]: drop packets whose conntrack state is INVALID
//! - [`not_track_dns`]: skip conntrack for pod DNS traffic
//! - [`external_cluster`]: externalIP to clusterIP DNAT with masquerade
//!
//! Policies only touch families that have a pod CIDR in [`NetworkSettings`].

pub mod drop_invalid;
pub mod external_cluster;
pub mod not_track_dns;

use crate::core::error::Result;
use crate::core::iptables::{Chain, Family, Iptables, Table};
use crate::core::rule::{Rule, Target};
use crate::core::runner::CommandRunner;
use crate::validators::network_of;
use ipnetwork::IpNetwork;
use serde::Serialize;
use tracing::info;

pub const DROP_INVALID_INPUT_CHAIN: &str = "NODEWALL_DROP_INVALID_INPUT";
pub const DNS_PREROUTING_CHAIN: &str = "NODEWALL_DNS_PREROUTING";
pub const DNS_OUTPUT_CHAIN: &str = "NODEWALL_DNS_OUTPUT";
pub const EXT_PREROUTING_CHAIN: &str = "NODEWALL_EXT_PREROUTING";
pub const EXT_OUTPUT_CHAIN: &str = "NODEWALL_EXT_OUTPUT";

/// Every owned chain with the builtin chain it is anchored in
pub const ANCHORS: &[Anchor] = &[
    Anchor::new(Table::Filter, "INPUT", DROP_INVALID_INPUT_CHAIN),
    Anchor::new(Table::Raw, "PREROUTING", DNS_PREROUTING_CHAIN),
    Anchor::new(Table::Raw, "OUTPUT", DNS_OUTPUT_CHAIN),
    Anchor::new(Table::Nat, "PREROUTING", EXT_PREROUTING_CHAIN),
    Anchor::new(Table::Nat, "OUTPUT", EXT_OUTPUT_CHAIN),
];

/// Per-family pod CIDRs. A family is enabled when its CIDR is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkSettings {
    pub pod_cidr_v4: Option<IpNetwork>,
    pub pod_cidr_v6: Option<IpNetwork>,
}

impl NetworkSettings {
    /// CIDRs are stored as network addresses, the form rule dumps print.
    pub fn new(pod_cidr_v4: Option<IpNetwork>, pod_cidr_v6: Option<IpNetwork>) -> Self {
        Self {
            pod_cidr_v4: pod_cidr_v4.map(network_of),
            pod_cidr_v6: pod_cidr_v6.map(network_of),
        }
    }

    pub fn pod_cidr(&self, family: Family) -> Option<IpNetwork> {
        match family {
            Family::V4 => self.pod_cidr_v4,
            Family::V6 => self.pod_cidr_v6,
        }
    }

    pub fn is_enabled(&self, family: Family) -> bool {
        self.pod_cidr(family).is_some()
    }

    /// Enabled families with their pod CIDR, IPv4 first.
    pub fn families(&self) -> impl Iterator<Item = (Family, IpNetwork)> + '_ {
        [Family::V4, Family::V6]
            .into_iter()
            .filter_map(|f| self.pod_cidr(f).map(|cidr| (f, cidr)))
    }
}

/// An owned chain and the builtin chain holding its JumpLink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub table: Table,
    pub builtin: &'static str,
    pub owned: &'static str,
}

impl Anchor {
    pub const fn new(table: Table, builtin: &'static str, owned: &'static str) -> Self {
        Self {
            table,
            builtin,
            owned,
        }
    }

    pub fn owned_chain(&self, family: Family) -> Chain {
        Chain::new(family, self.table, self.owned)
    }

    /// The JumpLink: `-j <owned>` in the builtin chain.
    pub fn jump_rule(&self, family: Family) -> Rule {
        Rule::new(
            Chain::new(family, self.table, self.builtin),
            Target::Chain(self.owned.to_string()),
        )
    }

    /// Ensures the owned chain, then its JumpLink at position 1.
    ///
    /// # Errors
    ///
    /// Returns `Err` if either mutation fails.
    pub async fn ensure<R: CommandRunner>(&self, ipt: &Iptables<R>, family: Family) -> Result<()> {
        ipt.ensure_chain(&self.owned_chain(family)).await?;
        ipt.insert_first(&self.jump_rule(family)).await
    }

    /// Deletes the JumpLink, then flushes and deletes the owned chain.
    ///
    /// # Errors
    ///
    /// Returns `Err` if either mutation fails.
    pub async fn remove<R: CommandRunner>(&self, ipt: &Iptables<R>, family: Family) -> Result<()> {
        ipt.delete_rule(&self.jump_rule(family)).await?;
        ipt.remove_chain(&self.owned_chain(family)).await
    }
}

/// Removes every owned chain of `family` with its JumpLink, whether or not
/// the policy owning it is enabled.
///
/// # Errors
///
/// Returns `Err` on the first failed mutation.
pub async fn remove_all<R: CommandRunner>(ipt: &Iptables<R>, family: Family) -> Result<()> {
    for anchor in ANCHORS {
        anchor.remove(ipt, family).await?;
    }
    info!(family = %family, "removed all nodewall chains");
    Ok(())
}
