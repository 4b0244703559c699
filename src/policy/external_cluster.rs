//! externalIP to clusterIP NAT for LoadBalancer Services
//!
//! Pods (and the node itself) reaching a Service through its externalIP are
//! DNATed straight to the clusterIP and marked for masquerade, instead of
//! hairpinning through the load balancer. For one `(externalIP, clusterIP)`
//! pair the policy owns four rules, all tagged with the Service key and
//! appended last:
//!
//! ```text
//! NODEWALL_EXT_PREROUTING  -s <podCIDR> -d <ext> -j KUBE-MARK-MASQ
//! NODEWALL_EXT_PREROUTING  -s <podCIDR> -d <ext> -j DNAT --to-destination <cluster>
//! NODEWALL_EXT_OUTPUT      -m addrtype --src-type LOCAL -d <ext> -j KUBE-MARK-MASQ
//! NODEWALL_EXT_OUTPUT      -m addrtype --src-type LOCAL -d <ext> -j DNAT --to-destination <cluster>
//! ```
//!
//! # Drift cleanup
//!
//! [`ExternalClusterNat::cleanup`] dumps both chains and deletes every rule
//! whose owner is not a current LoadBalancer Service with a clusterIP of that
//! family, or whose fields fit none of that Service's externalIPs. Deletion
//! replays the dumped tokens, so the live rule is removed exactly as found.

use crate::core::codec::{DumpedRule, parse_line, to_delete_args};
use crate::core::error::Result;
use crate::core::iptables::{Family, Iptables};
use crate::core::rule::{MARK_MASQ_CHAIN, Rule, Target};
use crate::core::runner::CommandRunner;
use crate::policy::{ANCHORS, Anchor, EXT_PREROUTING_CHAIN, NetworkSettings};
use crate::service::{ServiceKey, ServiceRecord};
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ExternalClusterNat<R> {
    ipt: Arc<Iptables<R>>,
    net: NetworkSettings,
}

fn anchors() -> &'static [Anchor] {
    &ANCHORS[3..5]
}

impl<R: CommandRunner> ExternalClusterNat<R> {
    pub fn new(ipt: Arc<Iptables<R>>, net: NetworkSettings) -> Self {
        Self { ipt, net }
    }

    /// Ensures both NAT chains and their JumpLinks for every enabled family.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn ensure_chains(&self) -> Result<()> {
        for (family, _) in self.net.families() {
            for anchor in anchors() {
                anchor.ensure(&self.ipt, family).await?;
            }
        }
        Ok(())
    }

    /// Removes JumpLinks and chains for every enabled family.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn teardown(&self) -> Result<()> {
        for (family, _) in self.net.families() {
            for anchor in anchors() {
                anchor.remove(&self.ipt, family).await?;
            }
            info!(family = %family, "external-cluster NAT disabled");
        }
        Ok(())
    }

    /// The four rules for one pair, or `None` when the pair is not
    /// applicable (family disabled, or addresses of different families).
    pub fn rules_for(
        &self,
        key: &ServiceKey,
        external_ip: IpAddr,
        cluster_ip: IpAddr,
    ) -> Option<[Rule; 4]> {
        let family = Family::of(&cluster_ip);
        let pod_cidr = self.net.pod_cidr(family)?;
        if !family.contains(&external_ip) {
            return None;
        }

        let owner = key.to_string();
        let prerouting = anchors()[0].owned_chain(family);
        let output = anchors()[1].owned_chain(family);

        let from_pods = |target: Target| {
            Rule::new(prerouting.clone(), target)
                .owner(owner.clone())
                .source(pod_cidr)
                .destination(external_ip)
        };
        let from_host = |target: Target| {
            Rule::new(output.clone(), target)
                .owner(owner.clone())
                .module("addrtype")
                .option("--src-type", "LOCAL")
                .destination(external_ip)
        };

        Some([
            from_pods(Target::MarkMasquerade),
            from_pods(Target::Dnat(cluster_ip)),
            from_host(Target::MarkMasquerade),
            from_host(Target::Dnat(cluster_ip)),
        ])
    }

    /// Ensures the four rules for one pair.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation; earlier rules stay.
    pub async fn create(&self, key: &ServiceKey, external_ip: IpAddr, cluster_ip: IpAddr) -> Result<()> {
        let Some(rules) = self.rules_for(key, external_ip, cluster_ip) else {
            debug!(service = %key, external = %external_ip, cluster = %cluster_ip, "pair not applicable");
            return Ok(());
        };
        for rule in &rules {
            self.ipt.append_last(rule).await?;
        }
        Ok(())
    }

    /// Deletes the four rules for one pair; absent rules are fine.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn delete(&self, key: &ServiceKey, external_ip: IpAddr, cluster_ip: IpAddr) -> Result<()> {
        let Some(rules) = self.rules_for(key, external_ip, cluster_ip) else {
            return Ok(());
        };
        for rule in &rules {
            self.ipt.delete_rule(rule).await?;
        }
        Ok(())
    }

    /// Deletes orphaned and stale rules across both chains of every enabled
    /// family. Returns the number of rules deleted.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a dump or a delete fails. Unparseable lines are
    /// skipped with a warning.
    pub async fn cleanup(&self, services: &[ServiceRecord]) -> Result<usize> {
        let mut deleted = 0;

        for (family, pod_cidr) in self.net.families() {
            let current: HashMap<String, (&ServiceRecord, IpAddr)> = services
                .iter()
                .filter(|s| s.load_balancer)
                .filter_map(|s| s.cluster_ip(family).map(|ip| (s.key.to_string(), (s, ip))))
                .collect();

            for anchor in anchors() {
                let chain = anchor.owned_chain(family);
                let from_pods = anchor.owned == EXT_PREROUTING_CHAIN;

                for line in self.ipt.dump_chain(&chain).await? {
                    let rule = match parse_line(&line) {
                        Ok(rule) => rule,
                        Err(e) => {
                            warn!(chain = %chain, "Skipping rule: {e}");
                            continue;
                        }
                    };

                    let keep = rule
                        .owner
                        .as_deref()
                        .and_then(|owner| current.get(owner))
                        .is_some_and(|(record, cluster_ip)| {
                            record.external_ips.iter().any(|ext| {
                                is_consistent(&rule, family, *ext, *cluster_ip, from_pods.then_some(pod_cidr))
                            })
                        });
                    if keep {
                        continue;
                    }

                    info!(
                        chain = %chain,
                        owner = rule.owner.as_deref().unwrap_or("-"),
                        rule = %rule.line,
                        "removing stale rule"
                    );
                    self.ipt
                        .delete_rule_raw(family, chain.table, &to_delete_args(&rule.line))
                        .await?;
                    deleted += 1;
                }
            }
        }

        Ok(deleted)
    }
}

/// Whether a dumped rule is one of the four rules for `(external_ip, cluster_ip)`.
/// `pod_cidr` is set for the pre-routing chain, whose rules match on source.
fn is_consistent(
    rule: &DumpedRule,
    family: Family,
    external_ip: IpAddr,
    cluster_ip: IpAddr,
    pod_cidr: Option<IpNetwork>,
) -> bool {
    if !family.contains(&external_ip) {
        return false;
    }
    let Ok(host) = IpNetwork::new(external_ip, family.host_prefix()) else {
        return false;
    };
    if rule.destination != Some(host) {
        return false;
    }

    let source_ok = match (pod_cidr, rule.source) {
        (Some(expected), Some(actual)) => crate::validators::network_of(actual) == expected,
        (None, None) => true,
        _ => false,
    };
    if !source_ok {
        return false;
    }

    match rule.target.as_str() {
        MARK_MASQ_CHAIN => true,
        "DNAT" => rule.nat_destination == Some(cluster_ip),
        _ => false,
    }
}
