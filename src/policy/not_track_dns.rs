//! Bypass connection tracking for pod DNS traffic
//!
//! Both raw-table chains (pre-routing and output) get the same content:
//! UDP/53 to and from the pod CIDR, plus one rule per DNS Service clusterIP.
//! DNS clusterIP rules are only ever added; disabling the policy removes the
//! chains wholesale.

use crate::core::error::Result;
use crate::core::iptables::{Chain, Family, Iptables};
use crate::core::rule::{Rule, Target};
use crate::core::runner::CommandRunner;
use crate::policy::{ANCHORS, Anchor, NetworkSettings};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

const DNS_PORT: u16 = 53;

pub struct NotTrackDns<R> {
    ipt: Arc<Iptables<R>>,
    net: NetworkSettings,
}

fn anchors() -> &'static [Anchor] {
    &ANCHORS[1..3]
}

fn udp_dns(chain: Chain) -> Rule {
    Rule::new(chain, Target::NoTrack).protocol("UDP").module("udp")
}

impl<R: CommandRunner> NotTrackDns<R> {
    pub fn new(ipt: Arc<Iptables<R>>, net: NetworkSettings) -> Self {
        Self { ipt, net }
    }

    /// Ensures chains, JumpLinks and pod CIDR rules for every enabled family.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn ensure(&self) -> Result<()> {
        for (family, pod_cidr) in self.net.families() {
            for anchor in anchors() {
                anchor.ensure(&self.ipt, family).await?;
                let chain = anchor.owned_chain(family);
                self.ipt
                    .insert_first(
                        &udp_dns(chain.clone())
                            .source(pod_cidr)
                            .option("--sport", DNS_PORT),
                    )
                    .await?;
                self.ipt
                    .insert_first(
                        &udp_dns(chain)
                            .destination(pod_cidr)
                            .option("--dport", DNS_PORT),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Adds not-track rules for a DNS Service clusterIP in both chains.
    /// Addresses of a disabled family are ignored.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn add_dns_cluster_ip(&self, cluster_ip: IpAddr) -> Result<()> {
        let family = Family::of(&cluster_ip);
        if !self.net.is_enabled(family) {
            debug!(ip = %cluster_ip, "DNS clusterIP family not enabled");
            return Ok(());
        }

        for anchor in anchors() {
            let rule = udp_dns(anchor.owned_chain(family))
                .destination(cluster_ip)
                .option("--dport", DNS_PORT);
            self.ipt.insert_first(&rule).await?;
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
            info!(family = %family, "not-track-dns disabled");
        }
        Ok(())
    }
}
