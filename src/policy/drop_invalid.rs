//! Drop packets in conntrack state INVALID on input

use crate::core::error::Result;
use crate::core::iptables::{Family, Iptables};
use crate::core::rule::{Rule, Target};
use crate::core::runner::CommandRunner;
use crate::policy::{ANCHORS, Anchor, DROP_INVALID_INPUT_CHAIN, NetworkSettings};
use std::sync::Arc;
use tracing::info;

pub struct DropInvalidInput<R> {
    ipt: Arc<Iptables<R>>,
    net: NetworkSettings,
}

impl<R: CommandRunner> DropInvalidInput<R> {
    pub fn new(ipt: Arc<Iptables<R>>, net: NetworkSettings) -> Self {
        Self { ipt, net }
    }

    fn anchor() -> &'static Anchor {
        &ANCHORS[0]
    }

    /// `-m conntrack --ctstate INVALID -j DROP` in the owned chain.
    pub fn drop_rule(family: Family) -> Rule {
        Rule::new(Self::anchor().owned_chain(family), Target::Drop)
            .module("conntrack")
            .option("--ctstate", "INVALID")
    }

    /// Ensures chain, JumpLink and drop rule for every enabled family.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn ensure(&self) -> Result<()> {
        for (family, _) in self.net.families() {
            Self::anchor().ensure(&self.ipt, family).await?;
            self.ipt.insert_first(&Self::drop_rule(family)).await?;
        }
        Ok(())
    }

    /// Removes JumpLink and chain for every enabled family.
    ///
    /// # Errors
    ///
    /// Returns `Err` on the first failed mutation.
    pub async fn teardown(&self) -> Result<()> {
        for (family, _) in self.net.families() {
            Self::anchor().remove(&self.ipt, family).await?;
            info!(family = %family, chain = DROP_INVALID_INPUT_CHAIN, "drop-invalid-input disabled");
        }
        Ok(())
    }
}
