//! Chain lifecycle
//!
//! Both operations are idempotent: ensuring an existing chain and removing an
//! absent one succeed without mutating anything.

use crate::core::error::{CommandErrorKind, Error, Result};
use crate::core::iptables::{Chain, Iptables};
use crate::core::runner::CommandRunner;
use tracing::{debug, info};

impl<R: CommandRunner> Iptables<R> {
    /// Returns `true` if `chain` exists (`-nL <chain>`).
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than the chain being absent.
    pub async fn chain_exists(&self, chain: &Chain) -> Result<bool> {
        let _guard = self.guard().await;
        self.probe_chain(chain).await
    }

    /// Creates `chain` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the probe or the `-N` invocation fails.
    pub async fn ensure_chain(&self, chain: &Chain) -> Result<()> {
        let _guard = self.guard().await;

        if self.probe_chain(chain).await? {
            debug!(chain = %chain, "chain present");
            return Ok(());
        }

        match self
            .exec(chain.family, chain.table, &["-N", &chain.name])
            .await
        {
            Ok(_) => {
                info!(chain = %chain, "created chain");
                Ok(())
            }
            // Another process created it between probe and create
            Err(e) if e.command_kind() == Some(CommandErrorKind::AlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Flushes then deletes `chain`; absent chains are a no-op.
    ///
    /// JumpLinks referencing the chain must already be gone, otherwise `-X`
    /// fails and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the chain is builtin or a flush/delete fails.
    pub async fn remove_chain(&self, chain: &Chain) -> Result<()> {
        if chain.is_builtin() {
            return Err(Error::Internal(format!(
                "refusing to remove builtin chain {chain}"
            )));
        }

        let _guard = self.guard().await;

        if !self.probe_chain(chain).await? {
            debug!(chain = %chain, "chain already absent");
            return Ok(());
        }

        self.exec(chain.family, chain.table, &["-F", &chain.name])
            .await?;
        self.exec(chain.family, chain.table, &["-X", &chain.name])
            .await?;
        info!(chain = %chain, "removed chain");
        Ok(())
    }

    /// Existence probe. Caller holds the lock.
    async fn probe_chain(&self, chain: &Chain) -> Result<bool> {
        match self
            .exec(chain.family, chain.table, &["-nL", &chain.name])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
