//! Serialized access to the per-family packet-filter tools
//!
//! [`Iptables`] wraps a [`CommandRunner`] with the process-wide lock. Every
//! public operation (here and in [`chain`](crate::core::chain) and
//! [`rule`](crate::core::rule)) holds the lock across its whole
//! check-then-act sequence, so two concurrent reconciles can never both see a
//! rule as absent and both insert it.
//!
//! Each invocation is prefixed with `-w 5 -W 100000 -t <table>`: wait up to
//! five seconds for the tool's own xtables lock, polling every 100ms, so
//! kube-proxy and friends are waited for instead of failing us.

use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::runner::{CommandOutput, CommandRunner, Invocation, Tool};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use strum::{Display, EnumIter, EnumString};
use tokio::sync::{Mutex, MutexGuard};

/// Seconds to wait for the xtables lock
pub const LOCK_WAIT_SECONDS: u32 = 5;

/// Poll interval while waiting for the xtables lock, in microseconds
pub const LOCK_WAIT_INTERVAL_MICROS: u32 = 100_000;

/// Builtin chains the agent anchors into but never creates or deletes
pub const BUILTIN_CHAINS: &[&str] = &["INPUT", "OUTPUT", "PREROUTING", "POSTROUTING", "FORWARD"];

/// Address family, selecting `iptables` or `ip6tables`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumIter, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum Family {
    #[strum(serialize = "ipv4")]
    #[serde(rename = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    #[serde(rename = "ipv6")]
    V6,
}

impl Family {
    /// Rule tool for this family (`NODEWALL_IPTABLES` / `NODEWALL_IP6TABLES` override).
    pub fn binary(self) -> String {
        match self {
            Family::V4 => std::env::var("NODEWALL_IPTABLES").unwrap_or_else(|_| "iptables".into()),
            Family::V6 => {
                std::env::var("NODEWALL_IP6TABLES").unwrap_or_else(|_| "ip6tables".into())
            }
        }
    }

    /// Dump tool for this family (`NODEWALL_IPTABLES_SAVE` / `NODEWALL_IP6TABLES_SAVE` override).
    pub fn save_binary(self) -> String {
        match self {
            Family::V4 => std::env::var("NODEWALL_IPTABLES_SAVE")
                .unwrap_or_else(|_| "iptables-save".into()),
            Family::V6 => std::env::var("NODEWALL_IP6TABLES_SAVE")
                .unwrap_or_else(|_| "ip6tables-save".into()),
        }
    }

    /// Prefix length of a single host in this family.
    pub fn host_prefix(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// `true` when `addr` belongs to this family.
    pub fn contains(self, addr: &IpAddr) -> bool {
        Self::of(addr) == self
    }
}

/// Packet-filter table
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Nat,
    Filter,
    Raw,
}

/// A chain in one table of one family
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Chain {
    pub family: Family,
    pub table: Table,
    pub name: String,
}

impl Chain {
    pub fn new(family: Family, table: Table, name: impl Into<String>) -> Self {
        Self {
            family,
            table,
            name: name.into(),
        }
    }

    /// Builtin chains pre-exist in the kernel and are never created or removed.
    pub fn is_builtin(&self) -> bool {
        BUILTIN_CHAINS.contains(&self.name.as_str())
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.family, self.table, self.name)
    }
}

/// Lock-holding facade over a [`CommandRunner`]
#[derive(Debug)]
pub struct Iptables<R> {
    runner: R,
    lock: Mutex<()>,
}

impl<R: CommandRunner> Iptables<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            lock: Mutex::new(()),
        }
    }

    /// The wrapped runner.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Acquires the process-wide command lock.
    pub(crate) async fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Runs one rule-tool invocation under the lock, failing on non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Command`] classified by the tool's diagnostic text.
    pub async fn run(&self, family: Family, table: Table, args: &[&str]) -> Result<String> {
        let _guard = self.guard().await;
        self.exec(family, table, args).await
    }

    /// Rule-tool invocation with the standard prefix. Caller holds the lock.
    pub(crate) async fn exec(&self, family: Family, table: Table, args: &[&str]) -> Result<String> {
        let invocation = Invocation {
            family,
            tool: Tool::Rules,
            args: prefixed_args(table, args),
        };
        let output = self.runner.run(&invocation).await?;
        check_output(&invocation, output)
    }

    /// Save-style dump of one table. Caller holds the lock.
    pub(crate) async fn exec_save(&self, family: Family, table: Table) -> Result<String> {
        let invocation = Invocation {
            family,
            tool: Tool::Save,
            args: vec!["-t".to_string(), table.to_string()],
        };
        let output = self.runner.run(&invocation).await?;
        check_output(&invocation, output)
    }
}

/// `-w <s> -W <us> -t <table>` followed by `args`.
pub fn prefixed_args(table: Table, args: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 6);
    out.push("-w".to_string());
    out.push(LOCK_WAIT_SECONDS.to_string());
    out.push("-W".to_string());
    out.push(LOCK_WAIT_INTERVAL_MICROS.to_string());
    out.push("-t".to_string());
    out.push(table.to_string());
    out.extend(args.iter().map(|a| (*a).to_string()));
    out
}

fn check_output(invocation: &Invocation, output: CommandOutput) -> Result<String> {
    if output.success {
        return Ok(output.stdout);
    }

    let diagnostic = if output.stderr.trim().is_empty() {
        output.stdout
    } else {
        output.stderr
    };

    Err(Error::Command {
        binary: invocation.program(),
        args: invocation.display_args(),
        kind: IptablesErrorPattern::classify(&diagnostic),
        stderr: diagnostic.trim().to_string(),
        exit_code: output.exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CommandErrorKind;
    use crate::core::test_helpers::FakeIptables;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_prefix_order() {
        let args = prefixed_args(Table::Nat, &["-N", "NODEWALL_EXT_OUTPUT"]);
        assert_eq!(
            args,
            vec!["-w", "5", "-W", "100000", "-t", "nat", "-N", "NODEWALL_EXT_OUTPUT"]
        );
    }

    #[test]
    fn test_family_parse_is_case_insensitive() {
        assert_eq!(Family::from_str("IPv6").unwrap(), Family::V6);
        assert_eq!(Family::from_str("ipv4").unwrap(), Family::V4);
        assert!(Family::from_str("ipx").is_err());
    }

    #[test]
    fn test_family_of_address() {
        let v4: IpAddr = "10.96.0.10".parse().unwrap();
        let v6: IpAddr = "fd00::a".parse().unwrap();
        assert!(Family::V4.contains(&v4));
        assert!(!Family::V4.contains(&v6));
        assert_eq!(Family::of(&v6).host_prefix(), 128);
    }

    #[test]
    fn test_table_display_matches_tool_names() {
        let names: Vec<String> = Table::iter().map(|t| t.to_string()).collect();
        assert_eq!(names, vec!["nat", "filter", "raw"]);
    }

    #[test]
    fn test_builtin_detection() {
        assert!(Chain::new(Family::V4, Table::Filter, "INPUT").is_builtin());
        assert!(!Chain::new(Family::V4, Table::Nat, "KUBE-MARK-MASQ").is_builtin());
    }

    #[tokio::test]
    async fn test_failure_is_classified_at_boundary() {
        let ipt = Iptables::new(FakeIptables::new());
        let err = ipt
            .run(Family::V4, Table::Nat, &["-F", "NODEWALL_MISSING"])
            .await
            .unwrap_err();
        assert_eq!(err.command_kind(), Some(CommandErrorKind::NotFound));
    }
}
