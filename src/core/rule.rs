//! Structured rules and their idempotent lifecycle
//!
//! A [`Rule`] is serialized to command tokens in exactly one place
//! ([`Rule::spec_tokens`]), so the existence probe, the insert/append and the
//! delete all address the same rule. Every mutating operation probes with
//! `-C` first and holds the command lock across probe and mutation.

use crate::core::error::Result;
use crate::core::iptables::{Chain, Family, Iptables, Table};
use crate::core::runner::CommandRunner;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info};

/// Chain kube-proxy uses to mark packets for masquerade on egress
pub const MARK_MASQ_CHAIN: &str = "KUBE-MARK-MASQ";

/// One match clause, rendered in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Match {
    /// `-p <proto>`
    Protocol(String),
    /// `-s <addr[/len]>`
    Source(String),
    /// `-d <addr[/len]>`
    Destination(String),
    /// `-m <module>`
    Module(String),
    /// `--<flag> <value>` belonging to the preceding module
    Option(String, String),
}

impl Match {
    fn push_tokens(&self, out: &mut Vec<String>) {
        match self {
            Match::Protocol(p) => out.extend(["-p".to_string(), p.clone()]),
            Match::Source(s) => out.extend(["-s".to_string(), s.clone()]),
            Match::Destination(d) => out.extend(["-d".to_string(), d.clone()]),
            Match::Module(m) => out.extend(["-m".to_string(), m.clone()]),
            Match::Option(flag, value) => out.extend([flag.clone(), value.clone()]),
        }
    }
}

/// Rule action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Target {
    /// Jump into another chain
    Chain(String),
    Drop,
    /// `-j KUBE-MARK-MASQ`
    MarkMasquerade,
    /// `-j DNAT --to-destination <addr>`
    Dnat(IpAddr),
    /// `-j CT --notrack`
    NoTrack,
}

impl Target {
    fn push_tokens(&self, out: &mut Vec<String>) {
        out.push("-j".to_string());
        match self {
            Target::Chain(name) => out.push(name.clone()),
            Target::Drop => out.push("DROP".to_string()),
            Target::MarkMasquerade => out.push(MARK_MASQ_CHAIN.to_string()),
            Target::Dnat(addr) => {
                out.extend([
                    "DNAT".to_string(),
                    "--to-destination".to_string(),
                    addr.to_string(),
                ]);
            }
            Target::NoTrack => out.extend(["CT".to_string(), "--notrack".to_string()]),
        }
    }
}

/// Where a rule goes when it is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// `-I <chain> 1`: jump rules and node-wide policy rules
    First,
    /// `-A <chain>`: per-Service rules
    Last,
}

/// A rule in a specific chain, optionally tagged with its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub chain: Chain,
    /// Owner tag, carried as `-m comment --comment <owner>`
    pub owner: Option<String>,
    pub matches: Vec<Match>,
    pub target: Target,
}

impl Rule {
    pub fn new(chain: Chain, target: Target) -> Self {
        Self {
            chain,
            owner: None,
            matches: Vec::new(),
            target,
        }
    }

    #[must_use]
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    #[must_use]
    pub fn protocol(mut self, proto: &str) -> Self {
        self.matches.push(Match::Protocol(proto.to_string()));
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl fmt::Display) -> Self {
        self.matches.push(Match::Source(source.to_string()));
        self
    }

    #[must_use]
    pub fn destination(mut self, destination: impl fmt::Display) -> Self {
        self.matches.push(Match::Destination(destination.to_string()));
        self
    }

    #[must_use]
    pub fn module(mut self, module: &str) -> Self {
        self.matches.push(Match::Module(module.to_string()));
        self
    }

    #[must_use]
    pub fn option(mut self, flag: &str, value: impl fmt::Display) -> Self {
        self.matches
            .push(Match::Option(flag.to_string(), value.to_string()));
        self
    }

    pub fn family(&self) -> Family {
        self.chain.family
    }

    pub fn table(&self) -> Table {
        self.chain.table
    }

    /// Rule body: `[-m comment --comment <owner>] <matches> -j <target...>`.
    pub fn spec_tokens(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(owner) = &self.owner {
            out.extend([
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                owner.clone(),
            ]);
        }
        for m in &self.matches {
            m.push_tokens(&mut out);
        }
        self.target.push_tokens(&mut out);
        out
    }

    /// Full argument list for `op` (`-C`, `-A`, `-D`, or `-I` at position 1).
    pub fn command_args(&self, op: &str) -> Vec<String> {
        let mut out = vec![op.to_string(), self.chain.name.clone()];
        if op == "-I" {
            out.push("1".to_string());
        }
        out.extend(self.spec_tokens());
        out
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.chain, self.spec_tokens().join(" "))
    }
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}

impl<R: CommandRunner> Iptables<R> {
    /// `-C` probe for `rule`.
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than the rule being absent.
    pub async fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        let _guard = self.guard().await;
        self.probe_rule(rule.family(), rule.table(), &rule.command_args("-C"))
            .await
    }

    /// Inserts `rule` at position 1 unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the probe or the insert fails.
    pub async fn insert_first(&self, rule: &Rule) -> Result<()> {
        self.ensure_rule(rule, Position::First).await
    }

    /// Appends `rule` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the probe or the append fails.
    pub async fn append_last(&self, rule: &Rule) -> Result<()> {
        self.ensure_rule(rule, Position::Last).await
    }

    /// Creates `rule` at `position` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the probe or the mutation fails.
    pub async fn ensure_rule(&self, rule: &Rule, position: Position) -> Result<()> {
        let _guard = self.guard().await;

        if self
            .probe_rule(rule.family(), rule.table(), &rule.command_args("-C"))
            .await?
        {
            debug!(rule = %rule, "rule present");
            return Ok(());
        }

        let op = match position {
            Position::First => "-I",
            Position::Last => "-A",
        };
        self.exec(rule.family(), rule.table(), &as_strs(&rule.command_args(op)))
            .await?;
        info!(rule = %rule, "created rule");
        Ok(())
    }

    /// Deletes `rule`; an absent rule, chain or target counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns `Err` for any other failure.
    pub async fn delete_rule(&self, rule: &Rule) -> Result<()> {
        let _guard = self.guard().await;
        let deleted = self
            .delete_probed(
                rule.family(),
                rule.table(),
                &rule.command_args("-C"),
                &rule.command_args("-D"),
            )
            .await?;
        if deleted {
            info!(rule = %rule, "deleted rule");
        }
        Ok(())
    }

    /// Deletes the rule described by dumped tokens (`<chain> <spec...>`, as
    /// produced by [`to_delete_args`](crate::core::codec::to_delete_args)).
    ///
    /// # Errors
    ///
    /// Returns `Err` for failures other than the rule being absent.
    pub async fn delete_rule_raw(&self, family: Family, table: Table, tokens: &[String]) -> Result<()> {
        let mut check = vec!["-C".to_string()];
        check.extend_from_slice(tokens);
        let mut delete = vec!["-D".to_string()];
        delete.extend_from_slice(tokens);

        let _guard = self.guard().await;
        let deleted = self.delete_probed(family, table, &check, &delete).await?;
        if deleted {
            info!(family = %family, table = %table, rule = %tokens.join(" "), "deleted rule");
        }
        Ok(())
    }

    /// Live rules of `chain` as `-A <chain> ...` lines, in kernel order.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the save tool fails.
    pub async fn dump_chain(&self, chain: &Chain) -> Result<Vec<String>> {
        let dump = {
            let _guard = self.guard().await;
            self.exec_save(chain.family, chain.table).await?
        };

        Ok(dump
            .lines()
            .filter(|line| {
                let mut tokens = line.split_whitespace();
                tokens.next() == Some("-A") && tokens.next() == Some(chain.name.as_str())
            })
            .map(str::to_string)
            .collect())
    }

    /// Caller holds the lock.
    async fn probe_rule(&self, family: Family, table: Table, check: &[String]) -> Result<bool> {
        match self.exec(family, table, &as_strs(check)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Probe then delete. Returns whether a rule was removed. Caller holds the lock.
    async fn delete_probed(
        &self,
        family: Family,
        table: Table,
        check: &[String],
        delete: &[String],
    ) -> Result<bool> {
        if !self.probe_rule(family, table, check).await? {
            debug!(rule = %delete.join(" "), "rule already absent");
            return Ok(false);
        }

        match self.exec(family, table, &as_strs(delete)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
