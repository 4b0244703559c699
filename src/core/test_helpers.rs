//! Shared test utilities for core module tests
//!
//! Provides [`FakeIptables`], an in-memory stand-in for the `iptables` family
//! of tools, so tests never touch the host's tables or need root.
//! This module is only compiled in test mode.

use crate::core::codec::tokenize;
use crate::core::error::Result;
use crate::core::iptables::{Family, Table};
use crate::core::runner::{CommandOutput, CommandRunner, Invocation, Tool};
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Mutex for tests that need exclusive access to environment variables.
///
/// Hold the guard while setting and restoring the `NODEWALL_*` binary
/// overrides. Do not hold it across an `.await`.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.\n";
const BAD_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).\n";
const CHAIN_EXISTS: &str = "iptables: Chain already exists.\n";
const NOT_EMPTY: &str = "iptables: Directory not empty.\n";
const IN_USE: &str = "iptables: Too many links.\n";

const BUILTIN_TARGETS: &[&str] = &[
    "ACCEPT", "DROP", "RETURN", "REJECT", "DNAT", "SNAT", "MASQUERADE", "CT", "MARK", "LOG",
];

type ChainKey = (Family, Table, String);

#[derive(Debug, Default)]
struct State {
    /// Chain order per table matters for the save output
    chains: BTreeMap<(Family, Table), Vec<String>>,
    rules: BTreeMap<ChainKey, Vec<Vec<String>>>,
    log: Vec<String>,
    failures: Vec<(String, String)>,
}

/// In-memory emulation of `iptables`/`ip6tables` and their `-save` tools.
///
/// Cloning shares state, so a test can keep a handle after moving one into
/// an [`Iptables`](crate::core::iptables::Iptables).
#[derive(Debug, Clone)]
pub struct FakeIptables {
    state: Arc<Mutex<State>>,
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIptables {
    /// Builtin chains for both families, plus kube-proxy's `KUBE-MARK-MASQ`.
    pub fn new() -> Self {
        let mut state = State::default();
        for family in [Family::V4, Family::V6] {
            state.chains.insert(
                (family, Table::Filter),
                vec!["INPUT".into(), "FORWARD".into(), "OUTPUT".into()],
            );
            state.chains.insert(
                (family, Table::Nat),
                vec![
                    "PREROUTING".into(),
                    "INPUT".into(),
                    "OUTPUT".into(),
                    "POSTROUTING".into(),
                    "KUBE-MARK-MASQ".into(),
                ],
            );
            state.chains.insert(
                (family, Table::Raw),
                vec!["PREROUTING".into(), "OUTPUT".into()],
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Makes the next invocation whose arguments contain `token` fail with `stderr`.
    pub fn fail_next(&self, token: &str, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((token.to_string(), stderr.to_string()));
    }

    /// Installs a rule from a save-style line, creating its chain if needed.
    pub fn seed(&self, family: Family, table: Table, line: &str) {
        let tokens = tokenize(line);
        assert_eq!(tokens.first().map(String::as_str), Some("-A"), "seed needs -A");
        let chain = tokens[1].clone();
        let mut state = self.state.lock().unwrap();
        let chains = state.chains.entry((family, table)).or_default();
        if !chains.contains(&chain) {
            chains.push(chain.clone());
        }
        let spec = canonical(family, &tokens[2..]);
        state
            .rules
            .entry((family, table, chain))
            .or_default()
            .push(spec);
    }

    /// Rules of a chain, rendered the way the save tool prints them.
    pub fn rules(&self, family: Family, table: Table, chain: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .rules
            .get(&(family, table, chain.to_string()))
            .map(|rules| rules.iter().map(|r| render(chain, r)).collect())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, family: Family, table: Table, chain: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .chains
            .get(&(family, table))
            .is_some_and(|c| c.iter().any(|n| n == chain))
    }

    /// Every invocation so far, as `<program> <args>`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    /// Invocations that changed (or tried to change) state.
    pub fn mutations(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|l| {
                l.split_whitespace()
                    .any(|t| matches!(t, "-N" | "-F" | "-X" | "-I" | "-A" | "-D"))
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    fn execute(&self, invocation: &Invocation) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let program = match (invocation.family, invocation.tool) {
            (Family::V4, Tool::Rules) => "iptables",
            (Family::V6, Tool::Rules) => "ip6tables",
            (Family::V4, Tool::Save) => "iptables-save",
            (Family::V6, Tool::Save) => "ip6tables-save",
        };
        state
            .log
            .push(format!("{program} {}", invocation.args.join(" ")));

        if let Some(i) = state
            .failures
            .iter()
            .position(|(token, _)| invocation.args.iter().any(|a| a == token))
        {
            let (_, stderr) = state.failures.remove(i);
            return CommandOutput::failed(stderr);
        }

        match invocation.tool {
            Tool::Save => save(&state, invocation),
            Tool::Rules => apply(&mut state, invocation),
        }
    }
}

impl CommandRunner for FakeIptables {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        Ok(self.execute(invocation))
    }
}

fn parse_table(name: &str) -> Option<Table> {
    match name {
        "nat" => Some(Table::Nat),
        "filter" => Some(Table::Filter),
        "raw" => Some(Table::Raw),
        _ => None,
    }
}

fn save(state: &State, invocation: &Invocation) -> CommandOutput {
    let Some(table) = invocation
        .args
        .iter()
        .position(|a| a == "-t")
        .and_then(|i| invocation.args.get(i + 1))
        .and_then(|t| parse_table(t))
    else {
        return CommandOutput::failed("iptables-save: table argument required");
    };

    let family = invocation.family;
    let mut out = String::from("# Generated by iptables-save v1.8.7\n");
    out.push_str(&format!("*{table}\n"));
    let chains = state.chains.get(&(family, table)).cloned().unwrap_or_default();
    for chain in &chains {
        let policy = if crate::core::iptables::BUILTIN_CHAINS.contains(&chain.as_str()) {
            "ACCEPT"
        } else {
            "-"
        };
        out.push_str(&format!(":{chain} {policy} [0:0]\n"));
    }
    for chain in &chains {
        if let Some(rules) = state.rules.get(&(family, table, chain.clone())) {
            for rule in rules {
                out.push_str(&render(chain, rule));
                out.push('\n');
            }
        }
    }
    out.push_str("COMMIT\n");
    CommandOutput::ok(out)
}

fn apply(state: &mut State, invocation: &Invocation) -> CommandOutput {
    let args = &invocation.args;
    let prefix_ok = args.len() >= 8
        && args[0] == "-w"
        && args[2] == "-W"
        && args[4] == "-t";
    if !prefix_ok {
        return CommandOutput::failed("fake iptables: missing -w/-W/-t prefix");
    }
    let Some(table) = parse_table(&args[5]) else {
        return CommandOutput::failed("iptables: can't initialize iptables table: Table does not exist");
    };
    let family = invocation.family;
    let op = args[6].as_str();
    let chain = args[7].clone();
    let rest = &args[8..];

    let exists = state
        .chains
        .get(&(family, table))
        .is_some_and(|c| c.contains(&chain));
    let key = (family, table, chain.clone());

    match op {
        "-nL" | "-L" => {
            if exists {
                CommandOutput::ok(format!("Chain {chain}\n"))
            } else {
                CommandOutput::failed(NO_CHAIN)
            }
        }
        "-N" => {
            if exists {
                return CommandOutput::failed(CHAIN_EXISTS);
            }
            state.chains.entry((family, table)).or_default().push(chain);
            CommandOutput::ok("")
        }
        "-F" => {
            if !exists {
                return CommandOutput::failed(NO_CHAIN);
            }
            state.rules.remove(&key);
            CommandOutput::ok("")
        }
        "-X" => {
            if !exists {
                return CommandOutput::failed(NO_CHAIN);
            }
            if state.rules.get(&key).is_some_and(|r| !r.is_empty()) {
                return CommandOutput::failed(NOT_EMPTY);
            }
            if referenced(state, family, table, &chain) {
                return CommandOutput::failed(IN_USE);
            }
            if let Some(chains) = state.chains.get_mut(&(family, table)) {
                chains.retain(|c| c != &chain);
            }
            CommandOutput::ok("")
        }
        "-C" | "-D" | "-A" | "-I" => {
            if !exists {
                return CommandOutput::failed(NO_CHAIN);
            }
            let body = if op == "-I" && rest.first().is_some_and(|p| p.parse::<usize>().is_ok()) {
                &rest[1..]
            } else {
                rest
            };
            let spec = canonical(family, body);
            if let Some(target) = jump_target(&spec) {
                let known = BUILTIN_TARGETS.contains(&target)
                    || state
                        .chains
                        .get(&(family, table))
                        .is_some_and(|c| c.iter().any(|n| n == target));
                if !known {
                    return CommandOutput::failed(format!(
                        "iptables v1.8.7 (legacy): Couldn't load target `{target}':No such file or directory\n"
                    ));
                }
            }
            let rules = state.rules.entry(key).or_default();
            let position = rules.iter().position(|r| *r == spec);
            match (op, position) {
                ("-C", Some(_)) => CommandOutput::ok(""),
                ("-C" | "-D", None) => CommandOutput::failed(BAD_RULE),
                ("-D", Some(i)) => {
                    rules.remove(i);
                    CommandOutput::ok("")
                }
                ("-A", _) => {
                    rules.push(spec);
                    CommandOutput::ok("")
                }
                _ => {
                    rules.insert(0, spec);
                    CommandOutput::ok("")
                }
            }
        }
        _ => CommandOutput::failed(format!("fake iptables: unsupported op {op}")),
    }
}

fn jump_target(spec: &[String]) -> Option<&str> {
    spec.iter()
        .position(|t| t == "-j")
        .and_then(|i| spec.get(i + 1))
        .map(String::as_str)
}

fn referenced(state: &State, family: Family, table: Table, chain: &str) -> bool {
    state
        .rules
        .iter()
        .filter(|((f, t, _), _)| *f == family && *t == table)
        .flat_map(|(_, rules)| rules.iter())
        .any(|r| jump_target(r) == Some(chain))
}

/// Normalizes tokens the way the kernel stores them: addresses get their
/// network prefix, quotes are gone.
fn canonical(family: Family, tokens: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        let token = token.trim_matches('"').to_string();
        let is_addr_flag = token == "-s" || token == "-d";
        out.push(token);
        if is_addr_flag {
            if let Some(value) = iter.next() {
                out.push(normalize_addr(family, value));
            }
        }
    }
    out
}

fn normalize_addr(family: Family, value: &str) -> String {
    let value = value.trim_matches('"');
    match value.parse::<IpNetwork>() {
        Ok(net) if value.contains('/') => format!("{}/{}", net.network(), net.prefix()),
        Ok(net) => format!("{}/{}", net.ip(), family.host_prefix()),
        Err(_) => value.to_string(),
    }
}

fn render(chain: &str, spec: &[String]) -> String {
    let mut out = format!("-A {chain}");
    let mut quote_next = false;
    for token in spec {
        out.push(' ');
        if quote_next {
            out.push('"');
            out.push_str(token);
            out.push('"');
        } else {
            out.push_str(token);
        }
        quote_next = token == "--comment";
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(Family::V4, "10.0.0.5"), "10.0.0.5/32");
        assert_eq!(normalize_addr(Family::V4, "10.244.1.7/24"), "10.244.1.0/24");
        assert_eq!(normalize_addr(Family::V6, "fd00::5"), "fd00::5/128");
    }

    #[test]
    fn test_render_quotes_comment() {
        let spec: Vec<String> = ["-m", "comment", "--comment", "a/b", "-j", "DROP"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            render("X", &spec),
            r#"-A X -m comment --comment "a/b" -j DROP"#
        );
    }
}
