//! Process boundary for the packet-filter tools
//!
//! Every kernel read or mutation nodewall performs goes through a
//! [`CommandRunner`]. Production uses [`SystemRunner`], which spawns the real
//! `iptables` / `ip6tables` / `*-save` binaries; tests inject an in-memory
//! emulation instead.
//!
//! The runner does no locking and no retrying. Serialization lives in
//! [`Iptables`](crate::core::iptables::Iptables) and retry policy lives in the
//! reconciler runtime.
//!
//! # Environment Variables
//!
//! - `NODEWALL_IPTABLES`, `NODEWALL_IP6TABLES`: override the rule tool per family
//! - `NODEWALL_IPTABLES_SAVE`, `NODEWALL_IP6TABLES_SAVE`: override the dump tool per family

use crate::core::error::Result;
use crate::core::iptables::Family;
use std::future::Future;
use std::process::Stdio;
use tracing::debug;

/// Which of the two per-family binaries to invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// `iptables` / `ip6tables`
    Rules,
    /// `iptables-save` / `ip6tables-save`
    Save,
}

/// One fully-formed tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub family: Family,
    pub tool: Tool,
    pub args: Vec<String>,
}

impl Invocation {
    /// Resolved program name, honoring the per-family override variables.
    pub fn program(&self) -> String {
        match self.tool {
            Tool::Rules => self.family.binary(),
            Tool::Save => self.family.save_binary(),
        }
    }

    /// Arguments joined for diagnostics.
    pub fn display_args(&self) -> String {
        self.args.join(" ")
    }
}

/// Raw result of one process execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Successful output carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed output carrying `stderr` and exit status 1.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(1),
        }
    }
}

/// Executes packet-filter tool invocations.
///
/// Implementations spawn exactly one process (or its emulation) per call and
/// report the outcome verbatim. A non-zero exit is an `Ok` output with
/// `success == false`; `Err` is reserved for failing to run at all.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs one invocation to completion.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the process cannot be spawned or its output cannot be
    /// collected.
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs the real binaries found on `PATH` (or named by the override variables)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let program = invocation.program();
        debug!(program = %program, args = %invocation.display_args(), "exec");

        // Not killed on drop: an in-flight mutation always runs to completion.
        let output = tokio::process::Command::new(&program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_program_defaults_per_family() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        // SAFETY: env access serialized by ENV_VAR_MUTEX
        unsafe {
            std::env::remove_var("NODEWALL_IPTABLES");
            std::env::remove_var("NODEWALL_IP6TABLES_SAVE");
        }

        let v4 = Invocation {
            family: Family::V4,
            tool: Tool::Rules,
            args: vec![],
        };
        let v6_save = Invocation {
            family: Family::V6,
            tool: Tool::Save,
            args: vec![],
        };
        assert_eq!(v4.program(), "iptables");
        assert_eq!(v6_save.program(), "ip6tables-save");
    }

    #[test]
    fn test_program_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        // SAFETY: env access serialized by ENV_VAR_MUTEX
        unsafe {
            std::env::set_var("NODEWALL_IP6TABLES", "/usr/sbin/ip6tables-legacy");
        }

        let inv = Invocation {
            family: Family::V6,
            tool: Tool::Rules,
            args: vec!["-nL".to_string()],
        };
        assert_eq!(inv.program(), "/usr/sbin/ip6tables-legacy");

        // SAFETY: env access serialized by ENV_VAR_MUTEX
        unsafe {
            std::env::remove_var("NODEWALL_IP6TABLES");
        }
    }

    #[test]
    fn test_command_output_constructors() {
        let ok = CommandOutput::ok("*nat\n");
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));

        let failed = CommandOutput::failed("iptables: Chain already exists.");
        assert!(!failed.success);
        assert!(failed.stdout.is_empty());
    }
}
