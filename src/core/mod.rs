//! Rule/chain reconciliation engine
//!
//! Everything that talks to the packet-filter tools lives here:
//!
//! - [`runner`]: process boundary ([`CommandRunner`](runner::CommandRunner))
//! - [`iptables`]: families, tables, chains and the lock-holding facade
//! - [`chain`]: idempotent chain lifecycle
//! - [`rule`]: structured rules and idempotent rule lifecycle
//! - [`codec`]: parsing of save-style dump lines
//! - [`error`]: error types and diagnostic classification

pub mod chain;
pub mod codec;
pub mod error;
pub mod iptables;
pub mod rule;
pub mod runner;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
