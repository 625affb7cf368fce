//! Deploy and test driver for config-compliance rules.
//!
//! - **[`core`]**: Pure logic (allow-list, output cleaning, status
//!   classification, planning, lifecycle). No I/O.
//! - **[`io`]**: Child processes, the remote stack API, rule files, config and
//!   the pending ledger.
//!
//! [`deploy`], [`wait`] and [`rule_test`] combine the two to implement the CLI
//! commands.

pub mod core;
pub mod deploy;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod wait;
