//! Side-effecting adapters: child processes, remote API, filesystem.

pub mod cdk;
pub mod config;
pub mod ledger;
pub mod policy_test;
pub mod process;
pub mod rules;
pub mod stack_api;
