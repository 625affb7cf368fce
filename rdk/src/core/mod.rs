//! Deterministic, pure logic shared by the deploy engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod allow_list;
pub mod lifecycle;
pub mod output;
pub mod planner;
pub mod poll;
pub mod status;
pub mod types;
