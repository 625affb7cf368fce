//! Stable exit codes for rdk commands.

/// Command succeeded; every touched unit is in a good terminal state.
pub const OK: i32 = 0;
/// A command, remote call, unit, or rule test failed.
pub const FAILED: i32 = 1;
/// Configuration or rule definitions are invalid.
pub const INVALID: i32 = 2;
