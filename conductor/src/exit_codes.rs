//! Stable exit codes for the `conductor` admin CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid arguments, config, or state database errors.
pub const INVALID: i32 = 1;
/// The requested execution (or the current running one) does not exist.
pub const NOT_FOUND: i32 = 2;
