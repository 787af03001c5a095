//! Stable exit codes for relay CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, configuration or state, or any other error.
pub const INVALID: i32 = 1;
/// The named task or plan does not exist.
pub const NOT_FOUND: i32 = 2;
/// The task is owned elsewhere or not in a status that allows the operation.
pub const CONFLICT: i32 = 3;
