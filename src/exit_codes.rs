//! Stable exit codes for the `cursorflow` CLI (§6).

/// Every lane in the run completed.
pub const OK: i32 = 0;
/// At least one lane failed, or an unexpected error occurred.
pub const FAILED: i32 = 1;
/// One or more lanes are paused on a dependency request.
pub const PAUSED: i32 = 2;
/// The run was cancelled by the user (Ctrl-C).
pub const CANCELLED: i32 = 130;
