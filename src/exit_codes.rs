//! Stable exit codes for the `mdl` CLI.

/// Run completed successfully (or an informational mode like `--dry-run` finished).
pub const OK: i32 = 0;
/// User, document, or validation error before execution started.
pub const INVALID: i32 = 1;
/// At least one action failed at runtime.
pub const ACTION_FAILED: i32 = 2;
/// Run was cancelled (user interrupt or global timeout).
pub const CANCELLED: i32 = 130;
