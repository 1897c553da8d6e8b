//! Stable exit codes for `oh-llm` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Internal or unexpected error.
pub const INTERNAL: i32 = 1;
/// A stage failed, validation failed, autofix refused, or the request named a
/// run/profile/checkout that cannot be used.
pub const RUN_FAILED: i32 = 2;
