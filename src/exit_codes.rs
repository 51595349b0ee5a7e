//! Stable exit codes for recast CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid invocation, missing repo, or bad configuration.
pub const USER_ERROR: i32 = 2;
/// Baseline verification failed before any batch executed.
pub const BASELINE_FAILED: i32 = 3;
/// A batch failed after exhausting its retries.
pub const BATCH_FAILED: i32 = 4;
/// Agent binary missing or not authenticated.
pub const AGENT_UNAVAILABLE: i32 = 5;
/// Run cancelled by the user.
pub const CANCELLED: i32 = 130;
