//! Stable exit codes for svcgen CLI commands.

/// Command succeeded; for `generate`, the artifact was packaged.
pub const OK: i32 = 0;
/// Bad usage, invalid config, non-empty destination, or a packaging failure.
pub const INVALID: i32 = 1;
/// No passing artifact within the attempt budget, or `run --test` failed.
pub const EXHAUSTED: i32 = 2;
/// Session aborted by a permanent oracle error, malformed response or sandbox failure.
pub const ABORTED: i32 = 3;
/// Interrupted by Ctrl-C.
pub const INTERRUPTED: i32 = 130;
