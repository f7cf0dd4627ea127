//! Stable exit codes for overseer CLI commands.

/// Command succeeded and the submitted task completed.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/rules or other errors.
pub const INVALID: i32 = 1;
/// The submitted task reached a terminal `failed` or `cancelled` status.
pub const TASK_FAILED: i32 = 2;
/// The request was rejected by a validation hook.
pub const BLOCKED: i32 = 3;
