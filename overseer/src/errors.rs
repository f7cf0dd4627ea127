//! Fault taxonomy shared across the overseer runtime.
//!
//! Recoverable faults (rule handlers, hooks) are absorbed and logged at the
//! site that observes them; task-fatal faults propagate as a terminal task
//! status. Orchestration seams wrap these in `anyhow` context.

/// Errors that can occur across the overseer runtime.
#[derive(Debug, thiserror::Error)]
pub enum OverseerError {
    /// The controlled program failed to start. Fatal for the task, never
    /// auto-retried.
    #[error("failed to spawn session: {0}")]
    Spawn(String),

    /// An intervention rule handler faulted. Logged; scanning continues.
    #[error("intervention rule '{rule}' failed: {reason}")]
    Intervention { rule: String, reason: String },

    /// A hook handler faulted. Treated as `continue` with a logged warning.
    #[error("hook '{hook}' faulted: {reason}")]
    HookFault { hook: String, reason: String },

    /// A workspace operation violated exclusive ownership or lifecycle order.
    #[error("workspace conflict: {0}")]
    WorkspaceConflict(String),

    /// Two finalized workspaces touch the same artifact.
    #[error("merge conflict on '{path}'")]
    MergeConflict { path: String },

    /// The evidence collaborator was unreachable. The task is held
    /// unverified and is never marked completed.
    #[error("verification unavailable: {0}")]
    VerificationUnavailable(String),

    /// A request was rejected by a validation hook.
    #[error("request blocked by hook '{hook}': {reason}")]
    Blocked { hook: String, reason: String },

    /// A validation hook redirected the request before execution started.
    #[error("request redirected to '{target}' by hook '{hook}'")]
    Redirected { hook: String, target: String },

    /// The task exists but has no live session to talk to.
    #[error("no live session for task '{0}'")]
    SessionNotLive(String),

    /// The session write queue is full. The caller may retry later.
    #[error("session write queue full for task '{0}'")]
    Backpressure(String),

    /// No task with the given id exists.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// A tree mutation violated depth/width limits or pruning rules.
    #[error("task tree: {0}")]
    Tree(String),
}
