//! Task records and request options.
//!
//! A task is one unit of requested work, possibly decomposed into children.
//! Statistics (`visits`, `total_reward`, `untried_actions`) drive the
//! selection policy in [`crate::core::policy`]. Tasks are mutated only through
//! [`crate::core::tree::TaskTree`] and are archived on pruning, never deleted.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Intervened,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// True once the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// True while a live session may exist for the task.
    pub fn session_allowed(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Intervened)
    }
}

/// How a submitted prompt is decomposed into child tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecompositionPattern {
    /// Single task, no children.
    #[default]
    None,
    /// Split into `fan_out` independent children, run concurrently.
    Decompose,
    /// Same as `decompose` but children share no ordering at all.
    Parallel,
    /// Children run one after another, each seeing the previous summary.
    Sequential,
    /// Children may decompose further until `max_depth`.
    Recursive,
}

/// Options accepted by `submit`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskOptions {
    pub decomposition_pattern: DecompositionPattern,
    pub fan_out: u32,
    pub max_depth: u32,
    pub live_notify: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            decomposition_pattern: DecompositionPattern::None,
            fan_out: 1,
            max_depth: 3,
            live_notify: false,
        }
    }
}

/// One unit of requested work tracked with search-style statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub prompt: String,
    pub status: TaskStatus,
    pub depth: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub visits: u32,
    pub total_reward: f64,
    /// Decomposition actions not yet expanded into children.
    pub untried_actions: Vec<String>,
    /// Name of the workspace currently or last owned by this task.
    pub workspace_ref: Option<String>,
    /// Id of the session currently or last bound to this task.
    pub session_ref: Option<String>,
    /// Set when the branch was pruned; archived tasks are kept, not deleted.
    pub archived: bool,
}

impl Task {
    pub fn new(id: String, parent_id: Option<String>, prompt: String, depth: u32, now_ms: i64) -> Self {
        Self {
            id,
            parent_id,
            prompt,
            status: TaskStatus::Queued,
            depth,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            visits: 0,
            total_reward: 0.0,
            untried_actions: Vec::new(),
            workspace_ref: None,
            session_ref: None,
            archived: false,
        }
    }

    /// Mean reward over all visits, 0.0 before the first visit.
    pub fn average_reward(&self) -> f64 {
        if self.visits == 0 {
            0.0
        } else {
            self.total_reward / f64::from(self.visits)
        }
    }
}
