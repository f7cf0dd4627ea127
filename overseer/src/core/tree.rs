//! Task tree state owned by the orchestrator under single-writer discipline.
//!
//! All task mutation goes through this type. Child creation is driven by
//! messages from the orchestrator (never recursion inside the tree), so depth
//! and width limits are enforceable in one place.

use std::collections::HashMap;

use crate::core::policy::{self, PolicyParams};
use crate::errors::OverseerError;
use crate::task::{Task, TaskStatus};

/// Hierarchical task store with selection statistics.
///
/// Ids are hierarchical strings: roots are `t1`, `t2`, ... and children
/// append a 1-based index (`t1.2`, `t1.2.1`), which keeps snapshots readable
/// and makes the parent linkage visible in logs.
#[derive(Debug, Default)]
pub struct TaskTree {
    tasks: HashMap<String, Task>,
    /// Insertion order, for stable snapshots.
    order: Vec<String>,
    next_root: u32,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new root task.
    pub fn insert_root(&mut self, prompt: &str, now_ms: i64) -> String {
        self.next_root += 1;
        let id = format!("t{}", self.next_root);
        let task = Task::new(id.clone(), None, prompt.to_string(), 0, now_ms);
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task);
        id
    }

    /// Insert a child under `parent_id`.
    ///
    /// Fails when the parent is unknown, archived (pruned branches spawn no
    /// further children), or already at `max_depth`.
    pub fn insert_child(
        &mut self,
        parent_id: &str,
        prompt: &str,
        max_depth: u32,
        now_ms: i64,
    ) -> Result<String, OverseerError> {
        let (depth, archived, child_count) = {
            let parent = self.require(parent_id)?;
            (parent.depth, parent.archived, self.child_ids(parent_id).len())
        };
        if archived {
            return Err(OverseerError::Tree(format!(
                "parent '{parent_id}' is pruned; no further children"
            )));
        }
        if depth + 1 > max_depth {
            return Err(OverseerError::Tree(format!(
                "child of '{parent_id}' would exceed max depth {max_depth}"
            )));
        }
        let id = format!("{parent_id}.{}", child_count + 1);
        let task = Task::new(
            id.clone(),
            Some(parent_id.to_string()),
            prompt.to_string(),
            depth + 1,
            now_ms,
        );
        self.order.push(id.clone());
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    fn require(&self, id: &str) -> Result<&Task, OverseerError> {
        self.tasks
            .get(id)
            .ok_or_else(|| OverseerError::UnknownTask(id.to_string()))
    }

    fn require_mut(&mut self, id: &str) -> Result<&mut Task, OverseerError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| OverseerError::UnknownTask(id.to_string()))
    }

    /// Ids of direct children in insertion order.
    pub fn child_ids(&self, parent_id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.tasks
                    .get(*id)
                    .and_then(|t| t.parent_id.as_deref())
                    .is_some_and(|p| p == parent_id)
            })
            .cloned()
            .collect()
    }

    /// Snapshot of one task or every task (id `"*"`), in insertion order.
    pub fn snapshot(&self, id: &str) -> Vec<Task> {
        if id == "*" {
            return self
                .order
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .cloned()
                .collect();
        }
        self.tasks.get(id).cloned().into_iter().collect()
    }

    pub fn set_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        now_ms: i64,
    ) -> Result<(), OverseerError> {
        let task = self.require_mut(id)?;
        task.status = status;
        task.updated_at_ms = now_ms;
        Ok(())
    }

    pub fn set_workspace_ref(&mut self, id: &str, name: Option<String>) -> Result<(), OverseerError> {
        self.require_mut(id)?.workspace_ref = name;
        Ok(())
    }

    pub fn set_session_ref(&mut self, id: &str, name: Option<String>) -> Result<(), OverseerError> {
        self.require_mut(id)?.session_ref = name;
        Ok(())
    }

    pub fn set_untried_actions(&mut self, id: &str, actions: Vec<String>) -> Result<(), OverseerError> {
        self.require_mut(id)?.untried_actions = actions;
        Ok(())
    }

    /// Pop the next untried decomposition action, if any.
    pub fn take_untried_action(&mut self, id: &str) -> Result<Option<String>, OverseerError> {
        let task = self.require_mut(id)?;
        if task.untried_actions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(task.untried_actions.remove(0)))
        }
    }

    /// Record a finished visit at `id` and backpropagate the reward to every
    /// ancestor with per-level decay, incrementing visits along the path.
    pub fn record_outcome(
        &mut self,
        id: &str,
        reward: f64,
        params: &PolicyParams,
        now_ms: i64,
    ) -> Result<(), OverseerError> {
        self.require(id)?;
        let mut distance = 0u32;
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            let task = self.require_mut(&current)?;
            task.visits += 1;
            task.total_reward += policy::decayed(reward, params.reward_decay, distance);
            task.updated_at_ms = now_ms;
            cursor = task.parent_id.clone();
            distance += 1;
        }
        Ok(())
    }

    /// Prune the branch rooted at `id`: archive every node and cancel the
    /// ones that never reached a terminal status. Archived tasks remain in
    /// the tree.
    pub fn prune(&mut self, id: &str, now_ms: i64) -> Result<Vec<String>, OverseerError> {
        self.require(id)?;
        let mut cancelled = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            stack.extend(self.child_ids(&current));
            let task = self.require_mut(&current)?;
            task.archived = true;
            if !task.status.is_terminal() {
                task.status = TaskStatus::Cancelled;
                task.updated_at_ms = now_ms;
                cancelled.push(current);
            }
        }
        cancelled.sort();
        Ok(cancelled)
    }

    /// Pick the child of `parent_id` with the highest upper-confidence score.
    ///
    /// Archived children are skipped. Unvisited children win outright
    /// (score `+inf`); ties break toward the earliest-inserted child.
    pub fn select_child(&self, parent_id: &str, params: &PolicyParams) -> Option<String> {
        let parent = self.tasks.get(parent_id)?;
        let mut best: Option<(f64, String)> = None;
        for child_id in self.child_ids(parent_id) {
            let child = self.tasks.get(&child_id)?;
            if child.archived {
                continue;
            }
            let score = policy::ucb_score(
                child.visits,
                child.average_reward(),
                parent.visits,
                params.exploration_constant,
            );
            let better = match &best {
                None => true,
                Some((best_score, _)) => score > *best_score,
            };
            if better {
                best = Some((score, child_id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// True when a branch is terminal for the policy: reward reached the
    /// quality threshold, the node is archived, or its status is terminal.
    pub fn is_terminal_for_policy(&self, id: &str, params: &PolicyParams) -> bool {
        match self.tasks.get(id) {
            None => true,
            Some(task) => {
                task.archived
                    || task.status.is_terminal()
                    || task.average_reward() >= params.quality_threshold
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
