//! Semantic invariants not expressible via serde types.

use std::collections::{HashMap, HashSet};

use crate::task::Task;

/// Check semantic invariants over a task snapshot:
/// - `depth(child) = depth(parent) + 1` and the parent exists
/// - a live session exists iff the task status allows one
/// - a workspace is owned by at most one active task
pub fn validate_invariants(tasks: &[Task], live_sessions: &HashSet<String>) -> Vec<String> {
    let mut errors = Vec::new();
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut workspace_owners: HashMap<&str, Vec<&str>> = HashMap::new();

    for task in tasks {
        if let Some(parent_id) = task.parent_id.as_deref() {
            match by_id.get(parent_id) {
                None => errors.push(format!("{}: missing parent '{}'", task.id, parent_id)),
                Some(parent) => {
                    if task.depth != parent.depth + 1 {
                        errors.push(format!(
                            "{}: depth {} != parent depth {} + 1",
                            task.id, task.depth, parent.depth
                        ));
                    }
                }
            }
        } else if task.depth != 0 {
            errors.push(format!("{}: root task with depth {}", task.id, task.depth));
        }

        let has_session = live_sessions.contains(&task.id);
        if has_session && !task.status.session_allowed() {
            errors.push(format!(
                "{}: live session but status {:?}",
                task.id, task.status
            ));
        }
        if !has_session && task.status.session_allowed() {
            errors.push(format!(
                "{}: status {:?} but no live session",
                task.id, task.status
            ));
        }

        if let Some(workspace) = task.workspace_ref.as_deref() {
            if task.status.session_allowed() {
                workspace_owners.entry(workspace).or_default().push(&task.id);
            }
        }
    }

    for (workspace, owners) in workspace_owners {
        if owners.len() > 1 {
            errors.push(format!(
                "workspace '{}' owned by multiple active tasks: {}",
                workspace,
                owners.join(", ")
            ));
        }
    }

    errors.sort();
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskStatus};

    fn task(id: &str, parent: Option<&str>, depth: u32, status: TaskStatus) -> Task {
        let mut t = Task::new(id.to_string(), parent.map(String::from), "goal".to_string(), depth, 0);
        t.status = status;
        t
    }

    #[test]
    fn clean_snapshot_has_no_errors() {
        let tasks = vec![
            task("t1", None, 0, TaskStatus::Running),
            task("t1.1", Some("t1"), 1, TaskStatus::Queued),
        ];
        let live: HashSet<String> = ["t1".to_string()].into();
        assert!(validate_invariants(&tasks, &live).is_empty());
    }

    #[test]
    fn wrong_depth_is_reported() {
        let tasks = vec![
            task("t1", None, 0, TaskStatus::Completed),
            task("t1.1", Some("t1"), 2, TaskStatus::Queued),
        ];
        let errors = validate_invariants(&tasks, &HashSet::new());
        assert!(errors.iter().any(|e| e.contains("depth")));
    }

    #[test]
    fn terminal_task_with_live_session_is_reported() {
        let tasks = vec![task("t1", None, 0, TaskStatus::Completed)];
        let live: HashSet<String> = ["t1".to_string()].into();
        let errors = validate_invariants(&tasks, &live);
        assert!(errors.iter().any(|e| e.contains("live session")));
    }

    #[test]
    fn shared_workspace_between_active_tasks_is_reported() {
        let mut a = task("t1", None, 0, TaskStatus::Running);
        let mut b = task("t2", None, 0, TaskStatus::Running);
        a.workspace_ref = Some("ws-1".to_string());
        b.workspace_ref = Some("ws-1".to_string());
        let live: HashSet<String> = ["t1".to_string(), "t2".to_string()].into();
        let errors = validate_invariants(&[a, b], &live);
        assert!(errors.iter().any(|e| e.contains("multiple active tasks")));
    }
}
