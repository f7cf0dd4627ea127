//! Workspace isolation for concurrently active tasks.
//!
//! Each active task gets an isolated filesystem view so parallel sessions
//! cannot corrupt shared state. Two modes: an ephemeral directory copy
//! (merged back by changed-file comparison against a manifest taken at
//! allocation) and a branch-per-task worktree sharing one git history.
//!
//! Lifecycle: `allocate -> finalize -> merge -> reclaim` (or
//! `finalize(failure) -> reclaim`). Reclaiming out of order is a hard
//! invariant violation, not a warning.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::errors::OverseerError;
use crate::io::git::{Git, MergeAttempt};

/// How a task's filesystem view is isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Plain directory copy; merged by changed-file comparison.
    EphemeralCopy,
    /// Branch-per-task worktree sharing one git history.
    BranchWorktree,
}

/// Merge progress of a finalized workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    /// Branch mode: committed on its branch, merge not yet attempted.
    Pending,
    /// Ephemeral mode: changed set captured, merge not yet attempted.
    Committed,
    Merged,
    Discarded,
}

/// Outcome reported to `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// Content manifest: workspace-relative path -> sha-256 hex digest.
pub type Manifest = BTreeMap<String, String>;

/// An isolated filesystem view owned by exactly one active task.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub task_id: String,
    /// Directory name (task id, timestamp, random suffix).
    pub name: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub mode: IsolationMode,
    /// `None` until `finalize` runs.
    pub merge_state: Option<MergeState>,
    /// Baseline content at allocation; drives ephemeral merges and evidence.
    pub baseline: Manifest,
    /// Ephemeral mode: changed files captured at finalize.
    changed: Vec<String>,
}

impl WorkspaceHandle {
    pub fn finalized(&self) -> bool {
        self.merge_state.is_some()
    }

    /// Files this workspace changed relative to its baseline (available after
    /// `finalize`; branch mode reads them from git at merge time instead).
    pub fn changed_files(&self) -> &[String] {
        &self.changed
    }
}

/// Allocates, finalizes, merges, and reclaims workspaces.
///
/// Ownership is exclusive: allocation for a task that already holds an
/// active workspace is rejected, and every path is owned by at most one
/// active task.
#[derive(Debug)]
pub struct WorkspaceManager {
    /// The directory tasks are working on (merge target).
    source_root: PathBuf,
    /// State directory holding copies/worktrees (`.overseer`).
    state_dir: PathBuf,
    mode: IsolationMode,
    active: HashMap<String, PathBuf>,
}

impl WorkspaceManager {
    pub fn new(source_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>, mode: IsolationMode) -> Self {
        Self {
            source_root: source_root.into(),
            state_dir: state_dir.into(),
            mode,
            active: HashMap::new(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Allocate a fresh workspace for `task_id`.
    #[instrument(skip_all, fields(task_id))]
    pub fn allocate(&mut self, task_id: &str) -> Result<WorkspaceHandle> {
        if self.active.contains_key(task_id) {
            return Err(OverseerError::WorkspaceConflict(format!(
                "task '{task_id}' already owns an active workspace"
            ))
            .into());
        }
        let name = build_workspace_name(task_id, &generate_timestamp(), &generate_short_id());
        let handle = match self.mode {
            IsolationMode::EphemeralCopy => self.allocate_copy(task_id, &name)?,
            IsolationMode::BranchWorktree => self.allocate_worktree(task_id, &name)?,
        };
        debug!(task_id, name = %handle.name, "workspace allocated");
        self.active.insert(task_id.to_string(), handle.path.clone());
        Ok(handle)
    }

    fn allocate_copy(&self, task_id: &str, name: &str) -> Result<WorkspaceHandle> {
        let dest = self.state_dir.join("workspaces").join(name);
        fs::create_dir_all(&dest)
            .with_context(|| format!("create workspace {}", dest.display()))?;
        copy_tree(&self.source_root, &dest)?;
        let baseline = snapshot_manifest(&dest)?;
        Ok(WorkspaceHandle {
            task_id: task_id.to_string(),
            name: name.to_string(),
            path: dest,
            branch: None,
            mode: IsolationMode::EphemeralCopy,
            merge_state: None,
            baseline,
            changed: Vec::new(),
        })
    }

    fn allocate_worktree(&self, task_id: &str, name: &str) -> Result<WorkspaceHandle> {
        let git = Git::new(&self.source_root);
        if !git.is_repo() {
            return Err(OverseerError::WorkspaceConflict(format!(
                "branch_worktree mode requires a git repository at {}",
                self.source_root.display()
            ))
            .into());
        }
        let branch = format!("overseer/{task_id}");
        if git.branch_exists(&branch)? {
            return Err(OverseerError::WorkspaceConflict(format!(
                "branch '{branch}' already exists"
            ))
            .into());
        }
        let dest = self.state_dir.join("worktrees").join(name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create worktree dir {}", parent.display()))?;
        }
        git.worktree_add(&dest, &branch)?;
        let baseline = snapshot_manifest(&dest)?;
        Ok(WorkspaceHandle {
            task_id: task_id.to_string(),
            name: name.to_string(),
            path: dest,
            branch: Some(branch),
            mode: IsolationMode::BranchWorktree,
            merge_state: None,
            baseline,
            changed: Vec::new(),
        })
    }

    /// Finalize a workspace once its task finished.
    ///
    /// Success in branch mode stages and commits on the task branch
    /// (`merge_state = pending`); in ephemeral mode the changed set is
    /// captured (`committed`). Failure discards.
    #[instrument(skip_all, fields(task_id = %handle.task_id))]
    pub fn finalize(&mut self, handle: &mut WorkspaceHandle, outcome: TaskOutcome) -> Result<()> {
        if handle.finalized() {
            return Err(OverseerError::WorkspaceConflict(format!(
                "workspace '{}' already finalized",
                handle.name
            ))
            .into());
        }
        if outcome == TaskOutcome::Failure {
            handle.merge_state = Some(MergeState::Discarded);
            return Ok(());
        }
        match handle.mode {
            IsolationMode::BranchWorktree => {
                let git = Git::new(&handle.path);
                git.add_all()?;
                git.commit_staged(&format!("overseer: finalize {}", handle.task_id))?;
                handle.merge_state = Some(MergeState::Pending);
            }
            IsolationMode::EphemeralCopy => {
                let current = snapshot_manifest(&handle.path)?;
                handle.changed = diff_manifests(&handle.baseline, &current);
                handle.merge_state = Some(MergeState::Committed);
            }
        }
        Ok(())
    }

    /// Merge a finalized workspace back into the source root.
    ///
    /// Orthogonal edit sets apply automatically; an overlapping edit surfaces
    /// as [`OverseerError::MergeConflict`] and leaves both sides untouched
    /// for explicit resolution.
    #[instrument(skip_all, fields(task_id = %handle.task_id))]
    pub fn merge(&mut self, handle: &mut WorkspaceHandle) -> Result<Vec<String>> {
        match handle.merge_state {
            Some(MergeState::Pending) | Some(MergeState::Committed) => {}
            Some(MergeState::Merged) => return Ok(handle.changed.clone()),
            Some(MergeState::Discarded) => {
                return Err(OverseerError::WorkspaceConflict(format!(
                    "workspace '{}' was discarded",
                    handle.name
                ))
                .into());
            }
            None => {
                return Err(OverseerError::WorkspaceConflict(format!(
                    "workspace '{}' merged before finalize",
                    handle.name
                ))
                .into());
            }
        }
        let merged = match handle.mode {
            IsolationMode::BranchWorktree => self.merge_branch(handle)?,
            IsolationMode::EphemeralCopy => self.merge_copy(handle)?,
        };
        handle.merge_state = Some(MergeState::Merged);
        handle.changed = merged.clone();
        Ok(merged)
    }

    fn merge_branch(&self, handle: &WorkspaceHandle) -> Result<Vec<String>> {
        let git = Git::new(&self.source_root);
        let branch = handle
            .branch
            .as_deref()
            .ok_or_else(|| OverseerError::WorkspaceConflict("worktree handle missing branch".to_string()))?;
        let changed = git.changed_files_on_branch(branch)?;
        match git.merge_branch(branch, &format!("overseer: merge {}", handle.task_id))? {
            MergeAttempt::Merged => Ok(changed),
            MergeAttempt::Conflict { paths } => {
                let path = paths.into_iter().next().unwrap_or_default();
                Err(OverseerError::MergeConflict { path }.into())
            }
        }
    }

    fn merge_copy(&self, handle: &WorkspaceHandle) -> Result<Vec<String>> {
        // Conflict check first so a failed merge changes nothing.
        for rel in &handle.changed {
            let source_path = self.source_root.join(rel);
            let source_digest = if source_path.exists() {
                Some(file_digest(&source_path)?)
            } else {
                None
            };
            let baseline_digest = handle.baseline.get(rel);
            if source_digest.as_ref() != baseline_digest {
                return Err(OverseerError::MergeConflict { path: rel.clone() }.into());
            }
        }
        for rel in &handle.changed {
            let from = handle.path.join(rel);
            let to = self.source_root.join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::copy(&from, &to)
                .with_context(|| format!("merge {} into {}", from.display(), to.display()))?;
        }
        Ok(handle.changed.clone())
    }

    /// Discard a finalized-or-not workspace so it can be reclaimed.
    pub fn discard(&mut self, handle: &mut WorkspaceHandle) {
        handle.merge_state = Some(MergeState::Discarded);
    }

    /// Reclaim the workspace's disk space and release ownership.
    ///
    /// Only valid after the merge question is settled: a handle still in
    /// `pending`/`committed` (or never finalized) is a hard conflict.
    #[instrument(skip_all, fields(task_id = %handle.task_id))]
    pub fn reclaim(&mut self, handle: &WorkspaceHandle) -> Result<()> {
        match handle.merge_state {
            Some(MergeState::Merged) | Some(MergeState::Discarded) => {}
            _ => {
                return Err(OverseerError::WorkspaceConflict(format!(
                    "reclaim of workspace '{}' before finalize/merge",
                    handle.name
                ))
                .into());
            }
        }
        match handle.mode {
            IsolationMode::EphemeralCopy => {
                if handle.path.exists() {
                    fs::remove_dir_all(&handle.path)
                        .with_context(|| format!("remove workspace {}", handle.path.display()))?;
                }
            }
            IsolationMode::BranchWorktree => {
                let git = Git::new(&self.source_root);
                if let Err(err) = git.worktree_remove(&handle.path) {
                    warn!(error = %err, "worktree remove failed; leaving on disk");
                }
            }
        }
        self.active.remove(&handle.task_id);
        Ok(())
    }
}

fn build_workspace_name(task_id: &str, timestamp: &str, short_id: &str) -> String {
    format!("{task_id}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Directories never copied or hashed: VCS internals and overseer state.
const SKIP_DIRS: &[&str] = &[".git", ".overseer"];

fn should_skip(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from).with_context(|| format!("read dir {}", from.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", from.display()))?;
        let name = entry.file_name();
        if should_skip(&name.to_string_lossy()) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        let file_type = entry.file_type().context("entry file type")?;
        if file_type.is_dir() {
            fs::create_dir_all(&dst).with_context(|| format!("create {}", dst.display()))?;
            copy_tree(&src, &dst)?;
        } else if file_type.is_file() {
            fs::copy(&src, &dst)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
        }
        // Symlinks are skipped: a link escaping the workspace would break isolation.
    }
    Ok(())
}

/// Hash every file under `root` (skipping state dirs) into a manifest.
pub fn snapshot_manifest(root: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    walk_manifest(root, root, &mut manifest)?;
    Ok(manifest)
}

fn walk_manifest(root: &Path, dir: &Path, manifest: &mut Manifest) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        if should_skip(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().context("entry file type")?;
        if file_type.is_dir() {
            walk_manifest(root, &path, manifest)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .context("strip workspace prefix")?
                .to_string_lossy()
                .to_string();
            manifest.insert(rel, file_digest(&path)?);
        }
    }
    Ok(())
}

/// Lowercase hex sha-256 of one file.
pub fn file_digest(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

/// Paths created or modified in `current` relative to `baseline`, sorted.
pub fn diff_manifests(baseline: &Manifest, current: &Manifest) -> Vec<String> {
    current
        .iter()
        .filter(|(path, digest)| baseline.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(temp: &Path) -> WorkspaceManager {
        WorkspaceManager::new(
            temp.join("project"),
            temp.join("project").join(".overseer"),
            IsolationMode::EphemeralCopy,
        )
    }

    fn setup_project(temp: &Path) {
        fs::create_dir_all(temp.join("project")).expect("mkdir");
        fs::write(temp.join("project").join("base.txt"), "base\n").expect("write");
    }

    fn is_workspace_conflict(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<OverseerError>(),
            Some(OverseerError::WorkspaceConflict(_))
        )
    }

    #[test]
    fn allocate_is_exclusive_per_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let mut manager = manager(temp.path());
        let _first = manager.allocate("t1").expect("allocate");
        let err = manager.allocate("t1").unwrap_err();
        assert!(is_workspace_conflict(&err));
    }

    #[test]
    fn reclaim_without_finalize_is_a_hard_conflict() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let mut manager = manager(temp.path());
        let handle = manager.allocate("t1").expect("allocate");
        let err = manager.reclaim(&handle).unwrap_err();
        assert!(is_workspace_conflict(&err));
    }

    #[test]
    fn reclaim_while_merge_pending_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let mut manager = manager(temp.path());
        let mut handle = manager.allocate("t1").expect("allocate");
        fs::write(handle.path.join("new.txt"), "x\n").expect("write");
        manager.finalize(&mut handle, TaskOutcome::Success).expect("finalize");
        let err = manager.reclaim(&handle).unwrap_err();
        assert!(is_workspace_conflict(&err));
    }

    #[test]
    fn disjoint_edits_merge_into_union() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let mut manager = manager(temp.path());

        let mut a = manager.allocate("t1.1").expect("allocate a");
        let mut b = manager.allocate("t1.2").expect("allocate b");
        fs::write(a.path.join("alpha.txt"), "a\n").expect("write");
        fs::write(b.path.join("beta.txt"), "b\n").expect("write");

        manager.finalize(&mut a, TaskOutcome::Success).expect("finalize a");
        manager.finalize(&mut b, TaskOutcome::Success).expect("finalize b");
        manager.merge(&mut a).expect("merge a");
        manager.merge(&mut b).expect("merge b");

        let root = temp.path().join("project");
        assert!(root.join("alpha.txt").exists());
        assert!(root.join("beta.txt").exists());

        manager.reclaim(&a).expect("reclaim a");
        manager.reclaim(&b).expect("reclaim b");
        assert!(!a.path.exists());
    }

    #[test]
    fn overlapping_edits_surface_merge_conflict() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let mut manager = manager(temp.path());

        let mut a = manager.allocate("t1.1").expect("allocate a");
        let mut b = manager.allocate("t1.2").expect("allocate b");
        fs::write(a.path.join("shared.txt"), "from a\n").expect("write");
        fs::write(b.path.join("shared.txt"), "from b\n").expect("write");

        manager.finalize(&mut a, TaskOutcome::Success).expect("finalize a");
        manager.finalize(&mut b, TaskOutcome::Success).expect("finalize b");
        manager.merge(&mut a).expect("merge a");

        let err = manager.merge(&mut b).unwrap_err();
        match err.downcast_ref::<OverseerError>() {
            Some(OverseerError::MergeConflict { path }) => assert_eq!(path, "shared.txt"),
            other => panic!("expected merge conflict, got {other:?}"),
        }
        // Nothing was overwritten.
        let merged = fs::read_to_string(temp.path().join("project").join("shared.txt")).expect("read");
        assert_eq!(merged, "from a\n");
    }

    #[test]
    fn failed_task_discards_and_reclaims() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let mut manager = manager(temp.path());
        let mut handle = manager.allocate("t1").expect("allocate");
        fs::write(handle.path.join("junk.txt"), "x\n").expect("write");
        manager.finalize(&mut handle, TaskOutcome::Failure).expect("finalize");
        manager.reclaim(&handle).expect("reclaim");
        assert!(!temp.path().join("project").join("junk.txt").exists());
    }

    #[test]
    fn manifest_diff_reports_created_and_modified() {
        let temp = tempfile::tempdir().expect("tempdir");
        setup_project(temp.path());
        let root = temp.path().join("project");
        let baseline = snapshot_manifest(&root).expect("baseline");
        fs::write(root.join("base.txt"), "changed\n").expect("write");
        fs::write(root.join("extra.txt"), "new\n").expect("write");
        let current = snapshot_manifest(&root).expect("current");
        assert_eq!(
            diff_manifests(&baseline, &current),
            vec!["base.txt".to_string(), "extra.txt".to_string()]
        );
    }
}
