//! Shared deterministic types for core logic.
//!
//! These types define stable contracts between components. They must not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// How a controlled subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitSummary {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// True when the orchestrator force-killed the session (hard timeout,
    /// terminate intervention, or cancellation).
    pub forced: bool,
}

impl ExitSummary {
    pub fn success(&self) -> bool {
        !self.forced && self.code == Some(0)
    }
}

/// One artifact observed in a workspace by the verification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEvidence {
    /// Workspace-relative path.
    pub path: String,
    pub bytes: u64,
    /// Lowercase hex sha-256 of the file contents.
    pub sha256: String,
}

/// Externally verifiable evidence for one finished task.
///
/// This is the *sole* input to the reward function. Nothing in it comes from
/// the controlled program's self-reported output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvidenceRecord {
    pub exit_code: Option<i32>,
    /// True when the session was force-killed rather than exiting on its own.
    pub crashed: bool,
    pub files_created: Vec<ArtifactEvidence>,
    pub files_modified: Vec<ArtifactEvidence>,
    pub checks_passed: u32,
    pub checks_failed: u32,
}

impl EvidenceRecord {
    pub fn artifact_count(&self) -> usize {
        self.files_created.len() + self.files_modified.len()
    }
}
