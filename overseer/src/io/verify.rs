//! Verification collaborator: turns a finished workspace into evidence.
//!
//! The [`Verifier`] trait decouples the orchestrator from evidence-gathering
//! mechanics. The default implementation diffs the workspace against the
//! manifest taken at allocation and runs configured check commands; tests use
//! scripted verifiers that return predetermined evidence.
//!
//! Everything here is observable from outside the session: file digests,
//! exit codes, check results. Session transcripts are deliberately not an
//! input.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::types::{ArtifactEvidence, EvidenceRecord, ExitSummary};
use crate::io::process::run_check;
use crate::io::workspace::{Manifest, file_digest, snapshot_manifest};

/// Parameters for one verification pass.
#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// The finished task's workspace.
    pub workspace: PathBuf,
    /// Manifest captured when the workspace was allocated.
    pub baseline: Manifest,
    /// How the session ended.
    pub exit: ExitSummary,
}

/// Abstraction over evidence gathering.
///
/// An `Err` means the collaborator was unreachable (not that verification
/// "failed"): the caller holds the task unverified and never marks it
/// completed.
pub trait Verifier: Send + Sync {
    fn verify(&self, request: &VerifyRequest) -> Result<EvidenceRecord>;
}

/// Default verifier: workspace manifest diff plus configured check commands.
pub struct WorkspaceVerifier {
    /// Check commands run inside the workspace; each counts pass or fail.
    pub checks: Vec<Vec<String>>,
    pub check_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Verifier for WorkspaceVerifier {
    #[instrument(skip_all, fields(workspace = %request.workspace.display()))]
    fn verify(&self, request: &VerifyRequest) -> Result<EvidenceRecord> {
        if !request.workspace.is_dir() {
            return Err(anyhow::anyhow!(
                "workspace {} is gone",
                request.workspace.display()
            ));
        }
        let current = snapshot_manifest(&request.workspace)?;
        let (files_created, files_modified) = collect_artifacts(request, &current)?;

        let mut checks_passed = 0u32;
        let mut checks_failed = 0u32;
        for check in &self.checks {
            let Some(program) = check.first() else {
                continue;
            };
            let mut cmd = Command::new(program);
            cmd.args(&check[1..]).current_dir(&request.workspace);
            let out = run_check(cmd, self.check_timeout, self.output_limit_bytes)
                .with_context(|| format!("run check {:?}", check))?;
            if out.passed() {
                checks_passed += 1;
            } else {
                checks_failed += 1;
            }
            debug!(check = ?check, passed = out.passed(), "check finished");
        }

        let record = EvidenceRecord {
            exit_code: request.exit.code,
            crashed: request.exit.forced,
            files_created,
            files_modified,
            checks_passed,
            checks_failed,
        };
        info!(
            created = record.files_created.len(),
            modified = record.files_modified.len(),
            checks_passed,
            checks_failed,
            "evidence collected"
        );
        Ok(record)
    }
}

fn collect_artifacts(
    request: &VerifyRequest,
    current: &Manifest,
) -> Result<(Vec<ArtifactEvidence>, Vec<ArtifactEvidence>)> {
    let mut created = Vec::new();
    let mut modified = Vec::new();
    for (path, digest) in current {
        match request.baseline.get(path) {
            Some(previous) if previous == digest => {}
            Some(_) => modified.push(artifact(request, path)?),
            None => created.push(artifact(request, path)?),
        }
    }
    Ok((created, modified))
}

fn artifact(request: &VerifyRequest, rel: &str) -> Result<ArtifactEvidence> {
    let path = request.workspace.join(rel);
    let meta = fs::metadata(&path).with_context(|| format!("stat {}", path.display()))?;
    Ok(ArtifactEvidence {
        path: rel.to_string(),
        bytes: meta.len(),
        sha256: file_digest(&path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(workspace: PathBuf, baseline: Manifest) -> VerifyRequest {
        VerifyRequest {
            workspace,
            baseline,
            exit: ExitSummary {
                code: Some(0),
                forced: false,
            },
        }
    }

    fn verifier(checks: Vec<Vec<String>>) -> WorkspaceVerifier {
        WorkspaceVerifier {
            checks,
            check_timeout: Duration::from_secs(10),
            output_limit_bytes: 64 * 1024,
        }
    }

    #[test]
    fn created_and_modified_files_become_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("old.txt"), "v1\n").expect("write");
        let baseline = snapshot_manifest(temp.path()).expect("baseline");

        fs::write(temp.path().join("old.txt"), "v2\n").expect("write");
        fs::write(temp.path().join("calc.py"), "print(2+2)\n").expect("write");

        let record = verifier(Vec::new())
            .verify(&request(temp.path().to_path_buf(), baseline))
            .expect("verify");
        assert_eq!(record.files_created.len(), 1);
        assert_eq!(record.files_created[0].path, "calc.py");
        assert_eq!(record.files_modified.len(), 1);
        assert_eq!(record.files_modified[0].path, "old.txt");
        assert_eq!(record.files_created[0].sha256.len(), 64);
    }

    #[test]
    fn checks_are_counted_pass_and_fail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let baseline = snapshot_manifest(temp.path()).expect("baseline");
        let checks = vec![
            vec!["true".to_string()],
            vec!["false".to_string()],
            vec!["true".to_string()],
        ];
        let record = verifier(checks)
            .verify(&request(temp.path().to_path_buf(), baseline))
            .expect("verify");
        assert_eq!(record.checks_passed, 2);
        assert_eq!(record.checks_failed, 1);
    }

    #[test]
    fn missing_workspace_is_unavailable_not_failed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gone = temp.path().join("nope");
        let result = verifier(Vec::new()).verify(&request(gone, Manifest::new()));
        assert!(result.is_err());
    }
}
