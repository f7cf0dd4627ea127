//! Test-only scripted collaborators and builders.
//!
//! Scripted runners and verifiers let orchestrator tests drive full task
//! lifecycles deterministically, without spawning real PTY processes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::core::types::{ArtifactEvidence, EvidenceRecord, ExitSummary};
use crate::errors::OverseerError;
use crate::io::config::{OverseerConfig, SessionConfig};
use crate::io::session::{
    SessionCommand, SessionPort, SessionRegistry, SessionReport, SessionRequest, SessionRunner,
    SessionState,
};
use crate::io::verify::{Verifier, VerifyRequest};

/// One canned session: chunks fed to the observer, then an exit.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    pub chunks: Vec<Vec<u8>>,
    pub exit: ExitSummary,
}

impl ScriptedSession {
    pub fn succeeding(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            exit: ExitSummary {
                code: Some(0),
                forced: false,
            },
        }
    }

    pub fn exiting(code: i32) -> Self {
        Self {
            chunks: Vec::new(),
            exit: ExitSummary {
                code: Some(code),
                forced: false,
            },
        }
    }
}

/// Port used by the scripted runner so `send`/`interrupt` have a target.
#[derive(Default)]
pub struct RecordingPort {
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub interrupts: Mutex<u32>,
    output: Mutex<Vec<u8>>,
}

impl RecordingPort {
    fn feed(&self, chunk: &[u8]) {
        self.output
            .lock()
            .expect("recording port lock poisoned")
            .extend_from_slice(chunk);
    }
}

impl SessionPort for RecordingPort {
    fn write(&self, bytes: &[u8]) -> Result<(), OverseerError> {
        self.writes
            .lock()
            .expect("recording port lock poisoned")
            .push(bytes.to_vec());
        Ok(())
    }

    fn interrupt(&self) -> Result<(), OverseerError> {
        *self
            .interrupts
            .lock()
            .expect("recording port lock poisoned") += 1;
        Ok(())
    }

    fn terminate(&self) {}

    fn shutdown(&self, _grace: Duration) {}

    fn output_tail(&self, n: usize) -> Vec<u8> {
        let output = self.output.lock().expect("recording port lock poisoned");
        let skip = output.len().saturating_sub(n);
        output[skip..].to_vec()
    }

    fn state(&self) -> SessionState {
        SessionState::Active
    }
}

/// Runner that replays scripted sessions in submission order.
pub struct ScriptedSessionRunner {
    script: Mutex<VecDeque<ScriptedSession>>,
    /// Commands the observer asked to apply, per task.
    pub commands: Mutex<Vec<(String, SessionCommand)>>,
    /// Ports by task id, so tests can inspect writes after the fact.
    pub ports: Mutex<Vec<(String, Arc<RecordingPort>)>>,
}

impl ScriptedSessionRunner {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            script: Mutex::new(sessions.into()),
            commands: Mutex::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
        }
    }

    pub fn commands_for(&self, task_id: &str) -> Vec<SessionCommand> {
        self.commands
            .lock()
            .expect("scripted runner lock poisoned")
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }
}

impl SessionRunner for ScriptedSessionRunner {
    fn run(
        &self,
        request: &SessionRequest,
        _config: &SessionConfig,
        registry: &SessionRegistry,
        observer: crate::io::session::ChunkObserver<'_>,
    ) -> Result<SessionReport> {
        let session = self
            .script
            .lock()
            .expect("scripted runner lock poisoned")
            .pop_front()
            .unwrap_or_else(|| ScriptedSession::succeeding(&[]));

        let port = Arc::new(RecordingPort::default());
        registry.register(&request.task_id, port.clone());
        self.ports
            .lock()
            .expect("scripted runner lock poisoned")
            .push((request.task_id.clone(), port.clone()));

        let mut tail = Vec::new();
        for chunk in &session.chunks {
            port.feed(chunk);
            tail.extend_from_slice(chunk);
            for command in observer(chunk) {
                self.commands
                    .lock()
                    .expect("scripted runner lock poisoned")
                    .push((request.task_id.clone(), command));
            }
        }

        registry.deregister(&request.task_id);
        Ok(SessionReport {
            exit: session.exit,
            output_tail: tail,
            truncated: 0,
        })
    }
}

/// Scripted verdicts for the verification collaborator.
#[derive(Debug, Clone)]
pub enum ScriptedVerdict {
    Evidence(EvidenceRecord),
    Unavailable,
}

/// Verifier replaying scripted verdicts; when the script runs dry it derives
/// evidence from the exit summary (zero exit yields one synthetic artifact).
pub struct ScriptedVerifier {
    script: Mutex<VecDeque<ScriptedVerdict>>,
}

impl ScriptedVerifier {
    pub fn new(verdicts: Vec<ScriptedVerdict>) -> Self {
        Self {
            script: Mutex::new(verdicts.into()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<EvidenceRecord> {
        let verdict = self
            .script
            .lock()
            .expect("scripted verifier lock poisoned")
            .pop_front();
        match verdict {
            Some(ScriptedVerdict::Evidence(evidence)) => Ok(evidence),
            Some(ScriptedVerdict::Unavailable) => {
                Err(anyhow::anyhow!("scripted verification outage"))
            }
            None => Ok(derived_evidence(&request.exit)),
        }
    }
}

fn derived_evidence(exit: &ExitSummary) -> EvidenceRecord {
    let files_created = if exit.success() {
        vec![artifact("artifact.txt")]
    } else {
        Vec::new()
    };
    EvidenceRecord {
        exit_code: exit.code,
        crashed: exit.forced,
        files_created,
        files_modified: Vec::new(),
        checks_passed: 0,
        checks_failed: 0,
    }
}

/// Deterministic artifact evidence for assertions.
pub fn artifact(path: &str) -> ArtifactEvidence {
    ArtifactEvidence {
        path: path.to_string(),
        bytes: 42,
        sha256: "ab".repeat(32),
    }
}

/// Evidence record for a clean exit with the given artifacts and checks.
pub fn evidence(created: &[&str], checks_passed: u32, checks_failed: u32) -> EvidenceRecord {
    EvidenceRecord {
        exit_code: Some(0),
        crashed: false,
        files_created: created.iter().map(|p| artifact(p)).collect(),
        files_modified: Vec::new(),
        checks_passed,
        checks_failed,
    }
}

/// An isolated project directory seeded with one file, kept alive for the
/// duration of a test.
pub struct TestProject {
    _temp: tempfile::TempDir,
    pub root: std::path::PathBuf,
}

pub fn temp_project() -> TestProject {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("project");
    std::fs::create_dir_all(&root).expect("create project dir");
    std::fs::write(root.join("README.md"), "seed\n").expect("seed file");
    TestProject { _temp: temp, root }
}

/// Config tuned for fast, isolated orchestrator tests.
pub fn test_config() -> OverseerConfig {
    let mut config = OverseerConfig::default();
    config.session.command = vec!["scripted".to_string()];
    config.session.hard_timeout_secs = 30;
    config.session.idle_timeout_secs = 0;
    config.session.heartbeat_secs = 0;
    config
}
