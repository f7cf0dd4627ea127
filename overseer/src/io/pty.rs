//! PTY-bound session controller.
//!
//! Each session owns exactly one subprocess attached to a pseudo-terminal
//! (raw byte channel, no line discipline on our side), running in the task's
//! workspace. Three threads service it: a reader that mirrors output into the
//! bounded ring and forwards chunks to the task worker, a writer that drains
//! the bounded input queue, and a timekeeper that owns keepalive, idle
//! interrupt, and the hard ceiling. Non-zero exit is surfaced upward, never
//! retried here.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ExitSummary;
use crate::errors::OverseerError;
use crate::io::config::SessionConfig;
use crate::io::session::{
    OutputRing, SessionCommand, SessionPort, SessionRegistry, SessionReport, SessionRequest,
    SessionRunner, SessionState,
};

/// ETX, delivered by the terminal as SIGINT to the foreground process group.
const INTERRUPT_BYTE: u8 = 0x03;
const TIMEKEEPER_TICK: Duration = Duration::from_millis(50);

enum WriteCmd {
    Bytes(Vec<u8>),
    Shutdown,
}

/// State shared between the controller threads and the request API.
struct Shared {
    task_id: String,
    state: Mutex<SessionState>,
    ring: Mutex<OutputRing>,
    /// Milliseconds since session start at the last observed output.
    last_activity_ms: AtomicU64,
    exited: AtomicBool,
    /// Set when the orchestrator (not the program) ended the process.
    forced: AtomicBool,
    writer_tx: SyncSender<WriteCmd>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    started: Instant,
}

impl Shared {
    fn note_activity(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(last))
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().expect("session state lock poisoned") = state;
    }

    fn mark_active(&self) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state == SessionState::Ready {
            *state = SessionState::Active;
        }
    }

    fn force_kill(&self) {
        self.forced.store(true, Ordering::SeqCst);
        let mut killer = self.killer.lock().expect("session killer lock poisoned");
        if let Err(err) = killer.kill() {
            debug!(error = %err, "kill failed (process may have exited)");
        }
    }
}

impl SessionPort for Shared {
    fn write(&self, bytes: &[u8]) -> Result<(), OverseerError> {
        match self.writer_tx.try_send(WriteCmd::Bytes(bytes.to_vec())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(OverseerError::Backpressure(self.task_id.clone()))
            }
        }
    }

    fn interrupt(&self) -> Result<(), OverseerError> {
        self.write(&[INTERRUPT_BYTE])
    }

    fn terminate(&self) {
        self.force_kill();
    }

    fn shutdown(&self, grace: Duration) {
        self.set_state(SessionState::Draining);
        let _ = self.writer_tx.try_send(WriteCmd::Shutdown);
        let deadline = Instant::now() + grace;
        while !self.exited.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(TIMEKEEPER_TICK);
        }
        if !self.exited.load(Ordering::SeqCst) {
            warn!(task_id = %self.task_id, "grace period elapsed, force-killing session");
            self.force_kill();
        }
    }

    fn output_tail(&self, n: usize) -> Vec<u8> {
        self.ring.lock().expect("session ring lock poisoned").tail(n)
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }
}

/// A live PTY session plus its service threads.
pub struct PtySession {
    shared: Arc<Shared>,
    chunk_rx: Receiver<Vec<u8>>,
    io_thread: thread::JoinHandle<Option<i32>>,
    writer_thread: thread::JoinHandle<()>,
    timekeeper: thread::JoinHandle<()>,
    /// Keeps the PTY master (and thus the channel) alive for the session.
    _master: Box<dyn MasterPty + Send>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession").finish_non_exhaustive()
    }
}

impl PtySession {
    /// Spawn the controlled program in a fresh PTY inside `workspace`.
    #[instrument(skip_all, fields(task_id = %request.task_id, session_id = %request.session_id))]
    pub fn open(request: &SessionRequest, config: &SessionConfig) -> Result<Self> {
        if request.command.is_empty() {
            return Err(OverseerError::Spawn("empty session command".to_string()).into());
        }
        if !request.workspace.is_dir() {
            return Err(OverseerError::Spawn(format!(
                "workspace {} is not a directory",
                request.workspace.display()
            ))
            .into());
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| OverseerError::Spawn(format!("openpty failed: {err}")))?;

        let mut cmd = CommandBuilder::new(&request.command[0]);
        for arg in &request.command[1..] {
            cmd.arg(arg);
        }
        cmd.cwd(&request.workspace);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| OverseerError::Spawn(format!("spawn '{}': {err}", request.command[0])))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("clone PTY reader")?;
        let mut writer = pair.master.take_writer().context("take PTY writer")?;

        let (writer_tx, writer_rx) = sync_channel(config.write_queue_capacity);
        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>();

        let shared = Arc::new(Shared {
            task_id: request.task_id.clone(),
            state: Mutex::new(SessionState::Starting),
            ring: Mutex::new(OutputRing::new(config.output_buffer_bytes)),
            last_activity_ms: AtomicU64::new(0),
            exited: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            writer_tx,
            killer: Mutex::new(killer),
            started: Instant::now(),
        });

        let io_shared = shared.clone();
        let io_thread = thread::Builder::new()
            .name(format!("overseer-io-{}", request.session_id))
            .spawn(move || {
                let mut buf = vec![0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            io_shared.note_activity();
                            io_shared.mark_active();
                            io_shared
                                .ring
                                .lock()
                                .expect("session ring lock poisoned")
                                .push(&buf[..n]);
                            if chunk_tx.send(buf[..n].to_vec()).is_err() {
                                // Consumer gone; keep draining so the child
                                // is not blocked on a full PTY buffer.
                            }
                        }
                        Err(_) => break,
                    }
                }
                let code = match child.wait() {
                    Ok(status) => i32::try_from(status.exit_code()).ok(),
                    Err(_) => None,
                };
                io_shared.exited.store(true, Ordering::SeqCst);
                io_shared.set_state(SessionState::Terminated);
                code
            })
            .context("spawn session io thread")?;

        let writer_thread = thread::Builder::new()
            .name(format!("overseer-writer-{}", request.session_id))
            .spawn(move || {
                for cmd in writer_rx.iter() {
                    match cmd {
                        WriteCmd::Bytes(bytes) => {
                            if writer
                                .write_all(&bytes)
                                .and_then(|()| writer.flush())
                                .is_err()
                            {
                                break;
                            }
                        }
                        WriteCmd::Shutdown => break,
                    }
                }
            })
            .context("spawn session writer thread")?;

        let tk_shared = shared.clone();
        let heartbeat = config.heartbeat();
        let idle_timeout = config.idle_timeout();
        let hard_timeout = config.hard_timeout();
        let keepalive_byte = config.keepalive_byte;
        let timekeeper = thread::Builder::new()
            .name(format!("overseer-timer-{}", request.session_id))
            .spawn(move || {
                let mut last_keepalive = Duration::ZERO;
                let mut last_idle_poke = Duration::ZERO;
                loop {
                    if tk_shared.exited.load(Ordering::SeqCst) {
                        break;
                    }
                    let elapsed = tk_shared.started.elapsed();
                    if elapsed >= hard_timeout {
                        warn!(task_id = %tk_shared.task_id, "hard timeout, terminating session");
                        tk_shared.force_kill();
                        break;
                    }
                    let idle = tk_shared.idle();
                    if !idle_timeout.is_zero()
                        && idle >= idle_timeout
                        && elapsed - last_idle_poke >= idle_timeout
                    {
                        warn!(task_id = %tk_shared.task_id, idle_secs = idle.as_secs(), "idle timeout, interrupting");
                        let _ = tk_shared.interrupt();
                        last_idle_poke = elapsed;
                    } else if !heartbeat.is_zero()
                        && idle >= heartbeat
                        && elapsed - last_keepalive >= heartbeat
                    {
                        debug!(task_id = %tk_shared.task_id, "writing keepalive byte");
                        let _ = SessionPort::write(tk_shared.as_ref(), &[keepalive_byte]);
                        last_keepalive = elapsed;
                    }
                    thread::sleep(TIMEKEEPER_TICK);
                }
            })
            .context("spawn session timekeeper thread")?;

        shared.set_state(SessionState::Ready);
        info!(command = %request.command.join(" "), "session opened");

        Ok(Self {
            shared,
            chunk_rx,
            io_thread,
            writer_thread,
            timekeeper,
            _master: pair.master,
        })
    }

    /// Control surface shared with the request API.
    pub fn port(&self) -> Arc<dyn SessionPort> {
        self.shared.clone()
    }

    /// Lazy, non-restartable sequence of output chunks. Ends at process exit.
    pub fn chunks(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.chunk_rx.iter()
    }

    /// Join the service threads and assemble the final report.
    pub fn finish(self) -> Result<SessionReport> {
        let _ = self.shared.writer_tx.try_send(WriteCmd::Shutdown);
        let code = self
            .io_thread
            .join()
            .map_err(|_| anyhow::anyhow!("session io thread panicked"))?;
        self.writer_thread
            .join()
            .map_err(|_| anyhow::anyhow!("session writer thread panicked"))?;
        self.timekeeper
            .join()
            .map_err(|_| anyhow::anyhow!("session timekeeper thread panicked"))?;
        let ring = self.shared.ring.lock().expect("session ring lock poisoned");
        Ok(SessionReport {
            exit: ExitSummary {
                code,
                forced: self.shared.forced.load(Ordering::SeqCst),
            },
            output_tail: ring.tail(usize::MAX),
            truncated: ring.truncated(),
        })
    }
}

/// Production [`SessionRunner`]: one PTY session per call.
pub struct PtySessionRunner;

impl SessionRunner for PtySessionRunner {
    #[instrument(skip_all, fields(task_id = %request.task_id))]
    fn run(
        &self,
        request: &SessionRequest,
        config: &SessionConfig,
        registry: &SessionRegistry,
        observer: crate::io::session::ChunkObserver<'_>,
    ) -> Result<SessionReport> {
        let session = PtySession::open(request, config)?;
        let port = session.port();
        registry.register(&request.task_id, port.clone());

        if !request.prompt.is_empty() {
            let mut bytes = request.prompt.clone().into_bytes();
            bytes.push(b'\n');
            if let Err(err) = port.write(&bytes) {
                warn!(error = %err, "initial prompt write hit backpressure");
            }
        }

        for chunk in session.chunks() {
            for command in observer(&chunk) {
                let failed = match command {
                    SessionCommand::Write(bytes) => port.write(&bytes).err(),
                    SessionCommand::Interrupt => port.interrupt().err(),
                    SessionCommand::Terminate => {
                        port.terminate();
                        None
                    }
                };
                if let Some(err) = failed {
                    warn!(error = %err, "intervention input dropped");
                }
            }
        }

        registry.deregister(&request.task_id);
        session.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request(workspace: &Path, command: &[&str]) -> SessionRequest {
        SessionRequest {
            session_id: "s1".to_string(),
            task_id: "t1".to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            workspace: workspace.to_path_buf(),
            env: Vec::new(),
            prompt: String::new(),
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            hard_timeout_secs: 30,
            idle_timeout_secs: 0,
            heartbeat_secs: 0,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn spawn_failure_is_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), &["definitely-not-a-real-binary-xyz"]);
        let err = PtySession::open(&req, &config()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OverseerError>(),
            Some(OverseerError::Spawn(_))
        ));
    }

    #[test]
    fn captures_output_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), &["sh", "-c", "echo marker-out; exit 7"]);
        let session = PtySession::open(&req, &config()).expect("open");
        let mut seen = Vec::new();
        for chunk in session.chunks() {
            seen.extend_from_slice(&chunk);
        }
        let report = session.finish().expect("finish");
        assert!(String::from_utf8_lossy(&seen).contains("marker-out"));
        assert_eq!(report.exit.code, Some(7));
        assert!(!report.exit.forced);
    }

    #[test]
    fn write_reaches_the_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), &["sh", "-c", "read line; echo got:$line"]);
        let session = PtySession::open(&req, &config()).expect("open");
        session.port().write(b"ping\n").expect("write");
        let mut seen = Vec::new();
        for chunk in session.chunks() {
            seen.extend_from_slice(&chunk);
        }
        let report = session.finish().expect("finish");
        assert!(String::from_utf8_lossy(&seen).contains("got:ping"));
        assert_eq!(report.exit.code, Some(0));
    }

    #[test]
    fn terminate_forces_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), &["sh", "-c", "sleep 30"]);
        let session = PtySession::open(&req, &config()).expect("open");
        let port = session.port();
        port.terminate();
        for _chunk in session.chunks() {}
        let report = session.finish().expect("finish");
        assert!(report.exit.forced);
    }

    #[test]
    fn runner_applies_observer_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = SessionRequest {
            prompt: String::new(),
            ..request(temp.path(), &["sh", "-c", "echo 'continue? [y/N]'; read a; echo answer:$a"])
        };
        let registry = SessionRegistry::new();
        let mut answered = false;
        let report = PtySessionRunner
            .run(&req, &config(), &registry, &mut |chunk: &[u8]| {
                let text = String::from_utf8_lossy(chunk).to_string();
                if !answered && text.contains("[y/N]") {
                    answered = true;
                    vec![SessionCommand::Write(b"y\n".to_vec())]
                } else {
                    Vec::new()
                }
            })
            .expect("run");
        assert_eq!(report.exit.code, Some(0));
        assert!(String::from_utf8_lossy(&report.output_tail).contains("answer:y"));
        assert!(registry.get("t1").is_none());
    }
}
