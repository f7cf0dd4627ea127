//! Session contracts: how the orchestrator talks to a live subprocess.
//!
//! The [`SessionRunner`] trait decouples task workers from the actual PTY
//! backend. Tests use scripted runners that feed predetermined chunks through
//! the observer without spawning processes; production uses
//! [`crate::io::pty::PtySessionRunner`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::core::types::ExitSummary;
use crate::errors::OverseerError;
use crate::io::config::SessionConfig;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Active,
    Draining,
    Terminated,
}

/// Parameters for starting one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: String,
    pub task_id: String,
    /// Program and arguments for the controlled process.
    pub command: Vec<String>,
    /// Working directory: the task's isolated workspace.
    pub workspace: PathBuf,
    pub env: Vec<(String, String)>,
    /// Prompt written to the session once it is live.
    pub prompt: String,
}

/// Corrective input decided by the scanner for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Write(Vec<u8>),
    Interrupt,
    Terminate,
}

/// Summary handed back when a session finishes.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub exit: ExitSummary,
    /// Tail of the bounded output buffer.
    pub output_tail: Vec<u8>,
    /// Bytes dropped from the ring because of the buffer bound.
    pub truncated: usize,
}

/// Observer invoked with every output chunk, in occurrence order, from the
/// task's own worker. Returned commands are applied to the session.
pub type ChunkObserver<'a> = &'a mut dyn FnMut(&[u8]) -> Vec<SessionCommand>;

/// Live control surface for one session, shared with the request API.
pub trait SessionPort: Send + Sync {
    /// Queue raw input. Never blocks: a full queue is a backpressure error.
    fn write(&self, bytes: &[u8]) -> Result<(), OverseerError>;
    /// Send the interrupt control sequence.
    fn interrupt(&self) -> Result<(), OverseerError>;
    /// Force-terminate the process.
    fn terminate(&self);
    /// Drain, then force-kill after the grace period.
    fn shutdown(&self, grace: std::time::Duration);
    /// Last `n` bytes of observed output.
    fn output_tail(&self, n: usize) -> Vec<u8>;
    fn state(&self) -> SessionState;
}

/// Abstraction over session backends.
pub trait SessionRunner: Send + Sync {
    /// Run a session to completion.
    ///
    /// The runner must register a [`SessionPort`] in `registry` before the
    /// first chunk is observed and deregister it before returning, and must
    /// deliver chunks to `observer` one at a time in order.
    fn run(
        &self,
        request: &SessionRequest,
        config: &SessionConfig,
        registry: &SessionRegistry,
        observer: ChunkObserver<'_>,
    ) -> Result<SessionReport>;
}

/// Live sessions addressable by task id.
#[derive(Default)]
pub struct SessionRegistry {
    ports: Mutex<HashMap<String, Arc<dyn SessionPort>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str, port: Arc<dyn SessionPort>) {
        self.ports
            .lock()
            .expect("session registry lock poisoned")
            .insert(task_id.to_string(), port);
    }

    pub fn deregister(&self, task_id: &str) {
        self.ports
            .lock()
            .expect("session registry lock poisoned")
            .remove(task_id);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<dyn SessionPort>> {
        self.ports
            .lock()
            .expect("session registry lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn live_task_ids(&self) -> Vec<String> {
        self.ports
            .lock()
            .expect("session registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Bounded output ring buffer with a truncation counter.
#[derive(Debug)]
pub struct OutputRing {
    buf: VecDeque<u8>,
    capacity: usize,
    truncated: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            capacity: capacity.max(1),
            truncated: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk.iter().copied());
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
            self.truncated += 1;
        }
    }

    pub fn tail(&self, n: usize) -> Vec<u8> {
        let skip = self.buf.len().saturating_sub(n);
        self.buf.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn truncated(&self) -> usize {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_and_counts_truncation() {
        let mut ring = OutputRing::new(8);
        ring.push(b"0123456789ab");
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.truncated(), 4);
        assert_eq!(ring.tail(4), b"89ab".to_vec());
        assert_eq!(ring.tail(100), b"456789ab".to_vec());
    }

    #[test]
    fn registry_round_trips_ports() {
        struct NullPort;
        impl SessionPort for NullPort {
            fn write(&self, _bytes: &[u8]) -> Result<(), OverseerError> {
                Ok(())
            }
            fn interrupt(&self) -> Result<(), OverseerError> {
                Ok(())
            }
            fn terminate(&self) {}
            fn shutdown(&self, _grace: std::time::Duration) {}
            fn output_tail(&self, _n: usize) -> Vec<u8> {
                Vec::new()
            }
            fn state(&self) -> SessionState {
                SessionState::Ready
            }
        }

        let registry = SessionRegistry::new();
        registry.register("t1", Arc::new(NullPort));
        assert!(registry.get("t1").is_some());
        assert_eq!(registry.live_task_ids(), vec!["t1".to_string()]);
        registry.deregister("t1");
        assert!(registry.get("t1").is_none());
    }
}
