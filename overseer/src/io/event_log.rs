//! Append-only event log under `.overseer/events.jsonl`.
//!
//! The persistence collaborator is an append-only sink of
//! `{ts_ms, task_id, kind, payload}` records. Its unavailability is logged
//! and never fatal to execution. Events for one task are appended from that
//! task's worker, so per-task order on disk matches occurrence order.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Millisecond-precision timestamp.
    pub ts_ms: i64,
    pub task_id: String,
    pub kind: String,
    pub payload: Value,
}

/// Event kinds emitted by the orchestrator beyond hook lifecycle names.
pub mod kinds {
    pub const TASK_SUBMITTED: &str = "task_submitted";
    pub const SESSION_OPENED: &str = "session_opened";
    pub const SESSION_CLOSED: &str = "session_closed";
    pub const OUTPUT_CHUNK: &str = "output_chunk";
    pub const INPUT_WRITTEN: &str = "input_written";
    pub const INTERVENTION: &str = "intervention";
    pub const VERIFICATION: &str = "verification";
    pub const VERIFICATION_UNAVAILABLE: &str = "verification_unavailable";
    pub const WORKSPACE_ALLOCATED: &str = "workspace_allocated";
    pub const WORKSPACE_FINALIZED: &str = "workspace_finalized";
    pub const WORKSPACE_MERGED: &str = "workspace_merged";
    pub const BRANCH_PRUNED: &str = "branch_pruned";
}

/// Append-only persistence collaborator.
pub trait EventSink: Send + Sync {
    fn append(&self, event: &Event) -> Result<()>;
}

/// JSONL file sink, one event per line.
#[derive(Debug)]
pub struct JsonlEventLog {
    path: PathBuf,
    // Guards interleaved appends from concurrent task workers.
    lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventLog {
    fn append(&self, event: &Event) -> Result<()> {
        let _guard = self.lock.lock().expect("event log lock poisoned");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append event log {}", self.path.display()))?;
        Ok(())
    }
}

/// Read the last `n` events (recent-action view). Unparseable lines are
/// skipped rather than failing the whole read.
pub fn read_tail(path: &Path, n: usize) -> Result<Vec<Event>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read event log {}", path.display()))?;
    let mut events: Vec<Event> = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    if events.len() > n {
        events.drain(..events.len() - n);
    }
    Ok(events)
}

/// All events for one task, in append order.
pub fn read_task_events(path: &Path, task_id: &str) -> Result<Vec<Event>> {
    let events = read_tail(path, usize::MAX)?;
    Ok(events.into_iter().filter(|e| e.task_id == task_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(task_id: &str, kind: &str, ts_ms: i64) -> Event {
        Event {
            ts_ms,
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            payload: json!({}),
        }
    }

    #[test]
    fn append_then_tail_round_trips_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let log = JsonlEventLog::new(&path);

        for i in 0..5 {
            log.append(&event("t1", kinds::OUTPUT_CHUNK, i)).expect("append");
        }

        let tail = read_tail(&path, 3).expect("tail");
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].ts_ms, 2);
        assert_eq!(tail[2].ts_ms, 4);
    }

    #[test]
    fn task_filter_preserves_per_task_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        let log = JsonlEventLog::new(&path);

        log.append(&event("t1", kinds::TASK_SUBMITTED, 1)).expect("append");
        log.append(&event("t2", kinds::TASK_SUBMITTED, 2)).expect("append");
        log.append(&event("t1", kinds::SESSION_OPENED, 3)).expect("append");

        let t1 = read_task_events(&path, "t1").expect("read");
        assert_eq!(t1.len(), 2);
        assert!(t1[0].ts_ms < t1[1].ts_ms);
    }

    #[test]
    fn missing_file_tails_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tail = read_tail(&temp.path().join("none.jsonl"), 10).expect("tail");
        assert!(tail.is_empty());
    }
}
