//! Bounded subprocess execution for verification checks.
//!
//! Check commands run to completion with a wall-clock timeout and bounded
//! captured output, reading pipes concurrently so a chatty check cannot
//! deadlock on a full pipe.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured check process output.
#[derive(Debug)]
pub struct CheckOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the output limit (stdout + stderr).
    pub truncated: usize,
    pub timed_out: bool,
}

impl CheckOutput {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Run a check command with a timeout, draining pipes while bounding memory.
///
/// A timed-out check is killed and reported as failed, not an error: the
/// caller counts it as evidence, the same as a non-zero exit.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_check(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CheckOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning check process");
    let mut child = cmd.spawn().context("spawn check command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for check")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "check timed out, killing");
            timed_out = true;
            child.kill().context("kill check")?;
            child.wait().context("wait check after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;
    let truncated = stdout_truncated + stderr_truncated;
    if truncated > 0 {
        warn!(truncated, "check output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "check finished");
    Ok(CheckOutput {
        status,
        stdout,
        stderr,
        truncated,
        timed_out,
    })
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut discarded = 0usize;
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).context("read check pipe")?;
        if n == 0 {
            return Ok((kept, discarded));
        }
        let room = limit.saturating_sub(kept.len());
        let take = room.min(n);
        kept.extend_from_slice(&buf[..take]);
        discarded += n - take;
    }
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("pipe reader thread panicked")),
    }
}
