//! Helpers for running child processes with timeouts, bounded output, and
//! line-by-line observation of stdout.

use std::io::{BufRead, BufReader, Read, Write};
use std::ops::ControlFlow;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The line observer asked for the process to be killed.
    pub interrupted: bool,
}

impl CommandOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run a command, handing every stdout line to `on_line` as it arrives.
///
/// Returning `ControlFlow::Break` from `on_line` kills the child. The child is
/// also killed once `timeout` elapses. `output_limit_bytes` bounds how much of
/// each stream is kept in memory (the pipes are still drained).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_streaming<F>(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    mut on_line: F,
) -> Result<CommandOutput>
where
    F: FnMut(&str) -> ControlFlow<()>,
{
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input)
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e).context("write stdin");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (line_tx, line_rx) = mpsc::channel::<Vec<u8>>();
    let stdout_handle = thread::spawn(move || -> Result<()> {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).context("read line")?;
            if n == 0 {
                return Ok(());
            }
            if line_tx.send(line).is_err() {
                return Ok(());
            }
        }
    });
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = stderr_tx.send(read_stream_limited(stderr, output_limit_bytes));
    });

    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    let mut stdout_truncated = 0usize;
    let mut timed_out = false;
    let mut interrupted = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill(&mut child)?;
            break;
        }
        match line_rx.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
            Ok(line) => {
                keep_limited(&mut collected, &mut stdout_truncated, &line, output_limit_bytes);
                let text = String::from_utf8_lossy(&line);
                if on_line(text.trim_end_matches(['\n', '\r'])).is_break() {
                    debug!("line observer requested stop, killing");
                    interrupted = true;
                    kill(&mut child)?;
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(line_rx);

    let remaining = deadline.saturating_duration_since(Instant::now());
    let status = match child.wait_timeout(remaining).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command did not exit, killing");
            timed_out = true;
            kill(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    // A killed child may leave grandchildren holding the pipes open, so the
    // readers are only awaited briefly (stdout is detached entirely).
    let killed = timed_out || interrupted;
    if !killed {
        match stdout_handle.join() {
            Ok(result) => result.context("join stdout")?,
            Err(_) => return Err(anyhow!("stdout reader thread panicked")),
        }
    }
    let stderr_result = if killed {
        stderr_rx.recv_timeout(KILL_GRACE).ok()
    } else {
        stderr_rx.recv().ok()
    };
    let (stderr, stderr_truncated) = match stderr_result {
        Some(result) => result.context("read stderr")?,
        None => (Vec::new(), 0),
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, interrupted, "command finished");
    Ok(CommandOutput {
        status,
        stdout: collected,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        interrupted,
    })
}

/// Run a command to completion (or timeout) without observing its output.
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_command_streaming(cmd, stdin, timeout, output_limit_bytes, |_| {
        ControlFlow::Continue(())
    })
}

fn kill(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        // Already exited between the last poll and the kill.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e).context("kill command"),
    }
}

fn keep_limited(buf: &mut Vec<u8>, truncated: &mut usize, chunk: &[u8], limit: usize) {
    let remaining = limit.saturating_sub(buf.len());
    let keep = chunk.len().min(remaining);
    buf.extend_from_slice(&chunk[..keep]);
    *truncated += chunk.len() - keep;
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        keep_limited(&mut buf, &mut truncated, &chunk[..n], limit);
    }

    Ok((buf, truncated))
}
