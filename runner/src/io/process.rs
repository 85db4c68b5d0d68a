//! Child process helpers: a watched, streaming run for agents and a bounded
//! one-shot run for auxiliary tools.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Settings for [`run_watched`].
#[derive(Debug, Clone)]
pub struct WatchOptions<'a> {
    /// Kill the child when neither stream produced output for this long.
    /// `Duration::ZERO` disables the check.
    pub inactivity: Duration,
    /// Absolute cap on the child's runtime.
    pub max_runtime: Option<Duration>,
    /// Bytes kept in memory per stream. The oldest output is dropped first,
    /// on a line boundary, so the final lines always survive.
    pub output_limit_bytes: usize,
    /// Raw stdout is copied here line by line as it arrives.
    pub stream_path: Option<&'a Path>,
    /// How often cancellation and inactivity are re-checked.
    pub poll: Duration,
}

impl Default for WatchOptions<'_> {
    fn default() -> Self {
        Self {
            inactivity: Duration::ZERO,
            max_runtime: None,
            output_limit_bytes: 8 * 1024 * 1024,
            stream_path: None,
            poll: Duration::from_millis(200),
        }
    }
}

/// How a watched child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    /// Killed after going silent for the inactivity window.
    Inactive,
    /// Killed after exceeding the runtime cap.
    Overran,
    /// Killed because the cancel token fired.
    Cancelled,
}

#[derive(Debug)]
pub struct WatchedOutput {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Bounded in-memory copy of one stream.
#[derive(Default)]
struct Capture {
    kept: Vec<u8>,
    truncated: usize,
    cut_on_newline: bool,
}

impl Capture {
    /// Keep the first `limit` bytes.
    fn push_head(&mut self, bytes: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.kept.len());
        let keep = bytes.len().min(room);
        self.kept.extend_from_slice(&bytes[..keep]);
        self.truncated += bytes.len() - keep;
    }

    /// Keep the last `limit` bytes. Compaction is deferred until the buffer
    /// doubles so long streams are not shifted on every line.
    fn push_tail(&mut self, bytes: &[u8], limit: usize) {
        self.kept.extend_from_slice(bytes);
        if self.kept.len() > limit.saturating_mul(2) {
            self.compact(limit);
        }
    }

    fn compact(&mut self, limit: usize) {
        if self.kept.len() <= limit {
            return;
        }
        let excess = self.kept.len() - limit;
        self.cut_on_newline = self.kept[excess - 1] == b'\n';
        self.kept.drain(..excess);
        self.truncated += excess;
    }

    /// Final tail trim, dropping a leading partial line.
    fn finish_tail(mut self, limit: usize) -> Self {
        self.compact(limit);
        if self.truncated > 0 && !self.cut_on_newline {
            let skip = self
                .kept
                .iter()
                .position(|&b| b == b'\n')
                .map_or(self.kept.len(), |at| at + 1);
            self.kept.drain(..skip);
            self.truncated += skip;
            self.cut_on_newline = true;
        }
        self
    }
}

/// Run `cmd` while watching it for silence, overruns and cancellation.
///
/// Output is read line by line on helper threads. Each stdout line is passed to
/// `on_line` and, when configured, appended to the stream file. A killed
/// child's reader threads are left to finish on their own so that orphaned
/// grandchildren holding the pipes cannot block the caller.
#[instrument(skip_all, fields(inactivity_secs = opts.inactivity.as_secs(), streaming = opts.stream_path.is_some()))]
pub fn run_watched<F: FnMut(&str)>(
    mut cmd: Command,
    opts: &WatchOptions<'_>,
    cancel: &CancelToken,
    mut on_line: F,
) -> Result<WatchedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut tee = match opts.stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning agent process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow!(err).context("spawn command")
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_line_reader(stdout, tx.clone(), Chunk::Stdout);
    spawn_line_reader(stderr, tx, Chunk::Stderr);

    let started = Instant::now();
    let mut last_output = started;
    let mut streams_open = true;
    let mut out = Capture::default();
    let mut err = Capture::default();

    let termination = loop {
        if cancel.is_cancelled() {
            debug!("cancel requested, killing child");
            kill(&mut child)?;
            break Termination::Cancelled;
        }
        if !opts.inactivity.is_zero() && last_output.elapsed() >= opts.inactivity {
            warn!(
                inactivity_secs = opts.inactivity.as_secs(),
                "no output from child, killing"
            );
            kill(&mut child)?;
            break Termination::Inactive;
        }
        if let Some(cap) = opts.max_runtime
            && started.elapsed() >= cap
        {
            warn!(max_runtime_secs = cap.as_secs(), "child exceeded runtime cap, killing");
            kill(&mut child)?;
            break Termination::Overran;
        }

        if streams_open {
            match rx.recv_timeout(opts.poll) {
                Ok(Chunk::Stdout(line)) => {
                    last_output = Instant::now();
                    if let Some(writer) = tee.as_mut()
                        && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
                    {
                        warn!(err = %e, "failed to write stream file");
                    }
                    on_line(&String::from_utf8_lossy(&line));
                    out.push_tail(&line, opts.output_limit_bytes);
                }
                Ok(Chunk::Stderr(line)) => {
                    last_output = Instant::now();
                    err.push_tail(&line, opts.output_limit_bytes);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => streams_open = false,
            }
        } else if let Some(status) = child.wait_timeout(opts.poll).context("wait for command")? {
            break Termination::Exited(status);
        }
    };

    while let Ok(chunk) = rx.try_recv() {
        match chunk {
            Chunk::Stdout(line) => out.push_tail(&line, opts.output_limit_bytes),
            Chunk::Stderr(line) => err.push_tail(&line, opts.output_limit_bytes),
        }
    }
    let out = out.finish_tail(opts.output_limit_bytes);
    let err = err.finish_tail(opts.output_limit_bytes);

    if out.truncated > 0 || err.truncated > 0 {
        warn!(
            stdout_truncated = out.truncated,
            stderr_truncated = err.truncated,
            "output truncated"
        );
    }
    debug!(?termination, elapsed_ms = started.elapsed().as_millis() as u64, "child finished");
    Ok(WatchedOutput {
        termination,
        stdout: out.kept,
        stderr: err.kept,
        stdout_truncated: out.truncated,
        stderr_truncated: err.truncated,
    })
}

fn spawn_line_reader<R: Read + Send + 'static>(
    reader: R,
    tx: Sender<Chunk>,
    wrap: fn(Vec<u8>) -> Chunk,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(wrap(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(err = %e, "output reader stopped");
                    break;
                }
            }
        }
    });
}

fn kill(child: &mut Child) -> Result<()> {
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed, child already gone");
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

/// Captured output of a one-shot command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a short command to completion, killing it after `timeout`.
///
/// Both pipes are drained on reader threads so a chatty child cannot fill a
/// pipe and deadlock; at most `output_limit_bytes` per stream are kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || drain_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || drain_limited(stderr, output_limit_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    let stdout = join_capture(stdout_handle).context("join stdout")?;
    let stderr = join_capture(stderr_handle).context("join stderr")?;
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut capture = Capture::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        capture.push_head(&chunk[..n], limit);
    }
    Ok(capture.kept)
}

fn join_capture(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}
