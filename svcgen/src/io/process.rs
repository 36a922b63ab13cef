//! Helpers for running child processes with timeouts, cancellation and bounded output.
//!
//! On Unix every child is started in its own process group. The group is
//! killed once the child has been reaped, and on timeout, cancellation or an
//! early return, so nothing the child spawned outlives the call.

use std::fs;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::{CancelToken, POLL_SLICE};

/// How long to wait for output readers after the child has exited.
const CAPTURE_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    /// Exit code, or `128 + signal` for a signalled child on Unix, or `-1`.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return 128 + signal;
            }
        }
        -1
    }

    pub fn stdout_lossy(&self) -> String {
        with_notice(&self.stdout, self.stdout_truncated)
    }

    pub fn stderr_lossy(&self) -> String {
        with_notice(&self.stderr, self.stderr_truncated)
    }
}

fn with_notice(bytes: &[u8], truncated: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[... output truncated {truncated} bytes ...]\n"));
    }
    text
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Kills the child's process group unless it has been reaped, and keeps the
/// group registered with the cancel token while the child is alive.
struct ChildGuard {
    child: Child,
    reaped: bool,
    cancel: CancelToken,
}

impl ChildGuard {
    fn kill_tree(&mut self) {
        kill_process_group(self.child.id());
        if let Err(err) = self.child.kill() {
            debug!(err = %err, "kill child");
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_tree();
            let _ = self.child.wait();
        }
        self.cancel.untrack_group(self.child.id());
    }
}

#[cfg(unix)]
fn configure_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn configure_process_group(_cmd: &mut Command) {}

/// Send SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = status {
        warn!(pid, err = %err, "failed to signal process group");
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

/// Kill every process group and remove every scratch directory still
/// registered with `cancel`. Used before a forced exit, when guards never drop.
pub fn terminate_tracked(cancel: &CancelToken) {
    for pgid in cancel.tracked_groups() {
        kill_process_group(pgid);
        cancel.untrack_group(pgid);
    }
    for dir in cancel.tracked_dirs() {
        if let Err(err) = fs::remove_dir_all(&dir) {
            debug!(dir = %dir.display(), err = %err, "remove scratch dir");
        }
    }
}

/// Run a command bounded by `timeout` and `cancel`, capturing stdout/stderr.
///
/// Output is read on dedicated threads while the child runs. At most
/// `output_limit_bytes` per stream is kept; the rest is drained and counted.
/// Stdin is written from its own thread so a child that never reads it
/// cannot block the caller.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    configure_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    cancel.track_group(child.id());
    let mut guard = ChildGuard {
        child,
        reaped: false,
        cancel: cancel.clone(),
    };

    if let Some(input) = stdin {
        let mut child_stdin = guard
            .child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                debug!(err = %err, "write stdin");
            }
        });
    }

    let stdout = guard
        .child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = guard
        .child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_buf = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_buf = spawn_reader(stderr, output_limit_bytes, done_tx);

    let deadline = started + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = guard
            .child
            .wait_timeout(POLL_SLICE)
            .context("wait for command")?
        {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        guard.kill_tree();
        break guard.child.wait().context("wait command after kill")?;
    };
    guard.reaped = true;
    // The leader is gone; background children it left in the group go too.
    kill_process_group(guard.child.id());

    let mut finished = 0;
    if !await_readers(&done_rx, &mut finished) {
        warn!("output readers did not finish within grace period");
    }

    let (stdout, stdout_truncated) = take_captured(&stdout_buf)?;
    let (stderr, stderr_truncated) = take_captured(&stderr_buf)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        duration: started.elapsed(),
    })
}

/// Whether `err` stems from a program that does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(|io_err| io_err.kind() == io::ErrorKind::NotFound)
}

/// Wait up to [`CAPTURE_GRACE`] for both readers to report completion.
fn await_readers(done: &mpsc::Receiver<()>, finished: &mut usize) -> bool {
    let deadline = Instant::now() + CAPTURE_GRACE;
    while *finished < 2 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(remaining).is_err() {
            return false;
        }
        *finished += 1;
    }
    true
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<()>,
) -> Arc<Mutex<Captured>> {
    let buf = Arc::new(Mutex::new(Captured::default()));
    let shared = Arc::clone(&buf);
    thread::spawn(move || {
        if let Err(err) = read_stream_limited(reader, limit, &shared) {
            debug!(err = %err, "output reader stopped");
        }
        let _ = done.send(());
    });
    buf
}

fn take_captured(buf: &Mutex<Captured>) -> Result<(Vec<u8>, usize)> {
    let mut captured = buf
        .lock()
        .map_err(|_| anyhow!("output reader thread panicked"))?;
    let taken = std::mem::take(&mut *captured);
    Ok((taken.bytes, taken.truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, out: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = out
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}
