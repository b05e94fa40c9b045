//! Time-boxed child processes with bounded, deadlock-free output capture.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the child was killed by a signal (including our timeout).
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Render both streams as a log section headed by `label`.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = format!("=== {label} stdout ===\n");
        buf.push_str(&self.stdout_lossy());
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]", self.stdout_truncated));
        }
        buf.push_str(&format!("\n=== {label} stderr ===\n"));
        buf.push_str(&self.stderr_lossy());
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]", self.stderr_truncated));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]"));
        }
        buf.push('\n');
        buf
    }
}

/// Limits and side channels for one child run.
#[derive(Debug, Clone, Copy)]
pub struct Capture<'a> {
    pub timeout: Duration,
    /// Bytes kept in memory per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// When set, stdout lines are appended to this file as they arrive.
    pub tee_path: Option<&'a Path>,
}

/// How long the output readers may lag behind the child's exit before the
/// rest of its process group is killed.
const PIPE_GRACE: Duration = Duration::from_secs(1);

/// The child could not be started at all.
#[derive(Debug, thiserror::Error)]
#[error("spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

type Tee = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run `cmd`, feeding `stdin` if given, and wait at most `capture.timeout`.
///
/// Both pipes are drained on their own threads while the child runs, so a
/// chatty child can never block on a full pipe. On Unix the child leads its
/// own process group; a timeout kills the whole group, and so does a child
/// that exits while descendants still hold its output pipes.
///
/// A child that cannot be spawned fails with a [`SpawnError`] in the chain.
#[instrument(skip_all, fields(timeout_secs = capture.timeout.as_secs(), tee = capture.tee_path.is_some()))]
pub fn run_captured(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    capture: Capture<'_>,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee: Tee = Arc::new(match capture.tee_path {
        Some(path) => Some(Mutex::new(open_tee(path)?)),
        None => None,
    });

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: cmd.get_program().to_string_lossy().into_owned(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = capture.output_limit_bytes;
    let stdout_tee = Arc::clone(&tee);
    let stdout_handle = thread::spawn(move || drain_lines(stdout, limit, &stdout_tee));
    let stderr_handle = thread::spawn(move || drain(stderr, limit));

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading stdin closes the pipe early; that
        // is its business, not a runner error.
        if let Err(err) = pipe.write_all(input) {
            debug!(err = %err, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(capture.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = capture.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    if !finished_within(&[&stdout_handle, &stderr_handle], PIPE_GRACE) {
        warn!("descendants still hold output pipes, killing process group");
        kill_group(&mut child);
    }

    let (stdout, stdout_truncated) = join(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        code: if timed_out { None } else { status.code() },
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Kill the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pgid) => match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) => return,
                Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => warn!(err = %err, "failed to kill process group"),
            },
            Err(_) => warn!(pid = child.id(), "pid out of range for a process group"),
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after exit");
    }
}

fn finished_within<T>(handles: &[&thread::JoinHandle<T>], grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if handles.iter().all(|h| h.is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn open_tee(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create tee dir {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create tee file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn join(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn keep_within(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let room = limit.saturating_sub(buf.len());
    let keep = chunk.len().min(room);
    buf.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
}

fn drain_lines<R: Read>(reader: R, limit: usize, tee: &Tee) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Some(mutex) = tee.as_ref()
            && let Ok(mut writer) = mutex.lock()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to tee output line");
        }
        dropped += keep_within(&mut kept, &line, limit);
    }
    Ok((kept, dropped))
}

fn drain<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        dropped += keep_within(&mut kept, &chunk[..n], limit);
    }
    Ok((kept, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn capture(timeout: Duration) -> Capture<'static> {
        Capture {
            timeout,
            output_limit_bytes: 1_000,
            tee_path: None,
        }
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let out = run_captured(
            sh("echo out; echo err >&2; exit 3"),
            None,
            capture(Duration::from_secs(10)),
        )
        .expect("run");
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn feeds_stdin() {
        let out = run_captured(sh("cat"), Some(b"hello"), capture(Duration::from_secs(10)))
            .expect("run");
        assert_eq!(out.stdout_lossy(), "hello");
        assert!(out.success());
    }

    #[test]
    fn timeout_kills_child() {
        let out = run_captured(sh("exec sleep 5"), None, capture(Duration::from_millis(200)))
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.code, None);
        assert!(out.render_log("agent").contains("[agent timed out]"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let out = run_captured(
            sh("sleep 6; true"),
            None,
            capture(Duration::from_millis(300)),
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    }

    #[test]
    fn background_descendant_does_not_hold_up_a_finished_child() {
        let started = Instant::now();
        let out = run_captured(
            sh("sleep 6 & echo started"),
            None,
            capture(Duration::from_secs(10)),
        )
        .expect("run");
        assert_eq!(out.code, Some(0));
        assert_eq!(out.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    }

    #[test]
    fn spawn_failure_is_typed() {
        let err = run_captured(
            Command::new("taskloop-no-such-program"),
            None,
            capture(Duration::from_secs(1)),
        )
        .unwrap_err();
        let spawn = err.downcast_ref::<SpawnError>().expect("spawn error");
        assert_eq!(spawn.program, "taskloop-no-such-program");
        assert_eq!(spawn.source.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let mut c = capture(Duration::from_secs(10));
        c.output_limit_bytes = 4;
        let out = run_captured(sh("printf 0123456789"), None, c).expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    #[test]
    fn tees_stdout_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("logs/agent.stream");
        let c = Capture {
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000,
            tee_path: Some(&tee),
        };
        run_captured(sh("echo one; echo two"), None, c).expect("run");
        assert_eq!(std::fs::read_to_string(&tee).expect("read"), "one\ntwo\n");
    }
}
