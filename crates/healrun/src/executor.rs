//! Process executor for the command under test.
//!
//! Runs one command per call and returns an [`ExecutionRecord`]:
//! - Spawn through the platform shell in its own process group
//! - Drain stdout/stderr concurrently into bounded buffers
//! - Mirror every chunk to the console and append it to the attempt log
//! - Kill the whole process group on exit, timeout or cancellation
//!
//! Nonzero exits, timeouts, spawn failures and cancellation are encoded in
//! the record. Only an unusable output directory is an error.

use chrono::{DateTime, Utc};
use healrun_core::{
    ExecutionRecord, RunConfiguration, CANCELLED_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while a command runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of lines to include in the tail file.
const TAIL_LINES: usize = 200;

/// Read buffer size for stream draining.
const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("output directory {path} is not writable: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid execution request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// A piece of output on its way to the log writer.
#[derive(Debug)]
struct Chunk {
    stream: Stream,
    bytes: Vec<u8>,
}

/// Bytes captured from one stream.
///
/// Shared between the drain task and the executor so a drain that is
/// abandoned still leaves what it read.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory for attempt logs.
    pub output_dir: PathBuf,
    /// In-memory capture limit per stream.
    pub max_output_bytes: usize,
    /// Mirror output to this process's stdout/stderr.
    pub echo_output: bool,
}

impl ExecutorConfig {
    pub fn from_run_config(config: &RunConfiguration) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            max_output_bytes: config.max_output_bytes,
            echo_output: config.echo_output,
        }
    }
}

/// Executes commands under test.
#[derive(Debug)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Attempt log path: `attempt-NN-<UTC timestamp>.log`.
    pub fn attempt_log_path(
        output_dir: &Path,
        sequence: u32,
        started_at: DateTime<Utc>,
    ) -> PathBuf {
        output_dir.join(format!(
            "attempt-{:02}-{}.log",
            sequence,
            started_at.format("%Y%m%dT%H%M%S%.3fZ")
        ))
    }

    /// Tail path next to the log: `attempt-NN-<UTC timestamp>.tail.txt`.
    pub fn attempt_tail_path(
        output_dir: &Path,
        sequence: u32,
        started_at: DateTime<Utc>,
    ) -> PathBuf {
        output_dir.join(format!(
            "attempt-{:02}-{}.tail.txt",
            sequence,
            started_at.format("%Y%m%dT%H%M%S%.3fZ")
        ))
    }

    /// Execute `command` once.
    ///
    /// If `cancel_token` fires, the process group is killed and the record
    /// comes back with `cancelled` set.
    pub async fn execute(
        &self,
        sequence: u32,
        command: &str,
        working_dir: &Path,
        run_timeout: Duration,
        env: &BTreeMap<String, String>,
        cancel_token: &CancellationToken,
    ) -> Result<ExecutionRecord> {
        if command.trim().is_empty() {
            return Err(ExecutorError::InvalidRequest("command is empty".to_string()));
        }
        if run_timeout.is_zero() {
            return Err(ExecutorError::InvalidRequest(
                "timeout must be positive".to_string(),
            ));
        }

        let output_dir = &self.config.output_dir;
        std::fs::create_dir_all(output_dir).map_err(|source| ExecutorError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        let started_at = Utc::now();
        let log_path = Self::attempt_log_path(output_dir, sequence, started_at);
        let tail_path = Self::attempt_tail_path(output_dir, sequence, started_at);
        let mut log_file = tokio::fs::File::create(&log_path)
            .await
            .map_err(|source| ExecutorError::OutputDir {
                path: log_path.clone(),
                source,
            })?;

        let mut cmd = shell_command(command);
        cmd.current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            attempt = sequence,
            command = %command,
            working_dir = %working_dir.display(),
            "spawning command"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(attempt = sequence, error = %err, "failed to spawn command");
                let note = format!("failed to spawn command: {err}\n");
                log_file.write_all(note.as_bytes()).await?;
                log_file.flush().await?;
                let mut record = ExecutionRecord::spawn_failure(command, err.to_string());
                record.started_at = started_at;
                record.ended_at = Utc::now();
                record.log_path = Some(log_path);
                return Ok(record);
            }
        };

        // The group id equals the leader's pid, which is unavailable once reaped.
        let pgid = child.id();

        // Single writer owns the log handle; readers forward chunks to it.
        let (tx, rx) = mpsc::channel::<Chunk>(64);
        let writer_task = tokio::spawn(write_log(log_file, rx, self.config.echo_output));
        let max_bytes = self.config.max_output_bytes;
        let stdout_buf = Arc::new(Mutex::new(Captured::default()));
        let stderr_buf = Arc::new(Mutex::new(Captured::default()));
        let stdout_task = child.stdout.take().map(|out| {
            let buf = Arc::clone(&stdout_buf);
            tokio::spawn(drain(out, Stream::Stdout, max_bytes, buf, tx.clone()))
        });
        let stderr_task = child.stderr.take().map(|err| {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(drain(err, Stream::Stderr, max_bytes, buf, tx.clone()))
        });
        drop(tx);

        let started = Instant::now();
        let outcome = loop {
            let elapsed = started.elapsed();
            if elapsed >= run_timeout {
                warn!(
                    attempt = sequence,
                    timeout_ms = run_timeout.as_millis() as u64,
                    "command timed out; killing process group"
                );
                terminate(&mut child).await;
                break ProcessOutcome::TimedOut;
            }

            let sleep_duration = HEARTBEAT_INTERVAL.min(run_timeout.saturating_sub(elapsed));

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => {
                            terminate(&mut child).await;
                            return Err(ExecutorError::Io(e));
                        }
                    }
                }
                () = cancel_token.cancelled() => {
                    info!(attempt = sequence, "cancellation requested; killing process group");
                    terminate(&mut child).await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    if started.elapsed() < run_timeout {
                        info!(
                            attempt = sequence,
                            elapsed_sec = started.elapsed().as_secs(),
                            timeout_ms = run_timeout.as_millis() as u64,
                            "command still running"
                        );
                    }
                }
            }
        };

        if matches!(outcome, ProcessOutcome::Completed(_)) {
            // Background descendants would otherwise keep the pipes open.
            kill_group(pgid);
        }

        let stdout = collect_stream(stdout_task, &stdout_buf, sequence, "stdout").await;
        let stderr = collect_stream(stderr_task, &stderr_buf, sequence, "stderr").await;
        match timeout(IO_CAPTURE_TIMEOUT, writer_task).await {
            Ok(Ok(Ok(bytes))) => debug!(attempt = sequence, log_bytes = bytes, "log closed"),
            Ok(Ok(Err(err))) => warn!(attempt = sequence, error = %err, "log write failed"),
            Ok(Err(err)) => warn!(attempt = sequence, error = %err, "log writer panicked"),
            Err(_) => warn!(attempt = sequence, "log writer did not finish"),
        }

        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;

        let (exit_code, signal, timed_out, cancelled) = match outcome {
            ProcessOutcome::Completed(status) => {
                let signal = exit_signal(&status);
                let code = status
                    .code()
                    .unwrap_or_else(|| signal.map_or(-1, |s| 128 + s));
                (code, signal, false, false)
            }
            ProcessOutcome::TimedOut => (TIMEOUT_EXIT_CODE, None, true, false),
            ProcessOutcome::Cancelled => (CANCELLED_EXIT_CODE, None, false, true),
        };

        let record = ExecutionRecord {
            command: command.to_string(),
            exit_code,
            signal,
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            truncated: stdout.truncated || stderr.truncated,
            timed_out,
            cancelled,
            spawn_error: None,
            started_at,
            ended_at,
            duration_ms,
            log_path: Some(log_path),
            tail_path: Some(tail_path.clone()),
        };

        write_tail(&tail_path, &record.combined_output());

        info!(
            attempt = sequence,
            exit_code = record.exit_code,
            timed_out = record.timed_out,
            cancelled = record.cancelled,
            truncated = record.truncated,
            duration_ms = record.duration_ms,
            output_bytes = record.stdout.len() + record.stderr.len(),
            "command finished"
        );

        Ok(record)
    }
}

/// Build a command that runs `command` through the platform shell.
pub(crate) fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Drain a stream into a bounded shared buffer, forwarding every chunk to the log.
///
/// Output past `max_bytes` is dropped from memory but still forwarded.
async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    max_bytes: usize,
    captured: Arc<Mutex<Captured>>,
    tx: mpsc::Sender<Chunk>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        {
            let mut captured = captured.lock().unwrap_or_else(PoisonError::into_inner);
            let remaining = max_bytes.saturating_sub(captured.bytes.len());
            let to_take = n.min(remaining);
            captured.bytes.extend_from_slice(&chunk[..to_take]);
            if to_take < n && !captured.truncated {
                warn!(max_bytes, stream = ?stream, "output exceeded limit, truncating");
                captured.truncated = true;
            }
        }

        // A closed writer only loses mirroring; keep draining the pipe.
        let _ = tx
            .send(Chunk {
                stream,
                bytes: chunk[..n].to_vec(),
            })
            .await;
    }

    Ok(())
}

/// Append chunks to the attempt log and mirror them to the console.
///
/// Owns the log handle; it is flushed after every chunk and closed when
/// both readers have finished.
async fn write_log(
    mut file: tokio::fs::File,
    mut rx: mpsc::Receiver<Chunk>,
    echo: bool,
) -> std::io::Result<u64> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut written = 0u64;

    while let Some(chunk) = rx.recv().await {
        file.write_all(&chunk.bytes).await?;
        file.flush().await?;
        written += chunk.bytes.len() as u64;

        if echo {
            let console = match chunk.stream {
                Stream::Stdout => stdout.write_all(&chunk.bytes).await,
                Stream::Stderr => stderr.write_all(&chunk.bytes).await,
            };
            if let Err(err) = console {
                debug!(error = %err, "console mirror failed");
            }
        }
    }

    file.sync_data().await?;
    if echo {
        let _ = stdout.flush().await;
        let _ = stderr.flush().await;
    }
    Ok(written)
}

/// Await a drain task, giving up after `IO_CAPTURE_TIMEOUT`.
///
/// Returns whatever reached the shared buffer, even when the task failed
/// or had to be abandoned.
async fn collect_stream(
    task: Option<JoinHandle<std::io::Result<()>>>,
    buf: &Mutex<Captured>,
    sequence: u32,
    name: &str,
) -> Captured {
    if let Some(mut task) = task {
        match timeout(IO_CAPTURE_TIMEOUT, &mut task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                warn!(attempt = sequence, stream = name, error = %err, "capture failed");
            }
            Ok(Err(err)) => {
                warn!(attempt = sequence, stream = name, error = %err, "capture task panicked");
            }
            Err(_) => {
                // A descendant escaped the process group and still holds the pipe.
                warn!(attempt = sequence, stream = name, "capture timed out");
                task.abort();
            }
        }
    }
    std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner))
}

/// SIGKILL every process in the group led by `pgid`.
pub(crate) fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %err, "killpg failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// Kill the child's process group (unix) and the child itself, then reap it.
async fn terminate(child: &mut Child) {
    kill_group(child.id());
    if let Err(err) = child.kill().await {
        debug!(error = %err, "kill failed (process may have exited)");
    }
    let _ = child.wait().await;
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Write the last `TAIL_LINES` lines of output.
fn write_tail(path: &Path, output: &str) {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let content = lines[start..].join("\n");
    match std::fs::File::create(path) {
        Ok(mut file) => {
            if let Err(err) = file.write_all(content.as_bytes()) {
                warn!(path = %path.display(), error = %err, "failed to write tail file");
            }
        }
        Err(err) => warn!(path = %path.display(), error = %err, "failed to create tail file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(dir: &Path, max_output_bytes: usize) -> Executor {
        Executor::new(ExecutorConfig {
            output_dir: dir.join("out"),
            max_output_bytes,
            echo_output: false,
        })
    }

    async fn run(exec: &Executor, dir: &Path, command: &str, limit: Duration) -> ExecutionRecord {
        exec.execute(
            1,
            command,
            dir,
            limit,
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[test]
    fn attempt_paths_are_deterministic() {
        let ts = DateTime::parse_from_rfc3339("2026-10-16T08:09:10.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let dir = PathBuf::from("/out");
        assert_eq!(
            Executor::attempt_log_path(&dir, 3, ts),
            PathBuf::from("/out/attempt-03-20261016T080910.123Z.log")
        );
        assert_eq!(
            Executor::attempt_tail_path(&dir, 3, ts),
            PathBuf::from("/out/attempt-03-20261016T080910.123Z.tail.txt")
        );
    }

    #[tokio::test]
    async fn rejects_empty_command_and_zero_timeout() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let token = CancellationToken::new();
        let env = BTreeMap::new();

        let err = exec
            .execute(1, "  ", dir.path(), Duration::from_secs(1), &env, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));

        let err = exec
            .execute(1, "true", dir.path(), Duration::ZERO, &env, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let record = run(
            &exec,
            dir.path(),
            "echo 'to stdout'; echo 'to stderr' >&2; exit 3",
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(record.exit_code, 3);
        assert!(!record.timed_out);
        assert!(!record.truncated);
        assert_eq!(record.stdout, "to stdout\n");
        assert_eq!(record.stderr, "to stderr\n");
    }

    #[tokio::test]
    async fn writes_log_and_tail_files() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let record = run(
            &exec,
            dir.path(),
            "echo first; echo second >&2",
            Duration::from_secs(10),
        )
        .await;

        let log_path = record.log_path.unwrap();
        assert!(log_path.starts_with(dir.path().join("out")));
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("first"));
        assert!(log.contains("second"));

        let tail = std::fs::read_to_string(record.tail_path.unwrap()).unwrap();
        assert!(tail.contains("first"));
    }

    #[tokio::test]
    async fn truncates_in_memory_but_logs_everything() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 16);
        let record = run(
            &exec,
            dir.path(),
            "printf '0123456789abcdefghijklmnopqrstuvwxyz'",
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(record.exit_code, 0);
        assert!(record.truncated);
        assert_eq!(record.stdout, "0123456789abcdef");
        let log = std::fs::read_to_string(record.log_path.unwrap()).unwrap();
        assert_eq!(log, "0123456789abcdefghijklmnopqrstuvwxyz");
    }

    #[tokio::test]
    async fn applies_env_overrides_and_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let exec = executor(dir.path(), 1024);
        let mut env = BTreeMap::new();
        env.insert("HEALRUN_TEST_VALUE".to_string(), "42".to_string());

        let record = exec
            .execute(
                1,
                "echo \"$HEALRUN_TEST_VALUE\"; cat marker.txt",
                dir.path(),
                Duration::from_secs(10),
                &env,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(record.stdout, "42\nhere");
    }

    #[tokio::test]
    async fn times_out_and_kills_process() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let started = Instant::now();
        let record = run(
            &exec,
            dir.path(),
            "echo starting; sleep 30",
            Duration::from_millis(300),
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(record.timed_out);
        assert_eq!(record.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(record.stdout, "starting\n");
    }

    #[tokio::test]
    async fn missing_working_dir_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let record = run(
            &exec,
            &dir.path().join("does-not-exist"),
            "true",
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(record.exit_code, healrun_core::SPAWN_ERROR_EXIT_CODE);
        assert!(record.spawn_error.is_some());
        let log = std::fs::read_to_string(record.log_path.unwrap()).unwrap();
        assert!(log.contains("failed to spawn command"));
    }

    #[tokio::test]
    async fn unwritable_output_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let exec = Executor::new(ExecutorConfig {
            output_dir: blocker.join("out"),
            max_output_bytes: 1024,
            echo_output: false,
        });

        let err = exec
            .execute(
                1,
                "true",
                dir.path(),
                Duration::from_secs(5),
                &BTreeMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::OutputDir { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_process() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let record = exec
            .execute(
                1,
                "sleep 30",
                dir.path(),
                Duration::from_secs(60),
                &BTreeMap::new(),
                &token,
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(record.cancelled);
        assert_eq!(record.exit_code, CANCELLED_EXIT_CODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_descendants() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let pid_file = dir.path().join("grandchild.pid");
        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let record = run(&exec, dir.path(), &command, Duration::from_millis(500)).await;
        assert!(record.timed_out);

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        // The grandchild was in the killed group; it may linger briefly as a
        // zombie until reparented and reaped.
        let gone = (0..50).any(|_| {
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
                && !is_zombie(pid);
            if alive {
                std::thread::sleep(Duration::from_millis(100));
            }
            !alive
        });
        assert!(gone, "grandchild {pid} survived timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_descendant_does_not_hold_output() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        let command = "sleep 20 & echo 'Error: connect ECONNREFUSED 127.0.0.1:5432'; exit 1";

        let started = Instant::now();
        let record = run(&exec, dir.path(), command, Duration::from_secs(30)).await;

        assert!(started.elapsed() < IO_CAPTURE_TIMEOUT);
        assert_eq!(record.exit_code, 1);
        assert!(record.stdout.contains("ECONNREFUSED"));
        assert!(matches!(
            healrun_core::classify(&record),
            healrun_core::Classification::TransientFailure {
                subtype: healrun_core::TransientKind::NetworkUnreachable,
                ..
            }
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_capture_keeps_bytes_already_read() {
        let dir = TempDir::new().unwrap();
        let exec = executor(dir.path(), 1024);
        // setsid moves the sleeper out of the group, so it survives killpg
        // and keeps the pipe open until the capture timeout.
        let command = "command -v setsid >/dev/null || exit 99; \
                       echo before-exit; setsid sleep 20 & exit 3";

        let record = run(&exec, dir.path(), command, Duration::from_secs(30)).await;
        if record.exit_code == 99 {
            return;
        }

        assert_eq!(record.exit_code, 3);
        assert!(record.stdout.contains("before-exit"), "{:?}", record.stdout);
    }

    #[cfg(unix)]
    fn is_zombie(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| {
                stat.rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(true)
    }
}
