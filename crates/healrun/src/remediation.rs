//! Remediation applier and engine interface.
//!
//! The applier selects candidate files from a content failure, asks a
//! [`RemediationEngine`] for a patch, and applies the patch all-or-nothing.
//! Engines only ever see a [`FixRequest`] and answer with an optional
//! [`Patch`]; they never touch the filesystem through the applier.

use crate::executor::{kill_group, shell_command};
use async_trait::async_trait;
use healrun_core::{Attempt, Classification, RemediationResult, RunConfiguration};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Maximum number of candidate files sent to an engine.
pub const MAX_CANDIDATE_FILES: usize = 8;

/// Largest candidate file whose contents are included in a request.
const MAX_CANDIDATE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remediation engine failed with exit code {code:?}: {stderr}")]
    EngineFailed { code: Option<i32>, stderr: String },
    #[error("remediation engine timed out after {0} ms")]
    EngineTimeout(u64),
    #[error("remediation engine returned an invalid patch: {0}")]
    InvalidPatch(#[from] serde_json::Error),
    #[error("patch path escapes the working directory: {}", .0.display())]
    PathEscapesWorkingDir(PathBuf),
}

pub type Result<T> = std::result::Result<T, RemediationError>;

/// A file offered to the engine as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFile {
    /// Path relative to the working directory.
    pub path: PathBuf,
    pub contents: String,
}

/// Input handed to a remediation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRequest {
    /// Failing-assertion summary from the classifier.
    pub details: String,
    pub candidate_files: Vec<CandidateFile>,
    /// Sequence number of the failed attempt.
    pub attempt: u32,
}

/// Full replacement contents for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub contents: String,
}

/// Changes proposed by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<FileChange>,
}

/// Capability that turns failure details into a patch.
///
/// `Ok(None)` means the engine has nothing to offer; `Err` means it could
/// not be consulted. The applier treats both as "no change".
#[async_trait]
pub trait RemediationEngine: Send + Sync {
    async fn request_fix(&self, request: &FixRequest) -> Result<Option<Patch>>;

    /// Short name used in logs and result descriptions.
    fn name(&self) -> &'static str;
}

/// Engine used when nothing is configured. Never proposes a change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngine;

#[async_trait]
impl RemediationEngine for NoopEngine {
    async fn request_fix(&self, _request: &FixRequest) -> Result<Option<Patch>> {
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Engine backed by an external command.
///
/// The command runs through `sh -c` in the working directory, receives the
/// [`FixRequest`] as JSON on stdin and prints a [`Patch`] as JSON on stdout.
/// Empty stdout means no change.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandEngine {
    pub fn new(
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// Run the engine command, killing its whole process group on timeout.
    async fn run(&self, input: Vec<u8>) -> Result<std::process::Output> {
        let mut cmd = shell_command(&self.command);
        cmd.current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pgid = child.id();

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The engine may exit without reading its input.
                if let Err(err) = stdin.write_all(&input).await {
                    debug!(error = %err, "remediation engine closed stdin early");
                }
            }
        };
        let waited = tokio::time::timeout(self.timeout, async move {
            tokio::join!(feed, child.wait_with_output())
        })
        .await;
        match waited {
            Ok(((), output)) => Ok(output?),
            Err(_) => {
                warn!(
                    command = %self.command,
                    "remediation engine timed out; killing process group"
                );
                kill_group(pgid);
                Err(RemediationError::EngineTimeout(self.timeout.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl RemediationEngine for CommandEngine {
    async fn request_fix(&self, request: &FixRequest) -> Result<Option<Patch>> {
        let input = serde_json::to_vec(request)?;
        debug!(
            command = %self.command,
            candidates = request.candidate_files.len(),
            "invoking remediation command"
        );

        let output = self.run(input).await?;

        if !output.status.success() {
            return Err(RemediationError::EngineFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let patch: Patch = serde_json::from_str(stdout.trim())?;
        Ok(Some(patch))
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Pick the engine described by the configuration.
pub fn engine_for(config: &RunConfiguration) -> Arc<dyn RemediationEngine> {
    match &config.remediation_cmd {
        Some(cmd) => Arc::new(CommandEngine::new(
            cmd.clone(),
            config.working_dir.clone(),
            Duration::from_millis(config.remediation_timeout_ms),
        )),
        None => Arc::new(NoopEngine),
    }
}

/// Applies engine patches to the working tree.
#[derive(Clone)]
pub struct RemediationApplier {
    engine: Arc<dyn RemediationEngine>,
}

impl std::fmt::Debug for RemediationApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationApplier")
            .field("engine", &self.engine.name())
            .finish()
    }
}

impl RemediationApplier {
    pub fn new(engine: Arc<dyn RemediationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Try to fix the failure recorded in `attempt`.
    ///
    /// Never fails: an unavailable engine, an empty answer or a rejected
    /// patch all come back as `changed = false`.
    pub async fn attempt(&self, attempt: &Attempt, config: &RunConfiguration) -> RemediationResult {
        let details = match &attempt.classification {
            Classification::ContentFailure { details } => details.clone(),
            other => {
                warn!(
                    attempt = attempt.sequence,
                    classification = %other.label(),
                    "remediation requested for non-content failure"
                );
                return RemediationResult::unchanged("not a content failure");
            }
        };

        let working_dir = &config.working_dir;
        let candidate_files = select_candidate_files(&details, working_dir)
            .into_iter()
            .filter_map(|path| read_candidate(working_dir, path))
            .collect::<Vec<_>>();

        let request = FixRequest {
            details,
            candidate_files,
            attempt: attempt.sequence,
        };
        info!(
            attempt = attempt.sequence,
            engine = self.engine.name(),
            candidates = request.candidate_files.len(),
            "requesting remediation"
        );

        let patch = match self.engine.request_fix(&request).await {
            Ok(Some(patch)) => patch,
            Ok(None) => {
                info!(attempt = attempt.sequence, "remediation engine proposed no change");
                return RemediationResult::unchanged(format!(
                    "{} engine proposed no change",
                    self.engine.name()
                ));
            }
            Err(err) => {
                warn!(attempt = attempt.sequence, error = %err, "remediation engine unavailable");
                return RemediationResult::unchanged(format!(
                    "{} engine unavailable: {err}",
                    self.engine.name()
                ));
            }
        };

        match apply_patch_atomically(working_dir, &patch) {
            Ok(files) if files.is_empty() => {
                info!(attempt = attempt.sequence, "patch left every file unchanged");
                RemediationResult::unchanged(non_empty_or(&patch.description, "patch was empty"))
            }
            Ok(files) => {
                info!(
                    attempt = attempt.sequence,
                    files = files.len(),
                    "remediation applied"
                );
                RemediationResult::applied(
                    files,
                    non_empty_or(&patch.description, "remediation applied"),
                )
            }
            Err(err) => {
                warn!(attempt = attempt.sequence, error = %err, "patch rejected");
                RemediationResult::unchanged(format!("patch rejected: {err}"))
            }
        }
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn read_candidate(working_dir: &Path, path: PathBuf) -> Option<CandidateFile> {
    let full = working_dir.join(&path);
    match std::fs::metadata(&full) {
        Ok(meta) if meta.len() > MAX_CANDIDATE_BYTES => {
            debug!(path = %path.display(), bytes = meta.len(), "candidate too large, skipping");
            return None;
        }
        Err(_) => return None,
        Ok(_) => {}
    }
    let bytes = std::fs::read(&full).ok()?;
    Some(CandidateFile {
        path,
        contents: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

static PATH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Python: File "tests/test_x.py", line 12
        r#"File "([^"]+)", line \d+"#,
        // JS stack frame: at name (src/x.js:10:5)
        r"\(([^()\s]+?):\d+:\d+\)",
        // Generic path:line, e.g. src/lib.rs:42 or tests/x.test.ts:7:3
        r"([A-Za-z0-9_./\\-]*[A-Za-z0-9_-]\.[A-Za-z0-9]+):\d+",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid path pattern"))
    .collect()
});

/// Extract files mentioned in failure details.
///
/// Returns paths relative to `working_dir`, in order of first mention, for
/// existing regular files inside it. At most [`MAX_CANDIDATE_FILES`].
pub fn select_candidate_files(details: &str, working_dir: &Path) -> Vec<PathBuf> {
    let Ok(root) = working_dir.canonicalize() else {
        return Vec::new();
    };

    let mut mentions: Vec<(usize, &str)> = PATH_PATTERNS
        .iter()
        .flat_map(|re| {
            re.captures_iter(details)
                .filter_map(|caps| caps.get(1))
                .map(|m| (m.start(), m.as_str()))
        })
        .collect();
    mentions.sort_by_key(|(pos, _)| *pos);

    let mut selected: Vec<PathBuf> = Vec::new();
    for (_, raw) in mentions {
        if selected.len() >= MAX_CANDIDATE_FILES {
            break;
        }
        let raw = raw.trim_start_matches("file://");
        let candidate = Path::new(raw);
        let full = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };
        let Ok(resolved) = full.canonicalize() else {
            continue;
        };
        if !resolved.is_file() {
            continue;
        }
        let Ok(relative) = resolved.strip_prefix(&root) else {
            continue;
        };
        let relative = relative.to_path_buf();
        if !selected.contains(&relative) {
            selected.push(relative);
        }
    }
    selected
}

/// Reject absolute paths and `..` components.
fn check_relative(path: &Path) -> Result<()> {
    let escapes = path.as_os_str().is_empty()
        || path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes {
        return Err(RemediationError::PathEscapesWorkingDir(path.to_path_buf()));
    }
    Ok(())
}

struct Staged {
    relative: PathBuf,
    target: PathBuf,
    temp: NamedTempFile,
    backup: Option<Vec<u8>>,
}

/// Apply a patch all-or-nothing.
///
/// Every changed file is staged as a sibling temp file first; nothing is
/// renamed into place until all stages succeed. If a rename fails, files
/// already replaced are restored from their backups. Files whose contents
/// already match are skipped. Returns the relative paths that changed.
pub fn apply_patch_atomically(working_dir: &Path, patch: &Patch) -> Result<Vec<PathBuf>> {
    for change in &patch.files {
        check_relative(&change.path)?;
    }

    let mut staged: Vec<Staged> = Vec::new();
    for change in &patch.files {
        let target = working_dir.join(&change.path);
        if staged.iter().any(|s| s.relative == change.path) {
            debug!(path = %change.path.display(), "duplicate path in patch, last write wins");
            staged.retain(|s| s.relative != change.path);
        }
        let backup = std::fs::read(&target).ok();
        if backup.as_deref() == Some(change.contents.as_bytes()) {
            debug!(path = %change.path.display(), "patch contents identical, skipping");
            continue;
        }

        let parent = target.parent().unwrap_or(working_dir);
        std::fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(change.contents.as_bytes())?;
        temp.as_file().sync_all()?;

        staged.push(Staged {
            relative: change.path.clone(),
            target,
            temp,
            backup,
        });
    }

    let mut committed: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::new();
    let mut changed = Vec::with_capacity(staged.len());
    for stage in staged {
        match stage.temp.persist(&stage.target) {
            Ok(_) => {
                changed.push(stage.relative);
                committed.push((stage.target, stage.backup));
            }
            Err(err) => {
                warn!(
                    path = %stage.target.display(),
                    error = %err.error,
                    restored = committed.len(),
                    "failed to replace file, rolling back"
                );
                rollback(&committed);
                return Err(RemediationError::Io(err.error));
            }
        }
    }

    Ok(changed)
}

fn rollback(committed: &[(PathBuf, Option<Vec<u8>>)]) {
    for (target, backup) in committed.iter().rev() {
        let restored = match backup {
            Some(bytes) => std::fs::write(target, bytes),
            None => std::fs::remove_file(target),
        };
        if let Err(err) = restored {
            warn!(path = %target.display(), error = %err, "rollback failed");
        }
    }
}
