//! Core types for the test orchestrator.
//!
//! Execution records, classifications, attempts and the run lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Exit code recorded when the command was killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Exit code recorded when the command could not be spawned at all.
pub const SPAWN_ERROR_EXIT_CODE: i32 = -2;

/// Exit code recorded when the command was killed by an external abort.
pub const CANCELLED_EXIT_CODE: i32 = -3;

/// Unique identifier for runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Execution ---

/// Completion record for a single command execution.
///
/// Expected failure modes (nonzero exit, timeout, spawn failure, abort) are
/// all encoded here rather than surfaced as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub command: String,
    /// Process exit code, or one of the reserved sentinels.
    pub exit_code: i32,
    /// Signal that terminated the process, if any (unix only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Whether either stream exceeded the in-memory capture limit.
    pub truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Spawn failure message when the process never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_path: Option<PathBuf>,
}

impl ExecutionRecord {
    /// Build a record for a command that never started.
    pub fn spawn_failure(command: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            command: command.into(),
            exit_code: SPAWN_ERROR_EXIT_CODE,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            timed_out: false,
            cancelled: false,
            spawn_error: Some(message.into()),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            log_path: None,
            tail_path: None,
        }
    }

    /// Whether the process ran to completion and exited zero.
    pub fn is_clean_exit(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled && self.spawn_error.is_none()
    }

    /// Stdout and stderr joined for signature scanning.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

// --- Classification ---

/// Kind of environmental failure that warrants a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    NetworkUnreachable,
    CorporateProxyBlock,
    DnsFailure,
    Timeout,
}

impl TransientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkUnreachable => "network_unreachable",
            Self::CorporateProxyBlock => "corporate_proxy_block",
            Self::DnsFailure => "dns_failure",
            Self::Timeout => "timeout",
        }
    }
}

/// Outcome of classifying one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    Success,
    /// The code under test is broken.
    ContentFailure { details: String },
    /// The environment got in the way; retrying may help.
    TransientFailure {
        subtype: TransientKind,
        evidence: String,
    },
    /// The execution environment itself failed.
    InfrastructureFailure { reason: String },
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFailure { .. })
    }

    /// Short label for timelines and logs, e.g. `transient_failure:dns_failure`.
    pub fn label(&self) -> String {
        match self {
            Self::Success => "success".to_string(),
            Self::ContentFailure { .. } => "content_failure".to_string(),
            Self::TransientFailure { subtype, .. } => {
                format!("transient_failure:{}", subtype.as_str())
            }
            Self::InfrastructureFailure { .. } => "infrastructure_failure".to_string(),
        }
    }
}

// --- Remediation ---

/// Outcome of one remediation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationResult {
    /// Whether at least one file was changed on disk.
    pub changed: bool,
    /// Paths (relative to the working directory) that were modified.
    pub files: Vec<PathBuf>,
    pub description: String,
}

impl RemediationResult {
    pub fn unchanged(description: impl Into<String>) -> Self {
        Self {
            changed: false,
            files: Vec::new(),
            description: description.into(),
        }
    }

    pub fn applied(files: Vec<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            changed: !files.is_empty(),
            files,
            description: description.into(),
        }
    }
}

// --- Attempts and runs ---

/// One execution cycle of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based sequence number, gapless within a run.
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    pub truncated: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_path: Option<PathBuf>,
    pub classification: Classification,
    pub remediation: Option<RemediationResult>,
}

impl Attempt {
    /// Build an attempt from its execution record and the classification
    /// computed for it. The classification is never recomputed afterwards.
    pub fn from_record(
        sequence: u32,
        record: ExecutionRecord,
        classification: Classification,
    ) -> Self {
        Self {
            sequence,
            started_at: record.started_at,
            ended_at: record.ended_at,
            duration_ms: record.duration_ms,
            exit_code: record.exit_code,
            timed_out: record.timed_out,
            truncated: record.truncated,
            stdout: record.stdout,
            stderr: record.stderr,
            log_path: record.log_path,
            tail_path: record.tail_path,
            classification,
            remediation: None,
        }
    }

    /// Whether a remediation changed files after this attempt.
    pub fn remediation_applied(&self) -> bool {
        self.remediation.as_ref().is_some_and(|r| r.changed)
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    FailedContent,
    FailedExhausted,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::FailedContent => "failed_content",
            Self::FailedExhausted => "failed_exhausted",
            Self::Aborted => "aborted",
        }
    }

    /// Process exit code for calling automation.
    ///
    /// Nonzero codes follow sysexits.h so they never collide with clap's
    /// usage error (2).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::FailedContent => 1,
            Self::FailedExhausted => 75,
            Self::Aborted => 70,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator control-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestratorState {
    Pending,
    Running,
    Remediating,
    Retrying,
    Succeeded,
    FailedContent,
    FailedExhausted,
    Aborted,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Remediating => "REMEDIATING",
            Self::Retrying => "RETRYING",
            Self::Succeeded => "SUCCEEDED",
            Self::FailedContent => "FAILED_CONTENT",
            Self::FailedExhausted => "FAILED_EXHAUSTED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedContent | Self::FailedExhausted | Self::Aborted
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Remediating -> Running` and `Retrying -> Running` are the only
    /// re-entrant edges. Any live state may abort.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (
                Self::Running,
                Self::Succeeded
                | Self::Remediating
                | Self::Retrying
                | Self::FailedContent
                | Self::FailedExhausted,
            ) => true,
            (Self::Remediating, Self::Running | Self::FailedContent) => true,
            (Self::Retrying, Self::Running) => true,
            (from, Self::Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    /// The terminal state that corresponds to a run status.
    pub fn terminal_for(status: RunStatus) -> Self {
        match status {
            RunStatus::Passed => Self::Succeeded,
            RunStatus::FailedContent => Self::FailedContent,
            RunStatus::FailedExhausted => Self::FailedExhausted,
            RunStatus::Aborted => Self::Aborted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(exit_code: i32) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            command: "true".to_string(),
            exit_code,
            signal: None,
            stdout: "out".to_string(),
            stderr: String::new(),
            truncated: false,
            timed_out: false,
            cancelled: false,
            spawn_error: None,
            started_at: now,
            ended_at: now,
            duration_ms: 5,
            log_path: None,
            tail_path: None,
        }
    }

    #[test]
    fn classification_serializes_with_kind_tag() {
        let c = Classification::TransientFailure {
            subtype: TransientKind::DnsFailure,
            evidence: "getaddrinfo ENOTFOUND".to_string(),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["kind"], "transient_failure");
        assert_eq!(json["subtype"], "dns_failure");

        let json = serde_json::to_value(Classification::Success).unwrap();
        assert_eq!(json["kind"], "success");
    }

    #[test]
    fn classification_labels() {
        assert_eq!(Classification::Success.label(), "success");
        let c = Classification::TransientFailure {
            subtype: TransientKind::CorporateProxyBlock,
            evidence: String::new(),
        };
        assert_eq!(c.label(), "transient_failure:corporate_proxy_block");
        assert!(c.is_transient());
    }

    #[test]
    fn clean_exit_requires_zero_and_no_flags() {
        assert!(record(0).is_clean_exit());
        assert!(!record(1).is_clean_exit());

        let mut timed_out = record(0);
        timed_out.timed_out = true;
        assert!(!timed_out.is_clean_exit());

        let spawn = ExecutionRecord::spawn_failure("nope", "not found");
        assert_eq!(spawn.exit_code, SPAWN_ERROR_EXIT_CODE);
        assert!(!spawn.is_clean_exit());
    }

    #[test]
    fn combined_output_joins_streams() {
        let mut r = record(1);
        r.stderr = "err".to_string();
        assert_eq!(r.combined_output(), "out\nerr");
        r.stdout.clear();
        assert_eq!(r.combined_output(), "err");
    }

    #[test]
    fn attempt_takes_fields_from_record() {
        let attempt = Attempt::from_record(3, record(1), Classification::Success);
        assert_eq!(attempt.sequence, 3);
        assert_eq!(attempt.exit_code, 1);
        assert_eq!(attempt.stdout, "out");
        assert!(attempt.remediation.is_none());
        assert!(!attempt.remediation_applied());
    }

    #[test]
    fn remediation_applied_requires_files() {
        assert!(!RemediationResult::applied(Vec::new(), "nothing").changed);
        let r = RemediationResult::applied(vec![PathBuf::from("src/a.rs")], "fix");
        assert!(r.changed);
    }

    #[test]
    fn run_status_exit_codes_are_distinct() {
        let codes = [
            RunStatus::Passed.exit_code(),
            RunStatus::FailedContent.exit_code(),
            RunStatus::FailedExhausted.exit_code(),
            RunStatus::Aborted.exit_code(),
        ];
        assert_eq!(codes[0], 0);
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn state_machine_edges() {
        use OrchestratorState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Remediating));
        assert!(Remediating.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Retrying.can_transition_to(Aborted));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Retrying.can_transition_to(Remediating));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Aborted.can_transition_to(Aborted));
    }

    #[test]
    fn id_is_time_ordered() {
        let a = Id::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Id::new();
        assert!(a.0 < b.0);
    }
}
