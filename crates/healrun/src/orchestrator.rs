//! Orchestrator control loop.
//!
//! Drives one run through the state machine: execute, classify, then
//! finish, remediate, or back off and retry. This is the only place that
//! decides on retries and termination. Attempts run strictly one at a time.

use crate::executor::{Executor, ExecutorConfig};
use crate::remediation::{RemediationApplier, RemediationEngine};
use chrono::Utc;
use healrun_core::timeline::TIMELINE_FILE_NAME;
use healrun_core::{
    classify, Attempt, Classification, ConfigError, Id, OrchestratorState, ReportError,
    RunConfiguration, RunReport, RunStatus, TimelineKind, TimelineRow, TimelineWriter,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("output directory {path} is not writable: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write report: {0}")]
    Report(#[from] ReportError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// What the loop does after an attempt has been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Finish(RunStatus),
    Remediate,
    Retry { delay: Duration },
}

/// Map a classification and the budgets spent so far to the next step.
///
/// A content failure that outlives the remediation budget after at least
/// one applied change is `FailedExhausted`; the change stays on disk.
pub fn decide(
    classification: &Classification,
    config: &RunConfiguration,
    retries_used: u32,
    remediations_used: u32,
    remediations_applied: u32,
) -> Decision {
    match classification {
        Classification::Success => Decision::Finish(RunStatus::Passed),
        Classification::ContentFailure { .. } => {
            if config.remediation_enabled && remediations_used < config.max_remediations {
                Decision::Remediate
            } else if remediations_applied > 0 {
                Decision::Finish(RunStatus::FailedExhausted)
            } else {
                Decision::Finish(RunStatus::FailedContent)
            }
        }
        Classification::TransientFailure { .. } => {
            if retries_used < config.max_retries {
                Decision::Retry {
                    delay: backoff_delay(
                        config.backoff_base_ms,
                        config.backoff_max_ms,
                        retries_used,
                    ),
                }
            } else {
                Decision::Finish(RunStatus::FailedExhausted)
            }
        }
        Classification::InfrastructureFailure { .. } => Decision::Finish(RunStatus::Aborted),
    }
}

/// Delay before the retry that follows `retries_taken` earlier retries:
/// `min(base * 2^retries_taken, max)`.
pub fn backoff_delay(base_ms: u64, max_ms: u64, retries_taken: u32) -> Duration {
    let factor = 1u64.checked_shl(retries_taken).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

/// Result of a finished run.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub report_path: PathBuf,
}

/// Runs a command until it passes or a terminal state is reached.
#[derive(Debug)]
pub struct Orchestrator {
    config: RunConfiguration,
    run_id: Id,
    executor: Executor,
    applier: RemediationApplier,
    cancel_token: CancellationToken,
    state: OrchestratorState,
}

impl Orchestrator {
    /// Resolve and validate `config` for the run `run_id`.
    pub fn new(
        mut config: RunConfiguration,
        run_id: Id,
        engine: Arc<dyn RemediationEngine>,
    ) -> Result<Self> {
        config.resolve_paths(&run_id);
        config.validate()?;
        let executor = Executor::new(ExecutorConfig::from_run_config(&config));
        Ok(Self {
            config,
            run_id,
            executor,
            applier: RemediationApplier::new(engine),
            cancel_token: CancellationToken::new(),
            state: OrchestratorState::Pending,
        })
    }

    /// Use an externally owned abort signal.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    pub fn run_id(&self) -> &Id {
        &self.run_id
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    fn transition(&mut self, next: OrchestratorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        if !self.state.can_transition_to(next) {
            warn!(
                from = self.state.as_str(),
                to = next.as_str(),
                "unexpected state transition"
            );
        }
        debug!(from = self.state.as_str(), to = next.as_str(), "state transition");
        self.state = next;
    }

    /// Drive the run to a terminal state and write the report.
    ///
    /// Only an unusable output directory or a failed report write is an
    /// error; every other outcome is a report status.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let output_dir = self.config.output_dir.clone();
        std::fs::create_dir_all(&output_dir).map_err(|source| OrchestratorError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;
        let timeline_path = output_dir.join(TIMELINE_FILE_NAME);
        let mut timeline =
            TimelineWriter::new(&timeline_path).map_err(|source| OrchestratorError::OutputDir {
                path: timeline_path.clone(),
                source,
            })?;

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            run_id = %self.run_id,
            command = %self.config.command,
            output_dir = %output_dir.display(),
            timeout_sec = self.config.timeout().as_secs(),
            max_retries = self.config.max_retries,
            max_remediations = self.config.max_remediations,
            remediation_enabled = self.config.remediation_enabled,
            engine = self.applier.engine_name(),
            "run started"
        );
        append(
            &mut timeline,
            &TimelineRow::now(TimelineKind::RunStart).with_message(self.config.command.clone()),
        );

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut retries_used = 0u32;
        let mut remediations_used = 0u32;
        let mut remediations_applied = 0u32;
        let mut fatal: Option<String> = None;

        let status = loop {
            self.transition(OrchestratorState::Running);
            let sequence = attempts.len() as u32 + 1;
            append(
                &mut timeline,
                &TimelineRow::now(TimelineKind::AttemptStart).with_attempt(sequence),
            );
            info!(attempt = sequence, "attempt started");

            let record = match self
                .executor
                .execute(
                    sequence,
                    &self.config.command,
                    &self.config.working_dir,
                    self.config.timeout(),
                    &self.config.env,
                    &self.cancel_token,
                )
                .await
            {
                Ok(record) => record,
                Err(err) => {
                    error!(attempt = sequence, error = %err, "executor failed, aborting run");
                    fatal = Some(err.to_string());
                    self.transition(OrchestratorState::Aborted);
                    break RunStatus::Aborted;
                }
            };

            let classification = classify(&record);
            let output_bytes = (record.stdout.len() + record.stderr.len()) as u64;
            let mut attempt = Attempt::from_record(sequence, record, classification);

            let mut end_row = TimelineRow::now(TimelineKind::AttemptEnd)
                .with_attempt(sequence)
                .with_duration_ms(attempt.duration_ms)
                .with_exit_code(attempt.exit_code)
                .with_output_bytes(output_bytes)
                .with_classification(attempt.classification.label())
                .with_message(classification_message(&attempt.classification));
            if let Some(path) = &attempt.log_path {
                end_row = end_row.with_log_path(path.display().to_string());
            }
            append(&mut timeline, &end_row);
            info!(
                attempt = sequence,
                exit_code = attempt.exit_code,
                duration_ms = attempt.duration_ms,
                classification = %attempt.classification.label(),
                "attempt classified"
            );

            match decide(
                &attempt.classification,
                &self.config,
                retries_used,
                remediations_used,
                remediations_applied,
            ) {
                Decision::Finish(status) => {
                    attempts.push(attempt);
                    self.transition(OrchestratorState::terminal_for(status));
                    break status;
                }
                Decision::Remediate => {
                    self.transition(OrchestratorState::Remediating);
                    remediations_used += 1;

                    let result = tokio::select! {
                        result = self.applier.attempt(&attempt, &self.config) => Some(result),
                        () = self.cancel_token.cancelled() => None,
                    };
                    let Some(result) = result else {
                        info!(attempt = sequence, "cancelled during remediation");
                        attempts.push(attempt);
                        self.transition(OrchestratorState::Aborted);
                        break RunStatus::Aborted;
                    };

                    append(
                        &mut timeline,
                        &TimelineRow::now(TimelineKind::Remediation)
                            .with_attempt(sequence)
                            .with_message(format!(
                                "{} file(s) changed: {}",
                                result.files.len(),
                                result.description
                            )),
                    );

                    if result.changed {
                        remediations_applied += 1;
                        info!(
                            attempt = sequence,
                            remediations_used, "remediation applied, re-running"
                        );
                    } else {
                        info!(
                            attempt = sequence,
                            remediations_used, "remediation produced no change, re-running"
                        );
                    }
                    attempt.remediation = Some(result);
                    attempts.push(attempt);
                }
                Decision::Retry { delay } => {
                    attempts.push(attempt);
                    self.transition(OrchestratorState::Retrying);
                    retries_used += 1;

                    let backoff_ms = delay.as_millis() as u64;
                    append(
                        &mut timeline,
                        &TimelineRow::now(TimelineKind::Backoff)
                            .with_attempt(sequence)
                            .with_duration_ms(backoff_ms),
                    );
                    info!(
                        attempt = sequence,
                        retry = retries_used,
                        backoff_ms,
                        "transient failure, backing off"
                    );

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel_token.cancelled() => {
                            info!(attempt = sequence, "cancelled during backoff");
                            self.transition(OrchestratorState::Aborted);
                            break RunStatus::Aborted;
                        }
                    }
                }
            }
        };

        let ended_at = Utc::now();
        let total_duration_ms = clock.elapsed().as_millis() as u64;
        let report = RunReport {
            run_id: self.run_id.clone(),
            command: self.config.command.clone(),
            config: self.config.clone(),
            status,
            started_at,
            ended_at,
            total_duration_ms,
            attempts,
            retries_used,
            remediations_used,
            error: fatal,
        };

        append(
            &mut timeline,
            &TimelineRow::now(TimelineKind::RunEnd)
                .with_duration_ms(total_duration_ms)
                .with_classification(status.as_str())
                .with_message(format!("{} attempt(s)", report.attempts.len())),
        );

        let report_path = report.write_json(&output_dir)?;
        info!(
            run_id = %self.run_id,
            status = %status,
            attempts = report.attempts.len(),
            retries_used,
            remediations_used,
            duration_ms = total_duration_ms,
            report = %report_path.display(),
            "run finished"
        );

        Ok(RunOutcome {
            report,
            report_path,
        })
    }
}

/// Timeline failures never stop a run.
fn append(timeline: &mut TimelineWriter, row: &TimelineRow) {
    if let Err(err) = timeline.write_row(row) {
        warn!(kind = row.kind.as_str(), error = %err, "failed to write timeline row");
    }
}

fn classification_message(classification: &Classification) -> String {
    let text = match classification {
        Classification::Success => return String::new(),
        Classification::ContentFailure { details } => details,
        Classification::TransientFailure { evidence, .. } => evidence,
        Classification::InfrastructureFailure { reason } => reason,
    };
    text.lines().next().unwrap_or_default().to_string()
}
