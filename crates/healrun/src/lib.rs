//! healrun - self-healing test-execution orchestrator
//!
//! Runs a test command, classifies each failure as content, transient or
//! infrastructure, and retries or remediates accordingly.

pub mod executor;
pub mod orchestrator;
pub mod remediation;

pub use executor::{Executor, ExecutorConfig, ExecutorError};
pub use orchestrator::{
    backoff_delay, decide, Decision, Orchestrator, OrchestratorError, RunOutcome,
};
pub use remediation::{
    apply_patch_atomically, engine_for, select_candidate_files, CandidateFile, CommandEngine,
    FileChange, FixRequest, NoopEngine, Patch, RemediationApplier, RemediationEngine,
    RemediationError,
};

/// Process exit code for configuration errors (`EX_CONFIG`).
pub const CONFIG_ERROR_EXIT_CODE: i32 = 78;
