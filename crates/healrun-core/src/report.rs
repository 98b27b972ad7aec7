//! Terminal run report.
//!
//! Written once per run to `<output_dir>/report.json`.

use crate::config::RunConfiguration;
use crate::types::{Attempt, Id, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the report inside the output directory.
pub const REPORT_FILE_NAME: &str = "report.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// The terminal artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Id,
    pub command: String,
    pub config: RunConfiguration,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: u64,
    /// Ordered by sequence number, starting at 1, without gaps.
    pub attempts: Vec<Attempt>,
    pub retries_used: u32,
    pub remediations_used: u32,
    /// Fatal error that aborted the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    /// Paths of every file changed by remediation, in application order.
    pub fn remediated_files(&self) -> Vec<&Path> {
        self.attempts
            .iter()
            .filter_map(|a| a.remediation.as_ref())
            .filter(|r| r.changed)
            .flat_map(|r| r.files.iter().map(PathBuf::as_path))
            .collect()
    }

    /// Number of attempts followed by an applied remediation.
    pub fn applied_remediations(&self) -> usize {
        self.attempts.iter().filter(|a| a.remediation_applied()).count()
    }

    /// Whether attempt sequence numbers run 1..=n without gaps.
    pub fn is_gapless(&self) -> bool {
        self.attempts
            .iter()
            .enumerate()
            .all(|(i, a)| a.sequence as usize == i + 1)
    }

    /// One line per attempt explaining the classification chain.
    pub fn summary_lines(&self) -> Vec<String> {
        self.attempts
            .iter()
            .map(|a| {
                let mut line = format!(
                    "attempt {}: exit {} -> {}",
                    a.sequence,
                    a.exit_code,
                    a.classification.label()
                );
                if let Some(r) = &a.remediation {
                    if r.changed {
                        line.push_str(&format!(" (remediated {} file(s))", r.files.len()));
                    } else {
                        line.push_str(" (no remediation applied)");
                    }
                }
                line
            })
            .collect()
    }

    /// Write `report.json` into `dir` via temp file and rename.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE_NAME);
        let tmp_path = dir.join(format!("{REPORT_FILE_NAME}.tmp"));

        let json = serde_json::to_vec_pretty(self)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(path)
    }

    /// Read a report back from disk.
    pub fn read_json(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
