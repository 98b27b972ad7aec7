//! Run timeline TSV generation.
//!
//! Appended to `<output_dir>/timeline.tsv` while the run progresses, so the
//! event history survives even when the terminal report is never written.
//!
//! Columns: `timestamp_ms`, kind, attempt, `duration_ms`, `exit_code`, `output_bytes`,
//!          classification, `log_path`, message

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// File name of the timeline inside the output directory.
pub const TIMELINE_FILE_NAME: &str = "timeline.tsv";

/// Timeline event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineKind {
    RunStart,
    AttemptStart,
    AttemptEnd,
    Remediation,
    Backoff,
    RunEnd,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStart => "RUN_START",
            Self::AttemptStart => "ATTEMPT_START",
            Self::AttemptEnd => "ATTEMPT_END",
            Self::Remediation => "REMEDIATION",
            Self::Backoff => "BACKOFF",
            Self::RunEnd => "RUN_END",
        }
    }
}

/// A single row in the timeline file.
#[derive(Debug, Clone)]
pub struct TimelineRow {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub kind: TimelineKind,
    /// Attempt sequence number (optional).
    pub attempt: Option<u32>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub output_bytes: Option<u64>,
    /// Classification label (e.g. `transient_failure:timeout`).
    pub classification: Option<String>,
    pub log_path: Option<String>,
    /// Message field for additional info.
    pub message: String,
}

impl TimelineRow {
    /// Create a new row with required fields.
    pub fn new(timestamp_ms: i64, kind: TimelineKind) -> Self {
        Self {
            timestamp_ms,
            kind,
            attempt: None,
            duration_ms: None,
            exit_code: None,
            output_bytes: None,
            classification: None,
            log_path: None,
            message: String::new(),
        }
    }

    /// Create a row stamped with the current time.
    pub fn now(kind: TimelineKind) -> Self {
        Self::new(chrono::Utc::now().timestamp_millis(), kind)
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_output_bytes(mut self, bytes: u64) -> Self {
        self.output_bytes = Some(bytes);
        self
    }

    pub fn with_classification(mut self, label: impl Into<String>) -> Self {
        self.classification = Some(label.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Format as a TSV line.
    fn to_tsv_line(&self) -> String {
        let attempt = self.attempt.map(|a| a.to_string()).unwrap_or_default();
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        let exit_code = self.exit_code.map(|c| c.to_string()).unwrap_or_default();
        let output_bytes = self.output_bytes.map(|b| b.to_string()).unwrap_or_default();
        let classification = sanitize_field(self.classification.as_deref().unwrap_or(""));
        let log_path = sanitize_field(self.log_path.as_deref().unwrap_or(""));
        let message = sanitize_field(&self.message);

        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.timestamp_ms,
            self.kind.as_str(),
            attempt,
            duration,
            exit_code,
            output_bytes,
            classification,
            log_path,
            message,
        )
    }
}

/// Sanitize a field value to prevent TSV breakage.
fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// TSV header row.
const HEADER: &str =
    "timestamp_ms\tkind\tattempt\tduration_ms\texit_code\toutput_bytes\tclassification\tlog_path\tmessage";

/// Appending writer for timeline files.
pub struct TimelineWriter {
    writer: BufWriter<File>,
}

impl std::fmt::Debug for TimelineWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineWriter")
            .field("writer", &"BufWriter<File>")
            .finish()
    }
}

impl TimelineWriter {
    /// Open a timeline, writing the header if the file is new.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        let exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        if !exists {
            writeln!(writer, "{HEADER}")?;
            writer.flush()?;
        }

        Ok(Self { writer })
    }

    /// Write a row and flush it to disk.
    pub fn write_row(&mut self, row: &TimelineRow) -> std::io::Result<()> {
        writeln!(self.writer, "{}", row.to_tsv_line())?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn row_with_all_fields() {
        let row = TimelineRow::new(1769687952715, TimelineKind::AttemptEnd)
            .with_attempt(2)
            .with_duration_ms(658)
            .with_exit_code(1)
            .with_output_bytes(84)
            .with_classification("content_failure")
            .with_log_path("/out/attempt-02.log")
            .with_message("assertion failed");

        let line = row.to_tsv_line();
        assert_eq!(
            line,
            "1769687952715\tATTEMPT_END\t2\t658\t1\t84\tcontent_failure\t/out/attempt-02.log\tassertion failed"
        );
    }

    #[test]
    fn row_with_minimal_fields() {
        let row = TimelineRow::new(1000, TimelineKind::RunStart).with_message("npm test");
        let line = row.to_tsv_line();
        assert_eq!(line, "1000\tRUN_START\t\t\t\t\t\t\tnpm test");
        assert_eq!(line.split('\t').count(), HEADER.split('\t').count());
    }

    #[test]
    fn sanitize_field_removes_control_chars() {
        let sanitized = sanitize_field("line1\nline2\twith\ttabs\rcarriage");
        assert!(!sanitized.contains('\t'));
        assert!(!sanitized.contains('\n'));
        assert!(!sanitized.contains('\r'));
    }

    #[test]
    fn writer_creates_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TIMELINE_FILE_NAME);

        {
            let mut writer = TimelineWriter::new(&path).unwrap();
            writer
                .write_row(&TimelineRow::new(1000, TimelineKind::AttemptStart).with_attempt(1))
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("1000\tATTEMPT_START\t1"));
    }

    #[test]
    fn writer_appends_without_duplicate_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TIMELINE_FILE_NAME);

        {
            let mut writer = TimelineWriter::new(&path).unwrap();
            writer
                .write_row(&TimelineRow::new(1000, TimelineKind::RunStart))
                .unwrap();
        }
        {
            let mut writer = TimelineWriter::new(&path).unwrap();
            writer
                .write_row(&TimelineRow::new(2000, TimelineKind::RunEnd))
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].contains("RUN_START"));
        assert!(lines[2].contains("RUN_END"));
    }
}
