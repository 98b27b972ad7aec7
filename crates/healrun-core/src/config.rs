//! Run configuration.
//!
//! Config files use the `key=value` line format.
//! Precedence: CLI flags > `--config` file > `<working_dir>/.healrun/config` > defaults.

use crate::types::Id;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Location of the per-project config file, relative to the working directory.
pub const PROJECT_CONFIG_PATH: &str = ".healrun/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid environment override: {0} (expected KEY=VALUE)")]
    InvalidEnv(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable input for one orchestrator invocation.
///
/// Built once (defaults, files, CLI), resolved, validated, and then only
/// ever borrowed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Shell command line under test.
    pub command: String,
    pub working_dir: PathBuf,
    /// Where logs and the report go. Empty until resolved.
    pub output_dir: PathBuf,
    /// Per-attempt wall-clock timeout.
    pub timeout_ms: u64,
    /// Retries allowed for transient failures (0 = run once).
    pub max_retries: u32,
    pub max_remediations: u32,
    pub remediation_enabled: bool,
    /// External command that answers fix requests (see `remediation`).
    pub remediation_cmd: Option<String>,
    pub remediation_timeout_ms: u64,
    /// Environment overrides applied to the command.
    pub env: BTreeMap<String, String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// In-memory capture limit per stream.
    pub max_output_bytes: usize,
    /// Mirror command output to the console as it arrives.
    pub echo_output: bool,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            command: String::new(),
            working_dir: PathBuf::from("."),
            output_dir: PathBuf::new(),
            timeout_ms: 600_000,
            max_retries: 2,
            max_remediations: 1,
            remediation_enabled: false,
            remediation_cmd: None,
            remediation_timeout_ms: 300_000,
            env: BTreeMap::new(),
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_output_bytes: 8 * 1024 * 1024,
            echo_output: true,
        }
    }
}

impl RunConfiguration {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Merge `<working_dir>/.healrun/config` if it exists.
    ///
    /// Returns the path that was loaded.
    pub fn load_project_file(&mut self) -> Result<Option<PathBuf>, ConfigError> {
        let path = self.working_dir.join(PROJECT_CONFIG_PATH);
        if !path.is_file() {
            return Ok(None);
        }
        self.load_file(&path)?;
        Ok(Some(path))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "command" => self.command = value.to_string(),
            "working_dir" => self.working_dir = PathBuf::from(value),
            "output_dir" => self.output_dir = PathBuf::from(value),
            "timeout_sec" => {
                let secs: u64 = Self::parse_num(key, value)?;
                self.timeout_ms = secs.saturating_mul(1000);
            }
            "timeout_ms" => self.timeout_ms = Self::parse_num(key, value)?,
            "max_retries" => self.max_retries = Self::parse_num(key, value)?,
            "max_remediations" => self.max_remediations = Self::parse_num(key, value)?,
            "remediation_enabled" => self.remediation_enabled = Self::parse_bool(key, value)?,
            "remediation_cmd" => {
                self.remediation_cmd = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "remediation_timeout_sec" => {
                let secs: u64 = Self::parse_num(key, value)?;
                self.remediation_timeout_ms = secs.saturating_mul(1000);
            }
            "backoff_base_ms" => self.backoff_base_ms = Self::parse_num(key, value)?,
            "backoff_max_ms" => self.backoff_max_ms = Self::parse_num(key, value)?,
            "max_output_bytes" => self.max_output_bytes = Self::parse_num(key, value)?,
            "echo_output" => self.echo_output = Self::parse_bool(key, value)?,
            "env" => {
                for pair in value.split_whitespace() {
                    let (k, v) = Self::parse_env_pair(pair)?;
                    self.env.insert(k, v);
                }
            }
            _ => {
                // Unknown keys warn but don't fail.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a `KEY=VALUE` environment override.
    pub fn parse_env_pair(pair: &str) -> Result<(String, String), ConfigError> {
        match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
            _ => Err(ConfigError::InvalidEnv(pair.to_string())),
        }
    }

    /// Resolve the output directory for a run.
    ///
    /// Unset: `<working_dir>/.healrun/runs/run-<run_id>`. Relative paths are
    /// taken relative to the working directory.
    pub fn resolve_paths(&mut self, run_id: &Id) {
        if self.output_dir.as_os_str().is_empty() {
            self.output_dir = self
                .working_dir
                .join(".healrun/runs")
                .join(format!("run-{run_id}"));
        } else if self.output_dir.is_relative() {
            self.output_dir = self.working_dir.join(&self.output_dir);
        }
    }

    /// Check input constraints before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid("command must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout must be positive".to_string()));
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "backoff_base_ms must be positive".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_max_ms ({}) must be >= backoff_base_ms ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_output_bytes must be positive".to_string(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("output_dir is not resolved".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid() -> RunConfiguration {
        RunConfiguration {
            command: "npm test".to_string(),
            output_dir: PathBuf::from("/tmp/out"),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let config = RunConfiguration::default();
        assert_eq!(config.timeout_ms, 600_000);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_remediations, 1);
        assert!(!config.remediation_enabled);
        assert!(config.remediation_cmd.is_none());
        assert!(config.echo_output);
        assert_eq!(config.working_dir, PathBuf::from("."));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = RunConfiguration::default();
        let content = r#"
# comment
command="npm test -- --ci"
timeout_sec=90
max_retries=4
remediation_enabled=yes
remediation_cmd='./fixer.sh'
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.command, "npm test -- --ci");
        assert_eq!(config.timeout_ms, 90_000);
        assert_eq!(config.max_retries, 4);
        assert!(config.remediation_enabled);
        assert_eq!(config.remediation_cmd.as_deref(), Some("./fixer.sh"));
    }

    #[test]
    fn timeout_ms_overrides_seconds() {
        let mut config = RunConfiguration::default();
        config.parse_content("timeout_sec=5\ntimeout_ms=250").unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn remediation_timeout_is_given_in_seconds() {
        let mut config = RunConfiguration::default();
        assert_eq!(config.remediation_timeout_ms, 300_000);
        config.parse_content("remediation_timeout_sec=45").unwrap();
        assert_eq!(config.remediation_timeout_ms, 45_000);
        assert!(config.parse_content("remediation_timeout_sec=soon").is_err());
    }

    #[test]
    fn parse_env_overrides() {
        let mut config = RunConfiguration::default();
        config
            .parse_content("env=\"CI=1 NODE_OPTIONS=--max-old-space-size=4096\"")
            .unwrap();
        assert_eq!(config.env.get("CI").map(String::as_str), Some("1"));
        assert_eq!(
            config.env.get("NODE_OPTIONS").map(String::as_str),
            Some("--max-old-space-size=4096")
        );
    }

    #[test]
    fn parse_env_rejects_missing_key() {
        let mut config = RunConfiguration::default();
        let err = config.parse_content("env==value").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv(_)));
    }

    #[test]
    fn parse_rejects_line_without_equals() {
        let mut config = RunConfiguration::default();
        let err = config.parse_content("just words").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn parse_rejects_bad_numbers_and_bools() {
        let mut config = RunConfiguration::default();
        assert!(matches!(
            config.parse_content("max_retries=lots"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("echo_output=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = RunConfiguration::default();
        config.parse_content("flux_capacitor=on").unwrap();
        assert_eq!(config, RunConfiguration::default());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(RunConfiguration::unquote("\"hello\""), "hello");
        assert_eq!(RunConfiguration::unquote("'world'"), "world");
        assert_eq!(RunConfiguration::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn resolve_paths_defaults_under_working_dir() {
        let mut config = RunConfiguration {
            working_dir: PathBuf::from("/repo"),
            ..Default::default()
        };
        config.resolve_paths(&Id::from_string("abc"));
        assert_eq!(config.output_dir, PathBuf::from("/repo/.healrun/runs/run-abc"));

        let mut config = RunConfiguration {
            working_dir: PathBuf::from("/repo"),
            output_dir: PathBuf::from("out"),
            ..Default::default()
        };
        config.resolve_paths(&Id::from_string("abc"));
        assert_eq!(config.output_dir, PathBuf::from("/repo/out"));
    }

    #[test]
    fn validate_enforces_input_constraints() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.command = "   ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.backoff_max_ms = config.backoff_base_ms - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn project_file_is_loaded_when_present() {
        let dir = TempDir::new().unwrap();
        let mut config = RunConfiguration {
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.load_project_file().unwrap().is_none());

        std::fs::create_dir_all(dir.path().join(".healrun")).unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_PATH), "max_remediations=3\n").unwrap();
        let loaded = config.load_project_file().unwrap();
        assert_eq!(loaded, Some(dir.path().join(PROJECT_CONFIG_PATH)));
        assert_eq!(config.max_remediations, 3);
    }
}
