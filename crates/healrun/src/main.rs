//! healrun - run a test command until it passes or fails for a real reason.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::WrapErr;
use healrun::{engine_for, Orchestrator, RunOutcome, CONFIG_ERROR_EXIT_CODE};
use healrun_core::{Id, RunConfiguration, RunStatus};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "healrun",
    about = "Self-healing test-execution orchestrator",
    version
)]
struct Cli {
    /// Config file (key=value lines), applied over the project config
    #[arg(long, env = "HEALRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Directory the command runs in
    #[arg(long, env = "HEALRUN_WORKING_DIR")]
    working_dir: Option<PathBuf>,

    /// Where attempt logs, the timeline and report.json are written
    #[arg(long, env = "HEALRUN_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Per-attempt timeout in seconds
    #[arg(long, env = "HEALRUN_TIMEOUT_SEC")]
    timeout_sec: Option<u64>,

    /// Retries allowed for transient failures
    #[arg(long, env = "HEALRUN_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Remediation attempts allowed across the run
    #[arg(long, env = "HEALRUN_MAX_REMEDIATIONS")]
    max_remediations: Option<u32>,

    /// Enable remediation of content failures
    #[arg(long, overrides_with = "no_remediate")]
    remediate: bool,

    /// Disable remediation
    #[arg(long, overrides_with = "remediate")]
    no_remediate: bool,

    /// Command that answers fix requests (JSON on stdin, patch on stdout)
    #[arg(long, env = "HEALRUN_REMEDIATION_CMD")]
    remediation_cmd: Option<String>,

    /// Base retry backoff in milliseconds
    #[arg(long)]
    backoff_base_ms: Option<u64>,

    /// Maximum retry backoff in milliseconds
    #[arg(long)]
    backoff_max_ms: Option<u64>,

    /// Environment override for the command (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env_overrides: Vec<String>,

    /// Don't mirror command output to the console
    #[arg(short, long)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Command under test
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let orchestrator = match build_orchestrator(&cli) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!("{err:?}");
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }
    };

    match run(orchestrator) {
        Ok(status) => std::process::exit(status.exit_code()),
        Err(err) => {
            error!("{err:?}");
            std::process::exit(RunStatus::Aborted.exit_code());
        }
    }
}

/// Layer defaults, project config, `--config` and CLI flags.
fn load_config(cli: &Cli) -> eyre::Result<RunConfiguration> {
    let mut config = RunConfiguration::default();
    if let Some(dir) = &cli.working_dir {
        config.working_dir = dir.clone();
    }

    if let Some(path) = config
        .load_project_file()
        .wrap_err("failed to load project config")?
    {
        debug!(path = %path.display(), "loaded project config");
    }
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config file {}", path.display()))?;
    }

    if let Some(dir) = &cli.working_dir {
        config.working_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(secs) = cli.timeout_sec {
        config.timeout_ms = secs.saturating_mul(1000);
    }
    if let Some(n) = cli.max_retries {
        config.max_retries = n;
    }
    if let Some(n) = cli.max_remediations {
        config.max_remediations = n;
    }
    if cli.remediate {
        config.remediation_enabled = true;
    }
    if cli.no_remediate {
        config.remediation_enabled = false;
    }
    if let Some(cmd) = &cli.remediation_cmd {
        config.remediation_cmd = Some(cmd.clone());
    }
    if let Some(ms) = cli.backoff_base_ms {
        config.backoff_base_ms = ms;
    }
    if let Some(ms) = cli.backoff_max_ms {
        config.backoff_max_ms = ms;
    }
    for pair in &cli.env_overrides {
        let (key, value) = RunConfiguration::parse_env_pair(pair)?;
        config.env.insert(key, value);
    }
    if cli.quiet {
        config.echo_output = false;
    }
    if !cli.command.is_empty() {
        config.command = cli.command.join(" ");
    }

    config.working_dir = config.working_dir.canonicalize().wrap_err_with(|| {
        format!(
            "working directory {} is not accessible",
            config.working_dir.display()
        )
    })?;

    Ok(config)
}

fn build_orchestrator(cli: &Cli) -> eyre::Result<Orchestrator> {
    let config = load_config(cli)?;
    let engine = engine_for(&config);
    let orchestrator =
        Orchestrator::new(config, Id::new(), engine).wrap_err("invalid configuration")?;
    Ok(orchestrator)
}

fn run(orchestrator: Orchestrator) -> eyre::Result<RunStatus> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async move {
        let token = CancellationToken::new();
        let mut orchestrator = orchestrator.with_cancel_token(token.clone());
        tokio::spawn(cancel_on_signal(token));

        let outcome = orchestrator.run().await.wrap_err("run failed")?;
        print_summary(&outcome);
        Ok(outcome.report.status)
    })
}

/// Cancel the run on SIGINT/SIGTERM (ctrl-c elsewhere).
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, aborting run"),
            _ = sigterm.recv() => info!("received SIGTERM, aborting run"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("received ctrl-c, aborting run");
    }

    token.cancel();
}

fn print_summary(outcome: &RunOutcome) {
    let report = &outcome.report;
    for line in report.summary_lines() {
        eprintln!("  {line}");
    }
    eprintln!(
        "healrun: {} after {} attempt(s) ({} retries, {} remediations) in {} ms; report: {}",
        report.status,
        report.attempts.len(),
        report.retries_used,
        report.remediations_used,
        report.total_duration_ms,
        outcome.report_path.display()
    );
}
