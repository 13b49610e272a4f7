use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use scout::agent::Agent;
use scout::collector::Registry;
use scout::config::{Config, Overrides};
use scout::watchdog::Fatal;

/// Host telemetry agent shipping metrics to an OpenTSDB-compatible endpoint.
#[derive(Parser)]
#[command(name = "scout", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only run collectors whose name contains this substring.
    #[arg(short, long)]
    filter: Option<String>,

    /// List the selected collectors and exit.
    #[arg(short, long)]
    list: bool,

    /// Print points to stdout instead of sending them.
    #[arg(short, long)]
    print: bool,

    /// With --print, write wire JSON objects instead of lines.
    #[arg(short, long)]
    json: bool,

    /// Remote endpoint address; "http://" is assumed without a scheme.
    #[arg(short = 'H', long = "host")]
    endpoint: Option<String>,

    /// Maximum points per request.
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Do not report series metadata.
    #[arg(short = 'm', long)]
    disable_metadata: bool,

    /// Tag points with the full hostname instead of its first label.
    #[arg(short = 'u', long)]
    full_hostname: bool,

    /// Run a synthetic collector emitting this many points per second.
    #[arg(long)]
    fake: Option<usize>,

    /// Directory of external program collectors (<secs>/<executable>).
    #[arg(long)]
    program_dir: Option<PathBuf>,

    /// Tracing filter directive (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            log_level: self.log_level.clone(),
            endpoint: self.endpoint.clone(),
            filter: self.filter.clone(),
            batch_size: self.batch_size,
            fake: self.fake,
            program_dir: self.program_dir.clone(),
            print: self.print,
            json: self.json,
            disable_metadata: self.disable_metadata,
            full_hostname: self.full_hostname,
        }
    }
}

/// Build-time version info, injected by build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Build date as YYYYMMDDHHMMSS, or 0 when unknown.
    pub fn date() -> i64 {
        option_env!("VERSION_DATE")
            .and_then(|d| d.parse().ok())
            .unwrap_or(0)
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("scout {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    cfg.apply_overrides(&cli.overrides())
        .context("applying command-line options")?;

    // Initialize tracing. Stdout is reserved for printed points.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let agent = Agent::new(cfg)?.with_version_date(version::date());
    let registry = agent.build_registry().context("registering collectors")?;

    if cli.list {
        for name in registry.search(&agent.config().collectors.filter) {
            println!("{name}");
        }
        return Ok(());
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        collectors = registry.len(),
        "starting scout",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    if let Some(fatal) = rt.block_on(run(agent, registry))? {
        tracing::error!(error = %fatal, "exiting on fatal condition");
        std::process::exit(fatal.exit_code());
    }

    Ok(())
}

/// Runs until SIGINT/SIGTERM or a fatal watchdog report. A fatal condition
/// skips graceful shutdown.
async fn run(mut agent: Agent, registry: Registry) -> Result<Option<Fatal>> {
    agent.start(registry).await?;

    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            result = &mut signal => {
                result?;
                break;
            }
            fatal = agent.fatal() => {
                if let Some(fatal) = fatal {
                    return Ok(Some(fatal));
                }
            }
        }
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("scout stopped");

    Ok(None)
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
