use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use wattscope::agent::Agent;
use wattscope::catalog::{inventory, Catalog};
use wattscope::config::Config;
use wattscope::health::HealthMetrics;
use wattscope::session::{self, SessionSpec};
use wattscope::sink::jsonl::JsonlSink;

/// Cgroup-scoped power/performance telemetry daemon.
#[derive(Parser)]
#[command(name = "wattscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the event catalog from the counter inventory and persist it.
    Init,

    /// Watch the configured cgroup and sample while it is populated.
    Run,

    /// Run one sampling session immediately, without watching.
    Sample,

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
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
    if let Command::Version = &cli.command {
        println!("wattscope {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is optional for init, required for run/sample.
    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Init => init(&cfg),
        Command::Run => {
            cfg.validate()?;
            runtime()?.block_on(run(cfg))
        }
        Command::Sample => {
            cfg.validate()?;
            runtime()?.block_on(sample(cfg))
        }
        Command::Version => unreachable!("handled above"),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

/// Build the event catalog and persist it for later sessions.
fn init(cfg: &Config) -> Result<()> {
    let records = inventory::fetch(&cfg.sampling.perf_bin)?;
    tracing::info!(events = records.len(), "fetched event inventory");

    let catalog = Catalog::build(&records);
    catalog.persist(&cfg.catalog.path)?;

    tracing::info!(
        path = %cfg.catalog.path.display(),
        levels = catalog.level_count(),
        "event catalog written",
    );

    Ok(())
}

/// Run the daemon: watch the cgroup, sample while populated.
async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting wattscope",
    );

    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("wattscope stopped");

    Ok(())
}

/// Run one session right now against the configured cgroup.
async fn sample(cfg: Config) -> Result<()> {
    let catalog = Catalog::load(&cfg.catalog.path)?;
    let resolved = catalog.resolve_events(cfg.sampling.detail_level);

    if resolved.system.is_empty() {
        anyhow::bail!(
            "catalog resolves no events at detail level {}",
            cfg.sampling.detail_level,
        );
    }

    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

    let sink = JsonlSink::create(&cfg.output.directory, chrono::Utc::now())?;
    tracing::info!(path = %sink.path().display(), "session output file created");

    let spec = SessionSpec {
        cgroup: Some(cfg.perf_cgroup_target()),
        interval: cfg.sampling.interval,
        duration: cfg.sampling.duration,
        perf_bin: cfg.sampling.perf_bin.clone(),
    };

    let cancel = CancellationToken::new();
    let handle = session::start(spec, resolved, Box::new(sink), health, cancel.clone());

    // Stop early on Ctrl-C; otherwise the session ends with its duration.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, stopping session");
            cancel.cancel();
        }
    });

    let report = handle.join().await?;

    tracing::info!(
        samples = report.samples,
        estimates = report.estimates,
        "session finished",
    );

    Ok(())
}
