use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadsync_core::RecordKind;
use leadsync_sync::{build_runner, GatewayMode, RunScope, SyncConfig, SyncSettings};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Reconcile gym prospects and sales into the CRM")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and exit.
    Sync {
        #[arg(long)]
        kind: Option<RecordKind>,
        /// Record CRM mutations instead of sending them.
        #[arg(long)]
        dry_run: bool,
        /// Read Source payloads from a fixture file instead of the live API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Start the poll scheduler and the web trigger surface.
    Serve,
    /// Load and validate the settings file.
    CheckConfig,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn load_settings(config: &SyncConfig) -> Result<SyncSettings> {
    SyncSettings::load(&config.settings_path)
        .await
        .context("loading sync settings")
}

async fn sync_once(kind: Option<RecordKind>, dry_run: bool, fixtures: Option<PathBuf>) -> Result<()> {
    let config = SyncConfig::from_env();
    let settings = load_settings(&config).await?;
    let mode = GatewayMode {
        fixtures: fixtures.as_deref(),
        dry_run,
    };
    let runner = build_runner(&config, settings, mode)?;
    let scope = kind.map_or(RunScope::All, RunScope::Kind);
    let summary = runner.try_run(scope).await?;

    for outcome in &summary.outcomes {
        match (&outcome.report, &outcome.error) {
            (Some(report), _) => println!(
                "{} {}: fetched={} created={} tagged={} skipped={} errored={}",
                outcome.location,
                outcome.kind,
                report.counts.fetched,
                report.counts.created,
                report.counts.tagged,
                report.counts.skipped(),
                report.counts.errored
            ),
            (None, error) => println!(
                "{} {}: skipped ({})",
                outcome.location,
                outcome.kind,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    println!(
        "sync complete: run_id={} created={} tagged={} errored={}",
        summary.run_id, summary.totals.created, summary.totals.tagged, summary.totals.errored
    );
    Ok(())
}

async fn serve() -> Result<()> {
    let (config, runner) = leadsync_sync::runner_from_env().await?;
    let scheduler =
        leadsync_sync::maybe_start(runner.clone(), config.scheduler_enabled, config.poll_interval).await?;

    let port = leadsync_web::port_from_env();
    tokio::select! {
        served = leadsync_web::serve(runner, port) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    Ok(())
}

async fn check_config() -> Result<()> {
    let config = SyncConfig::from_env();
    let settings = load_settings(&config).await?;
    println!("settings: {}", config.settings_path.display());
    for location in &settings.locations {
        let ready = !location.sink_id.trim().is_empty() && !location.sink_credential.trim().is_empty();
        println!(
            "  {} source_id={} sink_id={} {}",
            location.name,
            location.source_id,
            location.sink_id,
            if ready { "ok" } else { "MISSING SINK CONFIG" }
        );
    }
    for category in &settings.target_categories {
        println!(
            "  category {} -> {}",
            category,
            settings.tag_for(category).unwrap_or("<no tag>")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::CheckConfig) {
        Commands::Sync {
            kind,
            dry_run,
            fixtures,
        } => sync_once(kind, dry_run, fixtures).await?,
        Commands::Serve => serve().await?,
        Commands::CheckConfig => check_config().await?,
    }

    Ok(())
}
