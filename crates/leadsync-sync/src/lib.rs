//! Reconciliation pipeline: qualification rules, the per-location engine, the
//! serialized runner and its timers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use leadsync_adapters::{
    DryRunSink, FixtureSource, HttpSinkGateway, HttpSourceGateway, SinkApiConfig, SinkGateway,
    SourceApiConfig, SourceGateway,
};
use leadsync_storage::{HttpClient, HttpClientConfig, RateLimit};
use tracing::info;

pub mod config;
pub mod engine;
pub mod filter;
pub mod runner;
pub mod scheduler;

pub use config::{SyncConfig, SyncSettings};
pub use engine::{ReconciliationEngine, RecordOutcome, SyncCounts, SyncError, SyncReport};
pub use filter::{matches, MatchFields, MatchRules};
pub use runner::{LocationOutcome, RunError, RunScope, RunSummary, RunnerStatus, SyncRunner};
pub use scheduler::{duration_until_next_local_midnight, maybe_start, Scheduler, SchedulerHandle};

pub const CRATE_NAME: &str = "leadsync-sync";

/// How the runner reaches the outside world.
#[derive(Debug, Clone, Default)]
pub struct GatewayMode<'a> {
    /// Serve Source data from a captured payload file instead of the live API.
    pub fixtures: Option<&'a Path>,
    /// Record CRM mutations in memory instead of sending them.
    pub dry_run: bool,
}

fn http_client(config: &SyncConfig, rate_limit: Option<RateLimit>) -> Result<Arc<HttpClient>> {
    let client = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        rate_limit,
        ..HttpClientConfig::default()
    })?;
    Ok(Arc::new(client))
}

/// Wires gateways, engine and runner from process config and loaded settings.
pub fn build_runner(
    config: &SyncConfig,
    settings: SyncSettings,
    mode: GatewayMode<'_>,
) -> Result<Arc<SyncRunner>> {
    let source: Arc<dyn SourceGateway> = match mode.fixtures {
        Some(path) => {
            info!(path = %path.display(), "using fixture source");
            Arc::new(FixtureSource::load(path, &settings.source_schema)?)
        }
        None => Arc::new(HttpSourceGateway::new(
            http_client(config, None)?,
            SourceApiConfig {
                base_url: config.source_base_url.clone(),
                app_id: config.source_app_id.clone(),
                app_key: config.source_app_key.clone(),
                schema: settings.source_schema.clone(),
            },
        )?),
    };

    let sink: Arc<dyn SinkGateway> = if mode.dry_run {
        info!("dry run: CRM mutations are recorded, not sent");
        Arc::new(DryRunSink::new())
    } else {
        let limit = RateLimit {
            burst: 5,
            interval: Duration::from_millis(200),
        };
        Arc::new(HttpSinkGateway::new(
            http_client(config, Some(limit))?,
            SinkApiConfig {
                base_url: config.sink_base_url.clone(),
                source_id_field: config.sink_source_id_field.clone(),
            },
        )?)
    };

    let engine = ReconciliationEngine::new(source, sink, Arc::new(settings))
        .with_record_delay(config.record_delay);
    let runner = SyncRunner::new(engine).with_location_delay(config.location_delay);
    Ok(Arc::new(runner))
}

/// Loads settings from `LEADSYNC_SETTINGS` and builds a live runner.
pub async fn runner_from_env() -> Result<(SyncConfig, Arc<SyncRunner>)> {
    let config = SyncConfig::from_env();
    let settings = SyncSettings::load(&config.settings_path)
        .await
        .context("loading sync settings")?;
    let runner = build_runner(&config, settings, GatewayMode::default())?;
    Ok((config, runner))
}
