use std::path::PathBuf;
use std::time::Duration;

use leadsync_sync::{build_runner, GatewayMode, RunScope, SyncConfig, SyncSettings};

fn repo_file(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..").join(name)
}

fn offline_config() -> SyncConfig {
    SyncConfig {
        settings_path: repo_file("leadsync.example.yaml"),
        source_base_url: "http://127.0.0.1:9".to_string(),
        source_app_id: String::new(),
        source_app_key: String::new(),
        sink_base_url: "http://127.0.0.1:9".to_string(),
        sink_source_id_field: "source_record_id".to_string(),
        poll_interval: Duration::from_secs(900),
        location_delay: Duration::ZERO,
        record_delay: Duration::ZERO,
        scheduler_enabled: false,
        user_agent: "leadsync-test".to_string(),
        http_timeout_secs: 1,
    }
}

#[tokio::test]
async fn fixture_day_runs_offline_against_dry_run_sink() {
    let config = offline_config();
    let settings = SyncSettings::load(&config.settings_path).await.unwrap();
    let fixtures = repo_file("fixtures/sample_day.json");
    let runner = build_runner(
        &config,
        settings,
        GatewayMode {
            fixtures: Some(&fixtures),
            dry_run: true,
        },
    )
    .unwrap();

    let summary = runner.try_run(RunScope::All).await.unwrap();
    assert_eq!(summary.outcomes.len(), 4);
    assert_eq!(summary.failed_locations(), 0);
    assert_eq!(summary.totals.fetched, 4);
    assert_eq!(summary.totals.filtered_out, 2);
    assert_eq!(summary.totals.created, 2);

    let again = runner.try_run(RunScope::All).await.unwrap();
    assert_eq!(again.totals.created, 0);
    assert_eq!(again.totals.already_synced, 2);
}
