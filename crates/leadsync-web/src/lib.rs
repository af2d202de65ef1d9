//! Axum trigger surface: run-now endpoints, JSON status and a status page.

use std::str::FromStr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadsync_core::RecordKind;
use leadsync_sync::{RunError, RunScope, SyncCounts, SyncRunner};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "leadsync-web";

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<SyncRunner>,
}

impl AppState {
    pub fn new(runner: Arc<SyncRunner>) -> Self {
        Self { runner }
    }
}

struct LocationRow {
    name: String,
    source_id: String,
    sink_id: String,
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    running: bool,
    business_day: String,
    last_run_id: String,
    last_run_started_at: String,
    last_run_finished_at: String,
    last_reset_at: String,
    runs_completed: u64,
    seen_prospects: usize,
    seen_transactions: usize,
    totals: SyncCounts,
    locations: Vec<LocationRow>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/sync", post(sync_all_handler))
        .route("/sync/{kind}", post(sync_kind_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("LEADSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(runner: Arc<SyncRunner>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web surface listening");
    axum::serve(listener, app(AppState::new(runner))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.runner.status();
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "n/a".to_string());
    let locations = state
        .runner
        .engine()
        .settings()
        .locations
        .iter()
        .map(|l| LocationRow {
            name: l.name.clone(),
            source_id: l.source_id.clone(),
            sink_id: l.sink_id.clone(),
        })
        .collect();
    render_html(StatusTemplate {
        running: status.running,
        business_day: status.business_day.to_string(),
        last_run_id: or_dash(status.last_run_id.map(|id| id.to_string())),
        last_run_started_at: or_dash(status.last_run_started_at.map(|t| t.to_rfc3339())),
        last_run_finished_at: or_dash(status.last_run_finished_at.map(|t| t.to_rfc3339())),
        last_reset_at: or_dash(status.last_reset_at.map(|t| t.to_rfc3339())),
        runs_completed: status.runs_completed,
        seen_prospects: status.ledger.prospects,
        seen_transactions: status.ledger.transactions,
        totals: status.totals,
        locations,
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.runner.status()).into_response()
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    run(&state, RunScope::All).await
}

async fn sync_kind_handler(State(state): State<Arc<AppState>>, Path(kind): Path<String>) -> Response {
    match RecordKind::from_str(&kind) {
        Ok(kind) => run(&state, RunScope::Kind(kind)).await,
        Err(err) => error_response(StatusCode::BAD_REQUEST, err.to_string()),
    }
}

/// The run is spawned so it finishes even if the client goes away mid-request.
async fn run(state: &AppState, scope: RunScope) -> Response {
    let runner = state.runner.clone();
    match tokio::spawn(async move { runner.try_run(scope).await }).await {
        Ok(Ok(summary)) => Json(summary).into_response(),
        Ok(Err(err @ RunError::AlreadyRunning)) => error_response(StatusCode::CONFLICT, err.to_string()),
        Err(err) => {
            error!(error = %err, "reconciliation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
