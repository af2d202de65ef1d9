//! Serialized reconciliation runs over every configured location.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use leadsync_core::RecordKind;
use leadsync_storage::{DedupLedger, LedgerSizes};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{ReconciliationEngine, SyncCounts, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "kind")]
pub enum RunScope {
    All,
    Kind(RecordKind),
}

impl RunScope {
    pub fn kinds(&self) -> Vec<RecordKind> {
        match self {
            RunScope::All => RecordKind::ALL.to_vec(),
            RunScope::Kind(kind) => vec![*kind],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("a reconciliation run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocationOutcome {
    pub location: String,
    pub kind: RecordKind,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub scope: RunScope,
    pub business_day: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<LocationOutcome>,
    pub totals: SyncCounts,
}

impl RunSummary {
    pub fn failed_locations(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Read-only view for the status surface: cumulative counts only.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub running: bool,
    pub business_day: NaiveDate,
    pub ledger: LedgerSizes,
    pub last_run_id: Option<Uuid>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub runs_completed: u64,
    pub totals: SyncCounts,
}

pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears `running` however a run ends, including when its future is dropped.
struct RunningFlag<'a>(&'a Mutex<RunnerStatus>);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        lock(self.0).running = false;
    }
}

/// Owns the dedup ledger and makes sure at most one run touches it at a time.
///
/// Both the timer and manual triggers go through [`SyncRunner::try_run`]; a
/// trigger that arrives while a run is in flight is refused rather than queued.
pub struct SyncRunner {
    engine: ReconciliationEngine,
    ledger: tokio::sync::Mutex<DedupLedger>,
    status: Mutex<RunnerStatus>,
    location_delay: Duration,
    clock: Clock,
}

impl SyncRunner {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self::with_clock(engine, Arc::new(|| Local::now().date_naive()))
    }

    pub fn with_clock(engine: ReconciliationEngine, clock: Clock) -> Self {
        let today = clock();
        Self {
            engine,
            ledger: tokio::sync::Mutex::new(DedupLedger::new(today)),
            status: Mutex::new(RunnerStatus {
                running: false,
                business_day: today,
                ledger: LedgerSizes::default(),
                last_run_id: None,
                last_run_started_at: None,
                last_run_finished_at: None,
                last_reset_at: None,
                runs_completed: 0,
                totals: SyncCounts::default(),
            }),
            location_delay: Duration::ZERO,
            clock,
        }
    }

    pub fn with_location_delay(mut self, location_delay: Duration) -> Self {
        self.location_delay = location_delay;
        self
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub async fn try_run(&self, scope: RunScope) -> Result<RunSummary, RunError> {
        let Ok(mut ledger) = self.ledger.try_lock() else {
            info!(?scope, "reconciliation already in progress; trigger ignored");
            return Err(RunError::AlreadyRunning);
        };

        let today = (self.clock)();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let rolled = ledger.roll_over(today);
        {
            let mut status = lock(&self.status);
            status.running = true;
            status.last_run_id = Some(run_id);
            status.last_run_started_at = Some(started_at);
            if rolled {
                status.last_reset_at = Some(started_at);
                status.business_day = today;
            }
        }
        let _running = RunningFlag(&self.status);
        if rolled {
            info!(business_day = %today, "ledger rolled over before run");
        }
        info!(%run_id, ?scope, "reconciliation run started");

        let mut outcomes = Vec::new();
        let mut totals = SyncCounts::default();
        let locations = &self.engine.settings().locations;
        for (idx, location) in locations.iter().enumerate() {
            if idx > 0 && !self.location_delay.is_zero() {
                tokio::time::sleep(self.location_delay).await;
            }
            for kind in scope.kinds() {
                match self.engine.reconcile(location, kind, &mut ledger, today).await {
                    Ok(report) => {
                        totals += &report.counts;
                        outcomes.push(LocationOutcome {
                            location: location.name.clone(),
                            kind,
                            report: Some(report),
                            error: None,
                        });
                    }
                    Err(err) => {
                        error!(location = %location.name, %kind, error = %err, "location skipped");
                        outcomes.push(LocationOutcome {
                            location: location.name.clone(),
                            kind,
                            report: None,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
        }

        let finished_at = Utc::now();
        {
            let mut status = lock(&self.status);
            status.running = false;
            status.last_run_finished_at = Some(finished_at);
            status.runs_completed += 1;
            status.totals += &totals;
            status.ledger = ledger.sizes();
            status.business_day = ledger.business_day();
        }
        drop(ledger);

        let summary = RunSummary {
            run_id,
            scope,
            business_day: today,
            started_at,
            finished_at,
            outcomes,
            totals,
        };
        if summary.failed_locations() > 0 {
            warn!(%run_id, failed = summary.failed_locations(), "run finished with skipped locations");
        }
        info!(
            %run_id,
            created = totals.created,
            tagged = totals.tagged,
            errored = totals.errored,
            "reconciliation run finished"
        );
        Ok(summary)
    }

    /// Clears both ledger namespaces, waiting for an in-flight run to finish first.
    pub async fn reset_ledger(&self) {
        let mut ledger = self.ledger.lock().await;
        let today = (self.clock)();
        ledger.reset_all(today);
        let mut status = lock(&self.status);
        status.last_reset_at = Some(Utc::now());
        status.business_day = today;
        status.ledger = ledger.sizes();
        info!(business_day = %today, "dedup ledger reset");
    }

    pub fn status(&self) -> RunnerStatus {
        let mut status = lock(&self.status).clone();
        if let Ok(ledger) = self.ledger.try_lock() {
            status.ledger = ledger.sizes();
            status.business_day = ledger.business_day();
        }
        status
    }

    /// Ledger snapshot for tests and diagnostics; waits for an in-flight run.
    pub async fn ledger_snapshot(&self) -> DedupLedger {
        self.ledger.lock().await.clone()
    }
}
