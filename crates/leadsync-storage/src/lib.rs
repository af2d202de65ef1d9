//! Day-scoped dedup ledger + rate-limited JSON HTTP client for leadsync.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use leadsync_core::RecordKind;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "leadsync-storage";

/// Identifiers already processed during the current business day.
///
/// Prospects and transactions live in separate sets; an identifier marked under
/// one kind is never visible under the other. Nothing here is persisted: a
/// process restart starts from an empty ledger.
#[derive(Debug, Clone)]
pub struct DedupLedger {
    business_day: NaiveDate,
    prospects: HashSet<String>,
    transactions: HashSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSizes {
    pub prospects: usize,
    pub transactions: usize,
}

impl DedupLedger {
    pub fn new(business_day: NaiveDate) -> Self {
        Self {
            business_day,
            prospects: HashSet::new(),
            transactions: HashSet::new(),
        }
    }

    pub fn business_day(&self) -> NaiveDate {
        self.business_day
    }

    fn set(&self, kind: RecordKind) -> &HashSet<String> {
        match kind {
            RecordKind::Prospect => &self.prospects,
            RecordKind::Transaction => &self.transactions,
        }
    }

    fn set_mut(&mut self, kind: RecordKind) -> &mut HashSet<String> {
        match kind {
            RecordKind::Prospect => &mut self.prospects,
            RecordKind::Transaction => &mut self.transactions,
        }
    }

    pub fn seen(&self, kind: RecordKind, id: &str) -> bool {
        self.set(kind).contains(id)
    }

    /// Returns `true` when the identifier was not yet marked.
    pub fn mark(&mut self, kind: RecordKind, id: &str) -> bool {
        self.set_mut(kind).insert(id.to_string())
    }

    pub fn reset_all(&mut self, business_day: NaiveDate) {
        self.prospects.clear();
        self.transactions.clear();
        self.business_day = business_day;
    }

    /// Clears the ledger when `today` is a later business day than the one tracked.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.business_day {
            return false;
        }
        debug!(from = %self.business_day, to = %today, "dedup ledger rolling over to new business day");
        self.reset_all(today);
        true
    }

    pub fn len(&self, kind: RecordKind) -> usize {
        self.set(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.prospects.is_empty() && self.transactions.is_empty()
    }

    pub fn sizes(&self) -> LedgerSizes {
        LedgerSizes {
            prospects: self.prospects.len(),
            transactions: self.transactions.len(),
        }
    }
}

/// Statuses worth another attempt: the server was overloaded or asked us to slow down.
fn transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn transient_transport(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}

/// Doubling pause between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: usize,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn pause_before(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.initial.saturating_mul(1 << shift).min(self.ceiling)
    }
}

/// `burst` requests may go out back to back; after that one per `interval`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// Books the next slot against `next_free` and returns how long the caller
    /// must wait for it.
    fn reserve(&self, next_free: &mut Instant, now: Instant) -> Duration {
        let slack = self.interval.saturating_mul(self.burst.saturating_sub(1));
        let slot = (*next_free).max(now);
        *next_free = slot + self.interval;
        (slot - now).saturating_sub(slack)
    }
}

#[derive(Debug)]
struct Pacer {
    limit: RateLimit,
    next_free: Mutex<Instant>,
}

impl Pacer {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            next_free: Mutex::new(Instant::now()),
        }
    }

    async fn acquire(&self) {
        let wait = {
            let mut next_free = self.next_free.lock().await;
            self.limit.reserve(&mut next_free, Instant::now())
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limit pause");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// One JSON API call. Non-idempotent requests are only retried when the server
/// never saw them (connect failures) or explicitly asked for a retry (429).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    pub idempotent: bool,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            idempotent: true,
        }
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: Some(body),
            idempotent: false,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    fn may_retry_status(&self, status: StatusCode) -> bool {
        transient_status(status)
            && (self.idempotent || status == StatusCode::TOO_MANY_REQUESTS)
    }

    fn may_retry_error(&self, err: &reqwest::Error) -> bool {
        transient_transport(err)
            && (self.idempotent || err.is_connect())
    }
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 401 | 403, .. })
    }
}

#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    pacer: Option<Pacer>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer: config.rate_limit.map(Pacer::new),
            retry: config.retry,
        })
    }

    pub async fn send_json(&self, request: &ApiRequest) -> Result<JsonResponse, FetchError> {
        if let Some(pacer) = &self.pacer {
            pacer.acquire().await;
        }

        let span = info_span!("http_call", method = %request.method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(&self, request: &ApiRequest) -> Result<JsonResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut builder = self.client.request(request.method.clone(), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let can_retry = attempt < self.retry.retries;
            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
                            JsonValue::Null
                        } else {
                            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                                url: final_url.clone(),
                                source,
                            })?
                        };
                        return Ok(JsonResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if can_retry && request.may_retry_status(status) {
                        debug!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.retry.pause_before(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if can_retry && request.may_retry_error(&err) {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.retry.pause_before(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).expect("date")
    }

    #[test]
    fn ledger_namespaces_are_independent() {
        let mut ledger = DedupLedger::new(day(2));
        assert!(ledger.mark(RecordKind::Prospect, "42"));
        assert!(ledger.seen(RecordKind::Prospect, "42"));
        assert!(!ledger.seen(RecordKind::Transaction, "42"));
        assert!(!ledger.mark(RecordKind::Prospect, "42"));
        assert_eq!(
            ledger.sizes(),
            LedgerSizes {
                prospects: 1,
                transactions: 0
            }
        );
    }

    #[test]
    fn reset_clears_both_namespaces() {
        let mut ledger = DedupLedger::new(day(2));
        ledger.mark(RecordKind::Prospect, "p-1");
        ledger.mark(RecordKind::Transaction, "t-1");
        ledger.reset_all(day(3));
        assert!(!ledger.seen(RecordKind::Prospect, "p-1"));
        assert!(!ledger.seen(RecordKind::Transaction, "t-1"));
        assert!(ledger.is_empty());
        assert_eq!(ledger.business_day(), day(3));
    }

    #[test]
    fn roll_over_only_resets_on_a_new_day() {
        let mut ledger = DedupLedger::new(day(2));
        ledger.mark(RecordKind::Prospect, "p-1");
        assert!(!ledger.roll_over(day(2)));
        assert!(ledger.seen(RecordKind::Prospect, "p-1"));
        assert!(ledger.roll_over(day(3)));
        assert!(!ledger.seen(RecordKind::Prospect, "p-1"));
    }

    #[test]
    fn retry_pauses_double_up_to_the_ceiling() {
        let policy = RetryPolicy {
            retries: 5,
            initial: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };

        assert_eq!(policy.pause_before(0), Duration::from_millis(100));
        assert_eq!(policy.pause_before(1), Duration::from_millis(200));
        assert_eq!(policy.pause_before(2), Duration::from_millis(350));
        assert_eq!(policy.pause_before(64), Duration::from_millis(350));
    }

    #[test]
    fn creates_only_retry_on_rate_limit() {
        let create = ApiRequest::post("http://crm.invalid/contacts", JsonValue::Null);
        assert!(create.may_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!create.may_retry_status(StatusCode::BAD_GATEWAY));

        let search = ApiRequest::get("http://crm.invalid/contacts");
        assert!(search.may_retry_status(StatusCode::BAD_GATEWAY));
        assert!(!search.may_retry_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn fetch_error_classifies_not_found_and_auth() {
        let not_found = FetchError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        let forbidden = FetchError::HttpStatus {
            status: 403,
            url: "u".into(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_auth_failure());
        assert!(forbidden.is_auth_failure());
    }

    #[test]
    fn rate_limit_allows_a_burst_then_spaces_requests() {
        let limit = RateLimit {
            burst: 3,
            interval: Duration::from_secs(60),
        };
        let now = Instant::now();
        let mut next_free = now;
        for _ in 0..3 {
            assert_eq!(limit.reserve(&mut next_free, now), Duration::ZERO);
        }
        assert_eq!(limit.reserve(&mut next_free, now), Duration::from_secs(60));
        assert_eq!(
            limit.reserve(&mut next_free, now + Duration::from_secs(300)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn pacer_does_not_block_within_the_burst() {
        let pacer = Pacer::new(RateLimit {
            burst: 3,
            interval: Duration::from_secs(60),
        });
        let started = Instant::now();
        for _ in 0..3 {
            pacer.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
