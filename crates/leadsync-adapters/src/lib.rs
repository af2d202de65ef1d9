//! Source and Sink gateway contracts + HTTP, fixture and dry-run implementations.

use async_trait::async_trait;
use chrono::NaiveDate;
use leadsync_core::{
    CandidateRecord, ContactDraft, Location, MemberRecord, Prospect, RecordKind, SinkIdentity,
    Transaction,
};
use leadsync_storage::FetchError;
use thiserror::Error;

mod fixture;
mod http;
mod schema;

pub use fixture::{DryRunSink, FixtureSource, SinkCall, SourceCall, StoredContact};
pub use http::{HttpSinkGateway, HttpSourceGateway, SinkApiConfig, SourceApiConfig};
pub use schema::{decode_member, decode_prospect, decode_transaction, records_array, SourceSchema};

pub const CRATE_NAME: &str = "leadsync-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("unexpected source payload during {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("sink rejected {operation} with status {status}")]
    Rejected { operation: &'static str, status: u16 },
    #[error("unexpected sink payload during {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
    #[error("sink unavailable during {operation}: {message}")]
    Simulated {
        operation: &'static str,
        message: String,
    },
}

impl SinkError {
    pub(crate) fn from_fetch(operation: &'static str, err: FetchError) -> Self {
        // A bad credential or throttling is an outage for this record, not a verdict on it.
        if err.is_auth_failure() {
            return SinkError::Unavailable {
                operation,
                source: err,
            };
        }
        match err {
            FetchError::HttpStatus { status, .. }
                if (400..500).contains(&status) && !matches!(status, 408 | 429) =>
            {
                SinkError::Rejected { operation, status }
            }
            other => SinkError::Unavailable {
                operation,
                source: other,
            },
        }
    }
}

/// Read side of the gym system of record.
///
/// Implementations swallow transport and auth failures: they log the
/// `SourceError` and hand back an empty result, so callers only ever see
/// "nothing" or "something".
#[async_trait]
pub trait SourceGateway: Send + Sync {
    async fn fetch_prospects(&self, location_source_id: &str, date: NaiveDate) -> Vec<Prospect>;

    async fn fetch_transactions(&self, location_source_id: &str, date: NaiveDate)
        -> Vec<Transaction>;

    async fn fetch_member(&self, location_source_id: &str, member_id: &str)
        -> Option<MemberRecord>;

    async fn fetch_candidates(
        &self,
        kind: RecordKind,
        location_source_id: &str,
        date: NaiveDate,
    ) -> Vec<CandidateRecord> {
        match kind {
            RecordKind::Prospect => self
                .fetch_prospects(location_source_id, date)
                .await
                .into_iter()
                .map(CandidateRecord::Prospect)
                .collect(),
            RecordKind::Transaction => self
                .fetch_transactions(location_source_id, date)
                .await
                .into_iter()
                .map(CandidateRecord::Transaction)
                .collect(),
        }
    }
}

/// Lookup and mutation side of the CRM. Every mutation is externally visible
/// and not transactional; an `Err` means the caller must treat the call as
/// not applied.
#[async_trait]
pub trait SinkGateway: Send + Sync {
    async fn find_by_email(
        &self,
        location: &Location,
        email: &str,
    ) -> Result<Option<SinkIdentity>, SinkError>;

    async fn find_by_source_id(
        &self,
        location: &Location,
        source_record_id: &str,
    ) -> Result<Option<SinkIdentity>, SinkError>;

    async fn create_contact(
        &self,
        location: &Location,
        draft: &ContactDraft,
        tag: &str,
    ) -> Result<SinkIdentity, SinkError>;

    async fn add_tag(&self, location: &Location, contact_id: &str, tag: &str)
        -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_rejections_but_auth_and_throttle_are_outages() {
        let rejected = SinkError::from_fetch(
            "create_contact",
            FetchError::HttpStatus {
                status: 422,
                url: "u".into(),
            },
        );
        assert!(matches!(rejected, SinkError::Rejected { status: 422, .. }));

        for status in [401, 403, 408, 429, 503] {
            let err = SinkError::from_fetch(
                "find_by_email",
                FetchError::HttpStatus {
                    status,
                    url: "u".into(),
                },
            );
            assert!(matches!(err, SinkError::Unavailable { .. }), "status {status}");
        }
    }
}
