//! Reconciliation of one location and record kind against the CRM.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use leadsync_adapters::{SinkError, SinkGateway, SourceGateway};
use leadsync_core::{
    CandidateRecord, ContactDraft, ContactFields, Location, MatchedBy, Prospect, RecordKind,
    SinkIdentity, Transaction,
};
use leadsync_storage::DedupLedger;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SyncSettings;
use crate::filter::MatchRules;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("location `{location}` has no {what} configured")]
    ConfigurationMissing { location: String, what: &'static str },
}

/// Terminal state of one candidate record within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    FilteredOut,
    AlreadySynced,
    Unusable,
    DuplicateByEmail,
    DuplicateBySourceId,
    Created,
    Tagged,
    MemberMissing,
    Misconfigured,
    Errored,
}

impl RecordOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::FilteredOut => "filtered_out",
            RecordOutcome::AlreadySynced => "already_synced",
            RecordOutcome::Unusable => "unusable",
            RecordOutcome::DuplicateByEmail => "duplicate_by_email",
            RecordOutcome::DuplicateBySourceId => "duplicate_by_source_id",
            RecordOutcome::Created => "created",
            RecordOutcome::Tagged => "tagged",
            RecordOutcome::MemberMissing => "member_missing",
            RecordOutcome::Misconfigured => "misconfigured",
            RecordOutcome::Errored => "errored",
        }
    }

    /// Outcomes that reached the Sink; only these are paced.
    fn reached_sink(&self) -> bool {
        matches!(
            self,
            RecordOutcome::DuplicateByEmail
                | RecordOutcome::DuplicateBySourceId
                | RecordOutcome::Created
                | RecordOutcome::Tagged
                | RecordOutcome::Errored
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub fetched: usize,
    pub filtered_out: usize,
    pub already_synced: usize,
    pub duplicates: usize,
    pub created: usize,
    pub tagged: usize,
    pub unusable: usize,
    pub member_missing: usize,
    pub misconfigured: usize,
    pub errored: usize,
}

impl SyncCounts {
    pub fn record(&mut self, outcome: RecordOutcome) {
        let slot = match outcome {
            RecordOutcome::FilteredOut => &mut self.filtered_out,
            RecordOutcome::AlreadySynced => &mut self.already_synced,
            RecordOutcome::Unusable => &mut self.unusable,
            RecordOutcome::DuplicateByEmail | RecordOutcome::DuplicateBySourceId => {
                &mut self.duplicates
            }
            RecordOutcome::Created => &mut self.created,
            RecordOutcome::Tagged => &mut self.tagged,
            RecordOutcome::MemberMissing => &mut self.member_missing,
            RecordOutcome::Misconfigured => &mut self.misconfigured,
            RecordOutcome::Errored => &mut self.errored,
        };
        *slot += 1;
    }

    /// Qualifying records that needed no Sink mutation.
    pub fn skipped(&self) -> usize {
        self.already_synced + self.duplicates + self.unusable + self.member_missing + self.misconfigured
    }
}

impl AddAssign<&SyncCounts> for SyncCounts {
    fn add_assign(&mut self, other: &SyncCounts) {
        self.fetched += other.fetched;
        self.filtered_out += other.filtered_out;
        self.already_synced += other.already_synced;
        self.duplicates += other.duplicates;
        self.created += other.created;
        self.tagged += other.tagged;
        self.unusable += other.unusable;
        self.member_missing += other.member_missing;
        self.misconfigured += other.misconfigured;
        self.errored += other.errored;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub location: String,
    pub kind: RecordKind,
    pub counts: SyncCounts,
}

pub struct ReconciliationEngine {
    source: Arc<dyn SourceGateway>,
    sink: Arc<dyn SinkGateway>,
    settings: Arc<SyncSettings>,
    rules: MatchRules,
    record_delay: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        source: Arc<dyn SourceGateway>,
        sink: Arc<dyn SinkGateway>,
        settings: Arc<SyncSettings>,
    ) -> Self {
        let rules = settings.match_rules();
        Self {
            source,
            sink,
            settings,
            rules,
            record_delay: Duration::ZERO,
        }
    }

    pub fn with_record_delay(mut self, record_delay: Duration) -> Self {
        self.record_delay = record_delay;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Fetches `kind` records for `location` on `date` and syncs the qualifying
    /// ones, one at a time. Only a misconfigured location fails the whole pass;
    /// every record-level failure is counted and the pass continues.
    pub async fn reconcile(
        &self,
        location: &Location,
        kind: RecordKind,
        ledger: &mut DedupLedger,
        date: NaiveDate,
    ) -> Result<SyncReport, SyncError> {
        for (value, what) in [
            (&location.sink_id, "sink id"),
            (&location.sink_credential, "sink credential"),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::ConfigurationMissing {
                    location: location.name.clone(),
                    what,
                });
            }
        }

        let span = info_span!("reconcile", location = %location.name, kind = %kind, %date);
        async move {
            let candidates = self
                .source
                .fetch_candidates(kind, &location.source_id, date)
                .await;
            let mut report = SyncReport {
                location: location.name.clone(),
                kind,
                counts: SyncCounts {
                    fetched: candidates.len(),
                    ..Default::default()
                },
            };

            for record in &candidates {
                let outcome = self.process(location, record, ledger).await;
                report.counts.record(outcome);
                debug!(record_id = record.id(), outcome = outcome.as_str(), "record reconciled");
                if outcome.reached_sink() && !self.record_delay.is_zero() {
                    tokio::time::sleep(self.record_delay).await;
                }
            }

            info!(
                fetched = report.counts.fetched,
                created = report.counts.created,
                tagged = report.counts.tagged,
                skipped = report.counts.skipped(),
                errored = report.counts.errored,
                "reconciliation pass finished"
            );
            Ok::<_, SyncError>(report)
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        location: &Location,
        record: &CandidateRecord,
        ledger: &mut DedupLedger,
    ) -> RecordOutcome {
        let Some(category) = self.rules.matched_category(record) else {
            return RecordOutcome::FilteredOut;
        };
        if ledger.seen(record.kind(), record.id()) {
            return RecordOutcome::AlreadySynced;
        }
        match record {
            CandidateRecord::Prospect(p) => self.sync_prospect(location, p, category, ledger).await,
            CandidateRecord::Transaction(t) => {
                self.sync_transaction(location, t, category, ledger).await
            }
        }
    }

    fn tag_for(&self, location: &Location, record_id: &str, category: &str) -> Option<&str> {
        let tag = self.settings.tag_for(category);
        if tag.is_none() {
            error!(
                location = %location.name,
                record_id,
                category,
                "no tag configured for qualifying category; record skipped"
            );
        }
        tag
    }

    /// Email first, then the Source identifier custom field.
    async fn find_existing(
        &self,
        location: &Location,
        contact: &ContactFields,
        source_record_id: &str,
    ) -> Result<Option<SinkIdentity>, SinkError> {
        if let Some(email) = contact.email() {
            if let Some(found) = self.sink.find_by_email(location, email).await? {
                return Ok(Some(found));
            }
        }
        self.sink.find_by_source_id(location, source_record_id).await
    }

    async fn create(
        &self,
        location: &Location,
        kind: RecordKind,
        record_id: &str,
        draft: ContactDraft,
        tag: &str,
        ledger: &mut DedupLedger,
    ) -> RecordOutcome {
        match self.sink.create_contact(location, &draft, tag).await {
            Ok(identity) => {
                ledger.mark(kind, record_id);
                info!(location = %location.name, record_id, contact_id = %identity.contact_id, tag, "contact created");
                RecordOutcome::Created
            }
            Err(err) => {
                warn!(location = %location.name, record_id, error = %err, "contact create failed; will retry next cycle");
                RecordOutcome::Errored
            }
        }
    }

    async fn sync_prospect(
        &self,
        location: &Location,
        prospect: &Prospect,
        category: &str,
        ledger: &mut DedupLedger,
    ) -> RecordOutcome {
        let kind = RecordKind::Prospect;
        if !prospect.contact.has_channel() {
            debug!(record_id = %prospect.id, "prospect has neither email nor phone");
            return RecordOutcome::Unusable;
        }
        let Some(tag) = self.tag_for(location, &prospect.id, category) else {
            return RecordOutcome::Misconfigured;
        };

        match self.find_existing(location, &prospect.contact, &prospect.id).await {
            Ok(Some(existing)) => {
                ledger.mark(kind, &prospect.id);
                match existing.matched_by {
                    MatchedBy::Email => RecordOutcome::DuplicateByEmail,
                    _ => RecordOutcome::DuplicateBySourceId,
                }
            }
            Ok(None) => {
                let draft = ContactDraft {
                    contact: prospect.contact.clone(),
                    source_record_id: prospect.id.clone(),
                };
                self.create(location, kind, &prospect.id, draft, tag, ledger).await
            }
            Err(err) => {
                warn!(location = %location.name, record_id = %prospect.id, error = %err, "crm lookup failed; will retry next cycle");
                RecordOutcome::Errored
            }
        }
    }

    async fn sync_transaction(
        &self,
        location: &Location,
        transaction: &Transaction,
        category: &str,
        ledger: &mut DedupLedger,
    ) -> RecordOutcome {
        let kind = RecordKind::Transaction;
        if let Some(club) = transaction.location_source_id.as_deref() {
            if self.settings.location_by_source_id(club).is_none() {
                error!(
                    location = %location.name,
                    record_id = %transaction.id,
                    referenced_location = club,
                    "transaction references a location missing from configuration; record skipped"
                );
                return RecordOutcome::Misconfigured;
            }
        }
        let Some(tag) = self.tag_for(location, &transaction.id, category) else {
            return RecordOutcome::Misconfigured;
        };

        // Unresolvable members are marked so the same sale is not looked up every poll.
        let member = match transaction.member_id.as_deref() {
            Some(member_id) => self.source.fetch_member(&location.source_id, member_id).await,
            None => None,
        };
        let Some(member) = member else {
            ledger.mark(kind, &transaction.id);
            warn!(
                location = %location.name,
                record_id = %transaction.id,
                member_id = transaction.member_id.as_deref().unwrap_or("<none>"),
                "member not found for transaction; marked without syncing"
            );
            return RecordOutcome::MemberMissing;
        };
        if !member.contact.has_channel() {
            debug!(record_id = %transaction.id, member_id = %member.member_id, "member has neither email nor phone");
            return RecordOutcome::Unusable;
        }

        match self.find_existing(location, &member.contact, &member.member_id).await {
            Ok(Some(existing)) => match self.sink.add_tag(location, &existing.contact_id, tag).await {
                Ok(()) => {
                    ledger.mark(kind, &transaction.id);
                    info!(location = %location.name, record_id = %transaction.id, contact_id = %existing.contact_id, tag, "tag added to existing contact");
                    RecordOutcome::Tagged
                }
                Err(err) => {
                    warn!(location = %location.name, record_id = %transaction.id, error = %err, "tagging failed; will retry next cycle");
                    RecordOutcome::Errored
                }
            },
            Ok(None) => {
                let draft = ContactDraft {
                    contact: member.contact.clone(),
                    source_record_id: member.member_id.clone(),
                };
                self.create(location, kind, &transaction.id, draft, tag, ledger).await
            }
            Err(err) => {
                warn!(location = %location.name, record_id = %transaction.id, error = %err, "crm lookup failed; will retry next cycle");
                RecordOutcome::Errored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sink_outcomes_are_paced() {
        assert!(RecordOutcome::Created.reached_sink());
        assert!(RecordOutcome::Errored.reached_sink());
        assert!(!RecordOutcome::MemberMissing.reached_sink());
        assert!(!RecordOutcome::AlreadySynced.reached_sink());
        assert!(!RecordOutcome::Misconfigured.reached_sink());
    }

    #[test]
    fn counts_fold_duplicates_and_sum_skips() {
        let mut counts = SyncCounts::default();
        for outcome in [
            RecordOutcome::DuplicateByEmail,
            RecordOutcome::DuplicateBySourceId,
            RecordOutcome::MemberMissing,
            RecordOutcome::Created,
        ] {
            counts.record(outcome);
        }
        assert_eq!(counts.duplicates, 2);
        assert_eq!(counts.skipped(), 3);

        let mut total = SyncCounts::default();
        total += &counts;
        total += &counts;
        assert_eq!(total.created, 2);
    }
}
