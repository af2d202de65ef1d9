use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use leadsync_core::{
    ContactDraft, Location, MatchedBy, MemberRecord, Prospect, SinkIdentity, Transaction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::schema::{decode_member, decode_prospect, decode_transaction, SourceSchema};
use crate::{SinkError, SinkGateway, SourceGateway};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    locations: HashMap<String, FixtureLocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FixtureLocation {
    #[serde(default)]
    prospects: Vec<JsonValue>,
    #[serde(default)]
    transactions: Vec<JsonValue>,
    #[serde(default)]
    members: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Prospects { location: String, date: NaiveDate },
    Transactions { location: String, date: NaiveDate },
    Member { location: String, member_id: String },
}

/// Source backed by captured payloads instead of the live API. Records are
/// returned for any requested date.
#[derive(Debug, Default)]
pub struct FixtureSource {
    prospects: HashMap<String, Vec<Prospect>>,
    transactions: HashMap<String, Vec<Transaction>>,
    members: HashMap<(String, String), MemberRecord>,
    unavailable: AtomicBool,
    calls: Mutex<Vec<SourceCall>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads raw Source payloads keyed by location and decodes them with `schema`.
    pub fn load(path: impl AsRef<Path>, schema: &SourceSchema) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut source = Self::new();
        for (location, payloads) in file.locations {
            for raw in &payloads.prospects {
                match decode_prospect(raw, schema) {
                    Some(p) => source.push_prospect(&location, p),
                    None => warn!(location = %location, "fixture prospect has no identifier"),
                }
            }
            for raw in &payloads.transactions {
                match decode_transaction(raw, schema) {
                    Some(t) => source.push_transaction(&location, t),
                    None => warn!(location = %location, "fixture transaction has no identifier"),
                }
            }
            for raw in &payloads.members {
                if let Some(m) = decode_member(raw, schema) {
                    source.push_member(&location, m);
                }
            }
        }
        Ok(source)
    }

    pub fn push_prospect(&mut self, location_source_id: &str, prospect: Prospect) {
        self.prospects
            .entry(location_source_id.to_string())
            .or_default()
            .push(prospect);
    }

    pub fn push_transaction(&mut self, location_source_id: &str, transaction: Transaction) {
        self.transactions
            .entry(location_source_id.to_string())
            .or_default()
            .push(transaction);
    }

    pub fn push_member(&mut self, location_source_id: &str, member: MemberRecord) {
        self.members
            .insert((location_source_id.to_string(), member.member_id.clone()), member);
    }

    /// Simulates a Source outage: every fetch degrades to an empty result.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: SourceCall) -> bool {
        lock(&self.calls).push(call);
        let down = self.unavailable.load(Ordering::SeqCst);
        if down {
            warn!("fixture source marked unavailable; returning empty result");
        }
        !down
    }
}

#[async_trait]
impl SourceGateway for FixtureSource {
    async fn fetch_prospects(&self, location_source_id: &str, date: NaiveDate) -> Vec<Prospect> {
        let up = self.record(SourceCall::Prospects {
            location: location_source_id.to_string(),
            date,
        });
        if !up {
            return Vec::new();
        }
        self.prospects
            .get(location_source_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn fetch_transactions(
        &self,
        location_source_id: &str,
        date: NaiveDate,
    ) -> Vec<Transaction> {
        let up = self.record(SourceCall::Transactions {
            location: location_source_id.to_string(),
            date,
        });
        if !up {
            return Vec::new();
        }
        self.transactions
            .get(location_source_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn fetch_member(&self, location_source_id: &str, member_id: &str) -> Option<MemberRecord> {
        let up = self.record(SourceCall::Member {
            location: location_source_id.to_string(),
            member_id: member_id.to_string(),
        });
        if !up {
            return None;
        }
        self.members
            .get(&(location_source_id.to_string(), member_id.to_string()))
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredContact {
    pub contact_id: String,
    pub sink_id: String,
    pub email: Option<String>,
    pub source_record_id: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    FindByEmail { sink_id: String, email: String },
    FindBySourceId { sink_id: String, source_record_id: String },
    CreateContact { sink_id: String, source_record_id: String, tag: String },
    AddTag { sink_id: String, contact_id: String, tag: String },
}

impl SinkCall {
    pub fn is_mutation(&self) -> bool {
        matches!(self, SinkCall::CreateContact { .. } | SinkCall::AddTag { .. })
    }
}

/// CRM stand-in that never touches the network. Lookups are answered from an
/// in-memory contact list; creates and tags are applied to it and logged.
#[derive(Debug, Default)]
pub struct DryRunSink {
    contacts: Mutex<Vec<StoredContact>>,
    calls: Mutex<Vec<SinkCall>>,
    next_id: AtomicU64,
    fail_lookups: AtomicBool,
    fail_mutations: AtomicBool,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contact(
        self,
        sink_id: &str,
        email: Option<&str>,
        source_record_id: Option<&str>,
    ) -> Self {
        let contact_id = format!("existing-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.contacts).push(StoredContact {
            contact_id,
            sink_id: sink_id.to_string(),
            email: email.map(ToString::to_string),
            source_record_id: source_record_id.map(ToString::to_string),
            tags: Vec::new(),
        });
        self
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn mutation_count(&self) -> usize {
        lock(&self.calls).iter().filter(|c| c.is_mutation()).count()
    }

    pub fn contacts(&self) -> Vec<StoredContact> {
        lock(&self.contacts).clone()
    }

    fn record(&self, call: SinkCall) {
        lock(&self.calls).push(call);
    }

    fn simulated_outage(&self, operation: &'static str, flag: &AtomicBool) -> Result<(), SinkError> {
        if flag.load(Ordering::SeqCst) {
            return Err(SinkError::Simulated {
                operation,
                message: "dry-run sink configured to fail".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SinkGateway for DryRunSink {
    async fn find_by_email(
        &self,
        location: &Location,
        email: &str,
    ) -> Result<Option<SinkIdentity>, SinkError> {
        self.record(SinkCall::FindByEmail {
            sink_id: location.sink_id.clone(),
            email: email.to_string(),
        });
        self.simulated_outage("find_by_email", &self.fail_lookups)?;
        let needle = email.trim();
        Ok(lock(&self.contacts)
            .iter()
            .find(|c| {
                c.sink_id == location.sink_id
                    && c.email
                        .as_deref()
                        .is_some_and(|e| e.trim().eq_ignore_ascii_case(needle))
            })
            .map(|c| SinkIdentity {
                contact_id: c.contact_id.clone(),
                matched_by: MatchedBy::Email,
            }))
    }

    async fn find_by_source_id(
        &self,
        location: &Location,
        source_record_id: &str,
    ) -> Result<Option<SinkIdentity>, SinkError> {
        self.record(SinkCall::FindBySourceId {
            sink_id: location.sink_id.clone(),
            source_record_id: source_record_id.to_string(),
        });
        self.simulated_outage("find_by_source_id", &self.fail_lookups)?;
        Ok(lock(&self.contacts)
            .iter()
            .find(|c| {
                c.sink_id == location.sink_id
                    && c.source_record_id.as_deref() == Some(source_record_id)
            })
            .map(|c| SinkIdentity {
                contact_id: c.contact_id.clone(),
                matched_by: MatchedBy::SourceId,
            }))
    }

    async fn create_contact(
        &self,
        location: &Location,
        draft: &ContactDraft,
        tag: &str,
    ) -> Result<SinkIdentity, SinkError> {
        self.record(SinkCall::CreateContact {
            sink_id: location.sink_id.clone(),
            source_record_id: draft.source_record_id.clone(),
            tag: tag.to_string(),
        });
        self.simulated_outage("create_contact", &self.fail_mutations)?;
        let contact_id = format!("dry-run-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.contacts).push(StoredContact {
            contact_id: contact_id.clone(),
            sink_id: location.sink_id.clone(),
            email: draft.contact.email().map(ToString::to_string),
            source_record_id: Some(draft.source_record_id.clone()),
            tags: vec![tag.to_string()],
        });
        info!(location = %location.name, contact_id = %contact_id, tag, "dry-run: contact created");
        Ok(SinkIdentity {
            contact_id,
            matched_by: MatchedBy::Created,
        })
    }

    async fn add_tag(&self, location: &Location, contact_id: &str, tag: &str) -> Result<(), SinkError> {
        self.record(SinkCall::AddTag {
            sink_id: location.sink_id.clone(),
            contact_id: contact_id.to_string(),
            tag: tag.to_string(),
        });
        self.simulated_outage("add_tag", &self.fail_mutations)?;
        let mut contacts = lock(&self.contacts);
        let Some(contact) = contacts.iter_mut().find(|c| c.contact_id == contact_id) else {
            return Err(SinkError::Rejected {
                operation: "add_tag",
                status: 404,
            });
        };
        if !contact.tags.iter().any(|t| t == tag) {
            contact.tags.push(tag.to_string());
        }
        info!(location = %location.name, contact_id, tag, "dry-run: tag applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_core::ContactFields;
    use std::io::Write;

    fn location() -> Location {
        Location {
            name: "Downtown".into(),
            source_id: "1001".into(),
            sink_id: "crm-downtown".into(),
            sink_credential: "token".into(),
        }
    }

    #[test]
    fn fixture_file_decodes_payloads_per_location() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "locations": {{
                    "1001": {{
                        "prospects": [
                            {{ "prospectId": "p-1", "personal": {{ "email": "a@example.com" }} }},
                            {{ "personal": {{ "email": "no-id@example.com" }} }}
                        ],
                        "transactions": [{{ "transactionId": "t-1", "memberId": "m-1" }}],
                        "members": [{{ "memberId": "m-1", "email": "m@example.com" }}]
                    }}
                }}
            }}"#
        )
        .unwrap();

        let source = FixtureSource::load(file.path(), &SourceSchema::default()).unwrap();
        assert_eq!(source.prospects["1001"].len(), 1);
        assert_eq!(source.transactions["1001"][0].member_id.as_deref(), Some("m-1"));
        assert!(source
            .members
            .contains_key(&("1001".to_string(), "m-1".to_string())));
    }

    #[tokio::test]
    async fn unavailable_fixture_source_degrades_to_empty() {
        let mut source = FixtureSource::new();
        source.push_member(
            "1001",
            MemberRecord {
                member_id: "m-1".into(),
                contact: ContactFields::default(),
            },
        );
        source.set_unavailable(true);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert!(source.fetch_prospects("1001", date).await.is_empty());
        assert!(source.fetch_member("1001", "m-1").await.is_none());
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_sink_matches_email_case_insensitively_within_location() {
        let sink = DryRunSink::new()
            .with_contact("crm-downtown", Some("Ada@Example.com"), None)
            .with_contact("crm-uptown", Some("bob@example.com"), None);
        let loc = location();

        let hit = sink.find_by_email(&loc, "ada@example.COM").await.unwrap();
        assert_eq!(hit.unwrap().matched_by, MatchedBy::Email);
        assert!(sink.find_by_email(&loc, "bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dry_run_sink_tags_without_duplicating() {
        let sink = DryRunSink::new().with_contact("crm-downtown", Some("a@example.com"), None);
        let loc = location();
        let id = sink.contacts()[0].contact_id.clone();

        sink.add_tag(&loc, &id, "NLPT").await.unwrap();
        sink.add_tag(&loc, &id, "NLPT").await.unwrap();

        assert_eq!(sink.contacts()[0].tags, vec!["NLPT".to_string()]);
        assert_eq!(sink.mutation_count(), 2);
        assert!(sink.add_tag(&loc, "missing", "NLPT").await.is_err());
    }

    #[tokio::test]
    async fn dry_run_sink_can_simulate_outages() {
        let sink = DryRunSink::new();
        sink.set_fail_mutations(true);
        let draft = ContactDraft {
            contact: ContactFields {
                email: Some("a@example.com".into()),
                ..Default::default()
            },
            source_record_id: "p-1".into(),
        };
        let err = sink.create_contact(&location(), &draft, "NLPT").await.unwrap_err();
        assert!(matches!(err, SinkError::Simulated { .. }));
        assert!(sink.contacts().is_empty());
    }
}
