//! Core domain model for leadsync: locations, candidate records and the
//! schema-tolerant field resolver shared by the filter and the gateways.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "leadsync-core";

/// Independent ledger namespaces; one per kind of record pulled from the Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "prospects")]
    Prospect,
    #[serde(rename = "transactions")]
    Transaction,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Prospect, RecordKind::Transaction];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Prospect => "prospects",
            RecordKind::Transaction => "transactions",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown record kind `{0}` (expected prospects or transactions)")]
pub struct UnknownRecordKind(pub String);

impl FromStr for RecordKind {
    type Err = UnknownRecordKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prospect" | "prospects" => Ok(RecordKind::Prospect),
            "transaction" | "transactions" | "pos" => Ok(RecordKind::Transaction),
            other => Err(UnknownRecordKind(other.to_string())),
        }
    }
}

/// A gym location: the club id in the Source paired with its CRM sub-account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub source_id: String,
    pub sink_id: String,
    #[serde(skip_serializing)]
    pub sink_credential: String,
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("name", &self.name)
            .field("source_id", &self.source_id)
            .field("sink_id", &self.sink_id)
            .field("sink_credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFields {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl ContactFields {
    pub fn email(&self) -> Option<&str> {
        non_blank(self.email.as_deref())
    }

    pub fn phone(&self) -> Option<&str> {
        non_blank(self.phone.as_deref())
    }

    /// A CRM contact is only usable with at least one way to reach the person.
    pub fn has_channel(&self) -> bool {
        self.email().is_some() || self.phone().is_some()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: String,
    pub contact: ContactFields,
    /// Raw Source payload; entry-source and campaign fields are resolved from it.
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub member_id: Option<String>,
    /// Club the sale was rung up at, when the payload names one.
    pub location_source_id: Option<String>,
    pub is_return: bool,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateRecord {
    Prospect(Prospect),
    Transaction(Transaction),
}

impl CandidateRecord {
    pub fn id(&self) -> &str {
        match self {
            CandidateRecord::Prospect(p) => &p.id,
            CandidateRecord::Transaction(t) => &t.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            CandidateRecord::Prospect(_) => RecordKind::Prospect,
            CandidateRecord::Transaction(_) => RecordKind::Transaction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: String,
    pub contact: ContactFields,
}

/// Contact payload handed to the Sink on create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub contact: ContactFields,
    /// Source-side identifier written to the CRM custom field used for lookups.
    pub source_record_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    Email,
    SourceId,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkIdentity {
    pub contact_id: String,
    pub matched_by: MatchedBy,
}

/// Ordered object keys into a JSON payload, written as `personal.email` in config.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn lookup<'a>(&self, value: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut cur = value;
        for segment in &self.0 {
            cur = cur.get(segment.as_str())?;
        }
        Some(cur)
    }
}

impl From<&str> for FieldPath {
    fn from(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
        )
    }
}

impl From<String> for FieldPath {
    fn from(dotted: String) -> Self {
        FieldPath::from(dotted.as_str())
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.0.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

pub fn paths(dotted: &[&str]) -> Vec<FieldPath> {
    dotted.iter().map(|p| FieldPath::from(*p)).collect()
}

/// Text of a scalar JSON value; blank strings count as missing.
pub fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Walks `candidates` in priority order and returns the first non-empty scalar.
pub fn first_non_empty(value: &JsonValue, candidates: &[FieldPath]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|path| path.lookup(value))
        .find_map(scalar_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolver_prefers_earlier_paths() {
        let payload = json!({
            "entrySource": "top",
            "personal": { "entrySource": "nested" }
        });
        let found = first_non_empty(&payload, &paths(&["entrySource", "personal.entrySource"]));
        assert_eq!(found.as_deref(), Some("top"));
    }

    #[test]
    fn resolver_skips_blank_null_and_missing_values() {
        let payload = json!({
            "entrySource": "   ",
            "agreement": { "entrySource": null },
            "personal": { "entrySource": "fast-add" }
        });
        let found = first_non_empty(
            &payload,
            &paths(&["missing", "entrySource", "agreement.entrySource", "personal.entrySource"]),
        );
        assert_eq!(found.as_deref(), Some("fast-add"));
    }

    #[test]
    fn resolver_renders_numbers_and_ignores_containers() {
        let payload = json!({ "ids": [1, 2], "memberId": 4411 });
        assert_eq!(first_non_empty(&payload, &paths(&["ids", "memberId"])).as_deref(), Some("4411"));
        assert_eq!(first_non_empty(&payload, &paths(&["ids"])), None);
    }

    #[test]
    fn field_path_round_trips_through_dotted_text() {
        let path: FieldPath = serde_json::from_str("\"personal.email\"").unwrap();
        assert_eq!(path.segments(), ["personal", "email"]);
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"personal.email\"");
    }

    #[test]
    fn contact_without_email_or_phone_has_no_channel() {
        let contact = ContactFields {
            first_name: Some("Ada".into()),
            email: Some("  ".into()),
            ..Default::default()
        };
        assert!(!contact.has_channel());
        let with_phone = ContactFields {
            phone: Some("555-0100".into()),
            ..Default::default()
        };
        assert!(with_phone.has_channel());
    }

    #[test]
    fn record_kind_parses_route_names() {
        assert_eq!("prospects".parse::<RecordKind>().unwrap(), RecordKind::Prospect);
        assert_eq!("Transactions".parse::<RecordKind>().unwrap(), RecordKind::Transaction);
        let err = "members".parse::<RecordKind>().unwrap_err();
        assert_eq!(err, UnknownRecordKind("members".into()));
        assert_eq!(
            err.to_string(),
            "unknown record kind `members` (expected prospects or transactions)"
        );
    }

    #[test]
    fn location_debug_redacts_credential() {
        let location = Location {
            name: "Downtown".into(),
            source_id: "1001".into(),
            sink_id: "loc-a".into(),
            sink_credential: "secret-token".into(),
        };
        assert!(!format!("{location:?}").contains("secret-token"));
    }
}
