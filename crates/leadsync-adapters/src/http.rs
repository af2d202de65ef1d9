use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use leadsync_core::{
    scalar_text, ContactDraft, Location, MatchedBy, MemberRecord, Prospect, SinkIdentity,
    Transaction,
};
use leadsync_storage::{ApiRequest, FetchError, HttpClient};
use reqwest::Url;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::schema::{decode_member, decode_prospect, decode_transaction, records_array, SourceSchema};
use crate::{SinkError, SinkGateway, SourceError, SourceGateway};

fn parse_base(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid API base url `{raw}`"))?;
    if url.cannot_be_a_base() {
        bail!("API base url `{raw}` cannot carry a path");
    }
    Ok(url)
}

/// `base` extended by `segments`, each percent-encoded on its own so an id
/// containing `/` or `?` stays a single segment. A trailing `""` keeps a
/// trailing slash.
fn endpoint(base: &Url, segments: &[&str]) -> String {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url.to_string()
}

#[derive(Debug, Clone)]
pub struct SourceApiConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_key: String,
    pub schema: SourceSchema,
}

/// REST client for the gym system of record.
pub struct HttpSourceGateway {
    http: Arc<HttpClient>,
    base: Url,
    config: SourceApiConfig,
}

impl HttpSourceGateway {
    pub fn new(http: Arc<HttpClient>, config: SourceApiConfig) -> anyhow::Result<Self> {
        let base = parse_base(&config.base_url)?;
        Ok(Self { http, base, config })
    }

    fn url(&self, location_source_id: &str, tail: &[&str]) -> String {
        let mut segments = vec![location_source_id];
        segments.extend_from_slice(tail);
        endpoint(&self.base, &segments)
    }

    fn authed(&self, request: ApiRequest) -> ApiRequest {
        request
            .header("accept", "application/json")
            .header("app_id", self.config.app_id.clone())
            .header("app_key", self.config.app_key.clone())
    }

    fn day_range(date: NaiveDate) -> String {
        let day = date.format("%Y-%m-%d");
        format!("{day},{day}")
    }

    async fn get(&self, operation: &'static str, request: ApiRequest) -> Result<JsonValue, SourceError> {
        self.http
            .send_json(&self.authed(request))
            .await
            .map(|resp| resp.body)
            .map_err(|source| SourceError::Unavailable { operation, source })
    }

    pub async fn try_fetch_prospects(
        &self,
        location_source_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Prospect>, SourceError> {
        let request = ApiRequest::get(self.url(location_source_id, &["prospects"]))
            .query("createdTimestampRange", Self::day_range(date));
        let body = self.get("fetch_prospects", request).await?;
        let rows = records_array(&body, &self.config.schema.prospect_list);
        let total = rows.len();
        let prospects: Vec<_> = rows
            .iter()
            .filter_map(|raw| decode_prospect(raw, &self.config.schema))
            .collect();
        if prospects.len() < total {
            warn!(
                location = location_source_id,
                dropped = total - prospects.len(),
                "prospect rows without an identifier were dropped"
            );
        }
        Ok(prospects)
    }

    pub async fn try_fetch_transactions(
        &self,
        location_source_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<Transaction>, SourceError> {
        let request = ApiRequest::get(self.url(location_source_id, &["pos", "transactions"]))
            .query("transactionTimestampRange", Self::day_range(date));
        let body = self.get("fetch_transactions", request).await?;
        Ok(records_array(&body, &self.config.schema.transaction_list)
            .iter()
            .filter_map(|raw| decode_transaction(raw, &self.config.schema))
            .collect())
    }

    pub async fn try_fetch_member(
        &self,
        location_source_id: &str,
        member_id: &str,
    ) -> Result<Option<MemberRecord>, SourceError> {
        let request = ApiRequest::get(self.url(location_source_id, &["members", member_id]));
        let body = match self.http.send_json(&self.authed(request)).await {
            Ok(resp) => resp.body,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(source) => {
                return Err(SourceError::Unavailable {
                    operation: "fetch_member",
                    source,
                })
            }
        };
        let rows = records_array(&body, &self.config.schema.member_list);
        if rows.is_empty() {
            return Ok(decode_member(&body, &self.config.schema));
        }
        Ok(rows
            .iter()
            .filter_map(|raw| decode_member(raw, &self.config.schema))
            .find(|m| m.member_id == member_id))
    }
}

#[async_trait]
impl SourceGateway for HttpSourceGateway {
    async fn fetch_prospects(&self, location_source_id: &str, date: NaiveDate) -> Vec<Prospect> {
        self.try_fetch_prospects(location_source_id, date)
            .await
            .unwrap_or_else(|err| {
                warn!(location = location_source_id, error = %err, "prospect fetch failed; treating as empty");
                Vec::new()
            })
    }

    async fn fetch_transactions(
        &self,
        location_source_id: &str,
        date: NaiveDate,
    ) -> Vec<Transaction> {
        self.try_fetch_transactions(location_source_id, date)
            .await
            .unwrap_or_else(|err| {
                warn!(location = location_source_id, error = %err, "transaction fetch failed; treating as empty");
                Vec::new()
            })
    }

    async fn fetch_member(&self, location_source_id: &str, member_id: &str) -> Option<MemberRecord> {
        self.try_fetch_member(location_source_id, member_id)
            .await
            .unwrap_or_else(|err| {
                warn!(location = location_source_id, member_id, error = %err, "member lookup failed; treating as not found");
                None
            })
    }
}

#[derive(Debug, Clone)]
pub struct SinkApiConfig {
    pub base_url: String,
    /// CRM custom field that stores the Source record identifier.
    pub source_id_field: String,
}

/// REST client for the CRM. Credentials are per location.
pub struct HttpSinkGateway {
    http: Arc<HttpClient>,
    base: Url,
    config: SinkApiConfig,
}

impl HttpSinkGateway {
    pub fn new(http: Arc<HttpClient>, config: SinkApiConfig) -> anyhow::Result<Self> {
        let base = parse_base(&config.base_url)?;
        Ok(Self { http, base, config })
    }

    fn url(&self, segments: &[&str]) -> String {
        endpoint(&self.base, segments)
    }

    fn authed(location: &Location, request: ApiRequest) -> ApiRequest {
        request
            .header("accept", "application/json")
            .header("authorization", format!("Bearer {}", location.sink_credential))
    }

    async fn send(
        &self,
        operation: &'static str,
        location: &Location,
        request: ApiRequest,
    ) -> Result<JsonValue, SinkError> {
        self.http
            .send_json(&Self::authed(location, request))
            .await
            .map(|resp| resp.body)
            .map_err(|err: FetchError| SinkError::from_fetch(operation, err))
    }

    async fn search(&self, location: &Location, query: &str) -> Result<Vec<JsonValue>, SinkError> {
        let request = ApiRequest::get(self.url(&["contacts", ""]))
            .query("locationId", location.sink_id.clone())
            .query("query", query);
        let body = self.send("search_contacts", location, request).await?;
        match body.get("contacts") {
            Some(JsonValue::Array(items)) => Ok(items.clone()),
            Some(JsonValue::Null) | None => Ok(Vec::new()),
            Some(other) => Err(SinkError::Decode {
                operation: "search_contacts",
                message: format!("`contacts` is not an array: {other}"),
            }),
        }
    }

    fn contact_id(contact: &JsonValue) -> Option<String> {
        contact.get("id").and_then(scalar_text)
    }

    fn custom_field_value(&self, contact: &JsonValue) -> Option<String> {
        let fields = contact.get("customField").or_else(|| contact.get("customFields"))?;
        match fields {
            JsonValue::Array(items) => items
                .iter()
                .find(|f| {
                    f.get("id").and_then(scalar_text).as_deref()
                        == Some(self.config.source_id_field.as_str())
                })
                .and_then(|f| f.get("value"))
                .and_then(scalar_text),
            JsonValue::Object(map) => map.get(&self.config.source_id_field).and_then(scalar_text),
            _ => None,
        }
    }
}

#[async_trait]
impl SinkGateway for HttpSinkGateway {
    async fn find_by_email(
        &self,
        location: &Location,
        email: &str,
    ) -> Result<Option<SinkIdentity>, SinkError> {
        let candidates = self.search(location, email).await?;
        Ok(candidates
            .iter()
            .filter(|c| {
                c.get("email")
                    .and_then(scalar_text)
                    .is_some_and(|found| found.eq_ignore_ascii_case(email.trim()))
            })
            .find_map(Self::contact_id)
            .map(|contact_id| SinkIdentity {
                contact_id,
                matched_by: MatchedBy::Email,
            }))
    }

    async fn find_by_source_id(
        &self,
        location: &Location,
        source_record_id: &str,
    ) -> Result<Option<SinkIdentity>, SinkError> {
        let candidates = self.search(location, source_record_id).await?;
        let found = candidates
            .iter()
            .filter(|c| self.custom_field_value(c).as_deref() == Some(source_record_id))
            .find_map(Self::contact_id);
        if found.is_none() {
            debug!(location = %location.name, source_record_id, "no crm contact carries this source id");
        }
        Ok(found.map(|contact_id| SinkIdentity {
            contact_id,
            matched_by: MatchedBy::SourceId,
        }))
    }

    async fn create_contact(
        &self,
        location: &Location,
        draft: &ContactDraft,
        tag: &str,
    ) -> Result<SinkIdentity, SinkError> {
        let mut body = Map::new();
        body.insert("locationId".into(), json!(location.sink_id));
        let contact = &draft.contact;
        for (key, value) in [
            ("firstName", contact.first_name.as_deref()),
            ("lastName", contact.last_name.as_deref()),
            ("email", contact.email()),
            ("phone", contact.phone()),
        ] {
            if let Some(value) = value {
                body.insert(key.into(), json!(value));
            }
        }
        body.insert("tags".into(), json!([tag]));
        let mut custom = Map::new();
        custom.insert(
            self.config.source_id_field.clone(),
            json!(draft.source_record_id),
        );
        body.insert("customField".into(), JsonValue::Object(custom));

        let request = ApiRequest::post(self.url(&["contacts", ""]), JsonValue::Object(body));
        let resp = self.send("create_contact", location, request).await?;
        let contact_id = resp
            .get("contact")
            .and_then(Self::contact_id)
            .or_else(|| Self::contact_id(&resp))
            .ok_or_else(|| SinkError::Decode {
                operation: "create_contact",
                message: "response carries no contact id".to_string(),
            })?;
        Ok(SinkIdentity {
            contact_id,
            matched_by: MatchedBy::Created,
        })
    }

    async fn add_tag(&self, location: &Location, contact_id: &str, tag: &str) -> Result<(), SinkError> {
        let request = ApiRequest::post(
            self.url(&["contacts", contact_id, "tags"]),
            json!({ "tags": [tag] }),
        );
        self.send("add_tag", location, request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_storage::HttpClientConfig;

    fn sink() -> HttpSinkGateway {
        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap());
        HttpSinkGateway::new(
            http,
            SinkApiConfig {
                base_url: "https://crm.invalid/v1/".into(),
                source_id_field: "abc_prospect_id".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn custom_field_lookup_accepts_list_and_map_shapes() {
        let sink = sink();
        let listed = json!({ "id": "c1", "customField": [{ "id": "abc_prospect_id", "value": "p-9" }] });
        let mapped = json!({ "id": "c2", "customFields": { "abc_prospect_id": 77 } });
        let other = json!({ "id": "c3", "customField": [{ "id": "favorite_color", "value": "p-9" }] });
        assert_eq!(sink.custom_field_value(&listed).as_deref(), Some("p-9"));
        assert_eq!(sink.custom_field_value(&mapped).as_deref(), Some("77"));
        assert_eq!(sink.custom_field_value(&other), None);
    }

    #[test]
    fn urls_tolerate_trailing_slashes() {
        assert_eq!(sink().url(&["contacts", ""]), "https://crm.invalid/v1/contacts/");
    }

    #[test]
    fn ids_are_encoded_as_single_path_segments() {
        assert_eq!(
            sink().url(&["contacts", "c/1?x=2", "tags"]),
            "https://crm.invalid/v1/contacts/c%2F1%3Fx=2/tags"
        );

        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap());
        let source = HttpSourceGateway::new(
            http,
            SourceApiConfig {
                base_url: "https://gym.invalid/rest".into(),
                app_id: "id".into(),
                app_key: "key".into(),
                schema: SourceSchema::default(),
            },
        )
        .unwrap();
        assert_eq!(
            source.url("1001", &["members", "../m 7"]),
            "https://gym.invalid/rest/1001/members/..%2Fm%207"
        );
    }

    #[test]
    fn base_urls_must_be_absolute() {
        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap());
        let config = SinkApiConfig {
            base_url: "crm.invalid/v1".into(),
            source_id_field: "abc_prospect_id".into(),
        };
        assert!(HttpSinkGateway::new(http, config).is_err());
    }

    #[test]
    fn source_day_range_covers_one_business_day() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(HttpSourceGateway::day_range(date), "2026-03-02,2026-03-02");
    }
}
