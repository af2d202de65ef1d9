use leadsync_core::{
    first_non_empty, paths, ContactFields, FieldPath, LineItem, MemberRecord, Prospect,
    Transaction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Where each logical field may live in a Source payload, in lookup order.
///
/// The Source returns differently shaped records depending on endpoint version,
/// so every field is a list of candidate paths rather than a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSchema {
    pub prospect_list: Vec<FieldPath>,
    pub prospect_id: Vec<FieldPath>,
    pub transaction_list: Vec<FieldPath>,
    pub transaction_id: Vec<FieldPath>,
    pub transaction_member_id: Vec<FieldPath>,
    pub transaction_location_id: Vec<FieldPath>,
    pub transaction_return_flag: Vec<FieldPath>,
    pub line_item_list: Vec<FieldPath>,
    pub member_list: Vec<FieldPath>,
    pub member_id: Vec<FieldPath>,
    pub first_name: Vec<FieldPath>,
    pub last_name: Vec<FieldPath>,
    pub email: Vec<FieldPath>,
    pub phone: Vec<FieldPath>,
}

impl Default for SourceSchema {
    fn default() -> Self {
        Self {
            prospect_list: paths(&["prospects", "data.prospects"]),
            prospect_id: paths(&["prospectId", "id", "personal.prospectId"]),
            transaction_list: paths(&["transactions", "clubs.transactions", "data.transactions"]),
            transaction_id: paths(&["transactionId", "id", "receiptNumber"]),
            transaction_member_id: paths(&["memberId", "member.memberId", "customer.memberId"]),
            transaction_location_id: paths(&["clubNumber", "club.clubNumber", "location.clubNumber"]),
            transaction_return_flag: paths(&["return", "isReturn", "transactionType"]),
            line_item_list: paths(&["items", "lineItems", "purchases.items"]),
            member_list: paths(&["members", "data.members"]),
            member_id: paths(&["memberId", "id", "personal.memberId"]),
            first_name: paths(&["firstName", "personal.firstName", "contact.firstName"]),
            last_name: paths(&["lastName", "personal.lastName", "contact.lastName"]),
            email: paths(&["email", "personal.email", "contact.email"]),
            phone: paths(&[
                "primaryPhone",
                "phone",
                "personal.primaryPhone",
                "personal.mobilePhone",
                "personal.cellPhone",
                "contact.phone",
            ]),
        }
    }
}

/// The first array found at `candidates`; a bare top-level array is accepted too.
///
/// A path segment that lands on an array of objects (`clubs.transactions` where
/// `clubs` is a list) flattens the nested arrays of every element.
pub fn records_array(body: &JsonValue, candidates: &[FieldPath]) -> Vec<JsonValue> {
    if let JsonValue::Array(items) = body {
        return items.clone();
    }
    for path in candidates {
        let found = collect_along(body, path.segments());
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

fn collect_along(value: &JsonValue, segments: &[String]) -> Vec<JsonValue> {
    match segments.split_first() {
        None => match value {
            JsonValue::Array(items) => items.clone(),
            _ => Vec::new(),
        },
        Some((head, rest)) => match value {
            JsonValue::Object(map) => map
                .get(head.as_str())
                .map(|next| collect_along(next, rest))
                .unwrap_or_default(),
            JsonValue::Array(items) => items
                .iter()
                .flat_map(|item| collect_along(item, segments))
                .collect(),
            _ => Vec::new(),
        },
    }
}

fn decode_contact(raw: &JsonValue, schema: &SourceSchema) -> ContactFields {
    ContactFields {
        first_name: first_non_empty(raw, &schema.first_name),
        last_name: first_non_empty(raw, &schema.last_name),
        email: first_non_empty(raw, &schema.email),
        phone: first_non_empty(raw, &schema.phone),
    }
}

fn decode_flag(raw: &JsonValue, candidates: &[FieldPath]) -> bool {
    candidates
        .iter()
        .filter_map(|path| path.lookup(raw))
        .find_map(|value| match value {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) if !s.trim().is_empty() => Some(matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "y" | "1" | "return" | "refund"
            )),
            JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        })
        .unwrap_or(false)
}

/// Records without an identifier cannot be deduplicated and are dropped.
pub fn decode_prospect(raw: &JsonValue, schema: &SourceSchema) -> Option<Prospect> {
    let id = first_non_empty(raw, &schema.prospect_id)?;
    Some(Prospect {
        id,
        contact: decode_contact(raw, schema),
        attributes: raw.clone(),
    })
}

pub fn decode_transaction(raw: &JsonValue, schema: &SourceSchema) -> Option<Transaction> {
    let id = first_non_empty(raw, &schema.transaction_id)?;
    let line_items = records_array(raw, &schema.line_item_list)
        .into_iter()
        .map(|attributes| LineItem { attributes })
        .collect();
    Some(Transaction {
        id,
        member_id: first_non_empty(raw, &schema.transaction_member_id),
        location_source_id: first_non_empty(raw, &schema.transaction_location_id),
        is_return: decode_flag(raw, &schema.transaction_return_flag),
        line_items,
    })
}

pub fn decode_member(raw: &JsonValue, schema: &SourceSchema) -> Option<MemberRecord> {
    let member_id = first_non_empty(raw, &schema.member_id)?;
    Some(MemberRecord {
        member_id,
        contact: decode_contact(raw, schema),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prospect_contact_fields_fall_back_to_personal_block() {
        let raw = json!({
            "prospectId": "p-77",
            "personal": {
                "firstName": "Rosa",
                "email": "rosa@example.com",
                "mobilePhone": "555-0199"
            }
        });
        let prospect = decode_prospect(&raw, &SourceSchema::default()).unwrap();
        assert_eq!(prospect.id, "p-77");
        assert_eq!(prospect.contact.first_name.as_deref(), Some("Rosa"));
        assert_eq!(prospect.contact.email.as_deref(), Some("rosa@example.com"));
        assert_eq!(prospect.contact.phone.as_deref(), Some("555-0199"));
        assert_eq!(prospect.attributes, raw);
    }

    #[test]
    fn prospect_without_identifier_is_dropped() {
        let raw = json!({ "personal": { "email": "x@example.com" } });
        assert!(decode_prospect(&raw, &SourceSchema::default()).is_none());
    }

    #[test]
    fn transaction_decodes_return_flag_variants_and_items() {
        let schema = SourceSchema::default();
        let sale = json!({
            "transactionId": "t-1",
            "memberId": 9001,
            "clubNumber": "1001",
            "return": "false",
            "items": [{ "profitCenter": "Physical Therapy" }, { "profitCenter": "Smoothies" }]
        });
        let refund = json!({ "transactionId": "t-2", "transactionType": "Return" });

        let sale = decode_transaction(&sale, &schema).unwrap();
        assert!(!sale.is_return);
        assert_eq!(sale.member_id.as_deref(), Some("9001"));
        assert_eq!(sale.location_source_id.as_deref(), Some("1001"));
        assert_eq!(sale.line_items.len(), 2);

        assert!(decode_transaction(&refund, &schema).unwrap().is_return);
    }

    #[test]
    fn records_array_flattens_club_envelopes() {
        let body = json!({
            "clubs": [
                { "transactions": [{ "transactionId": "a" }] },
                { "transactions": [{ "transactionId": "b" }, { "transactionId": "c" }] }
            ]
        });
        let rows = records_array(&body, &SourceSchema::default().transaction_list);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn records_array_accepts_bare_arrays_and_missing_envelopes() {
        let schema = SourceSchema::default();
        assert_eq!(records_array(&json!([{ "id": 1 }]), &schema.prospect_list).len(), 1);
        assert!(records_array(&json!({ "status": "ok" }), &schema.prospect_list).is_empty());
    }
}
