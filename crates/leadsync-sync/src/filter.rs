//! Pure qualification rules for fetched records.

use leadsync_core::{first_non_empty, paths, CandidateRecord, FieldPath, Prospect, Transaction};
use serde::{Deserialize, Serialize};

/// Sentinels and field locations used to qualify a record. Every list is tried
/// in order and the first non-empty value wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchFields {
    pub fast_add_entry_source: String,
    pub alternate_report_name: String,
    pub entry_source_paths: Vec<FieldPath>,
    pub report_name_paths: Vec<FieldPath>,
    pub category_paths: Vec<FieldPath>,
    pub line_item_category_paths: Vec<FieldPath>,
}

impl Default for MatchFields {
    fn default() -> Self {
        Self {
            fast_add_entry_source: "fast-add".to_string(),
            alternate_report_name: "Fast Add".to_string(),
            entry_source_paths: paths(&[
                "entrySource",
                "prospectEntrySource",
                "personal.entrySource",
                "agreement.entrySource",
                "marketing.entrySource",
            ]),
            report_name_paths: paths(&[
                "entrySourceReportName",
                "personal.entrySourceReportName",
                "agreement.entrySourceReportName",
            ]),
            category_paths: paths(&[
                "campaignName",
                "campaign.name",
                "agreement.campaignName",
                "personal.campaignName",
                "category",
            ]),
            line_item_category_paths: paths(&[
                "profitCenter",
                "category",
                "item.profitCenter",
                "item.category",
            ]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRules {
    pub target_categories: Vec<String>,
    pub fields: MatchFields,
}

/// Case, spacing and punctuation do not distinguish sentinels: `FAST_ADD`,
/// `fast-add` and `Fast Add` are the same marker.
fn sentinel_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl MatchRules {
    pub fn new(target_categories: Vec<String>, fields: MatchFields) -> Self {
        Self {
            target_categories,
            fields,
        }
    }

    /// The configured spelling of `category` if it is a target category.
    pub fn target_category(&self, category: &str) -> Option<&str> {
        let needle = category.trim();
        self.target_categories
            .iter()
            .find(|c| c.trim().eq_ignore_ascii_case(needle))
            .map(String::as_str)
    }

    fn entry_source_qualifies(&self, prospect: &Prospect) -> bool {
        let marker = first_non_empty(&prospect.attributes, &self.fields.entry_source_paths);
        let report_name = first_non_empty(&prospect.attributes, &self.fields.report_name_paths);

        let marker_hit = marker
            .as_deref()
            .is_some_and(|m| sentinel_key(m) == sentinel_key(&self.fields.fast_add_entry_source));
        let report_hit = report_name
            .as_deref()
            .is_some_and(|r| sentinel_key(r) == sentinel_key(&self.fields.alternate_report_name));
        marker_hit || report_hit
    }

    fn prospect_category(&self, prospect: &Prospect) -> Option<&str> {
        if !self.entry_source_qualifies(prospect) {
            return None;
        }
        let category = first_non_empty(&prospect.attributes, &self.fields.category_paths)?;
        self.target_category(&category)
    }

    fn transaction_category(&self, transaction: &Transaction) -> Option<&str> {
        if transaction.is_return {
            return None;
        }
        transaction
            .line_items
            .iter()
            .filter_map(|item| first_non_empty(&item.attributes, &self.fields.line_item_category_paths))
            .find_map(|category| self.target_category(&category))
    }

    /// The target category that qualifies `record`, or `None` if it does not qualify.
    pub fn matched_category(&self, record: &CandidateRecord) -> Option<&str> {
        match record {
            CandidateRecord::Prospect(p) => self.prospect_category(p),
            CandidateRecord::Transaction(t) => self.transaction_category(t),
        }
    }
}

pub fn matches(record: &CandidateRecord, rules: &MatchRules) -> bool {
    rules.matched_category(record).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_core::{ContactFields, LineItem};
    use serde_json::{json, Value as JsonValue};

    fn rules() -> MatchRules {
        MatchRules::new(
            vec!["Physical Therapy".to_string(), "Personal Training".to_string()],
            MatchFields::default(),
        )
    }

    fn prospect(attributes: JsonValue) -> CandidateRecord {
        CandidateRecord::Prospect(Prospect {
            id: "p-1".into(),
            contact: ContactFields::default(),
            attributes,
        })
    }

    fn transaction(is_return: bool, categories: &[&str]) -> CandidateRecord {
        CandidateRecord::Transaction(Transaction {
            id: "t-1".into(),
            member_id: Some("m-1".into()),
            location_source_id: None,
            is_return,
            line_items: categories
                .iter()
                .map(|c| LineItem {
                    attributes: json!({ "profitCenter": c }),
                })
                .collect(),
        })
    }

    #[test]
    fn fast_add_prospect_in_target_category_matches() {
        let record = prospect(json!({ "entrySource": "fast-add", "campaignName": "Physical Therapy" }));
        assert!(matches(&record, &rules()));
        assert_eq!(rules().matched_category(&record), Some("Physical Therapy"));
    }

    #[test]
    fn missing_entry_source_fails_closed_even_for_target_category() {
        let record = prospect(json!({ "entrySource": "", "campaignName": "Physical Therapy" }));
        assert!(!matches(&record, &rules()));
        let bare = prospect(json!({ "campaignName": "Physical Therapy" }));
        assert!(!matches(&bare, &rules()));
    }

    #[test]
    fn alternate_report_name_qualifies_entry_source() {
        let record = prospect(json!({
            "entrySource": "Walk In",
            "agreement": { "entrySourceReportName": "FAST ADD", "campaignName": "personal training" }
        }));
        assert_eq!(rules().matched_category(&record), Some("Personal Training"));
    }

    #[test]
    fn nested_entry_source_is_used_when_top_level_is_blank() {
        let record = prospect(json!({
            "entrySource": "  ",
            "personal": { "entrySource": "FAST_ADD" },
            "campaign": { "name": "Physical Therapy" }
        }));
        assert!(matches(&record, &rules()));
    }

    #[test]
    fn non_target_category_is_rejected() {
        let record = prospect(json!({ "entrySource": "fast-add", "campaignName": "Swim Lessons" }));
        assert!(!matches(&record, &rules()));
    }

    #[test]
    fn other_entry_source_is_rejected() {
        let record = prospect(json!({ "entrySource": "referral", "campaignName": "Physical Therapy" }));
        assert!(!matches(&record, &rules()));
    }

    #[test]
    fn transaction_matches_on_any_qualifying_line_item() {
        let record = transaction(false, &["Smoothie Bar", "Physical Therapy"]);
        assert_eq!(rules().matched_category(&record), Some("Physical Therapy"));
        assert!(!matches(&transaction(false, &["Smoothie Bar"]), &rules()));
    }

    #[test]
    fn returns_never_match() {
        assert!(!matches(&transaction(true, &["Physical Therapy"]), &rules()));
    }
}
