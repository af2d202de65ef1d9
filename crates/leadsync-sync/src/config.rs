use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use leadsync_adapters::SourceSchema;
use leadsync_core::Location;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::filter::{MatchFields, MatchRules};

/// Process-level knobs read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub settings_path: PathBuf,
    pub source_base_url: String,
    pub source_app_id: String,
    pub source_app_key: String,
    pub sink_base_url: String,
    pub sink_source_id_field: String,
    pub poll_interval: Duration,
    pub location_delay: Duration,
    pub record_delay: Duration,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            settings_path: std::env::var("LEADSYNC_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./leadsync.yaml")),
            source_base_url: std::env::var("SOURCE_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.abcfinancial.com/rest".to_string()),
            source_app_id: std::env::var("SOURCE_APP_ID").unwrap_or_default(),
            source_app_key: std::env::var("SOURCE_APP_KEY").unwrap_or_default(),
            sink_base_url: std::env::var("SINK_API_BASE_URL")
                .unwrap_or_else(|_| "https://rest.gohighlevel.com/v1".to_string()),
            sink_source_id_field: std::env::var("SINK_SOURCE_ID_FIELD")
                .unwrap_or_else(|_| "source_record_id".to_string()),
            poll_interval: Duration::from_secs(env_u64("LEADSYNC_POLL_INTERVAL_SECS", 900).max(1)),
            location_delay: Duration::from_millis(env_u64("LEADSYNC_LOCATION_DELAY_MS", 2000)),
            record_delay: Duration::from_millis(env_u64("LEADSYNC_RECORD_DELAY_MS", 250)),
            scheduler_enabled: std::env::var("LEADSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            user_agent: std::env::var("LEADSYNC_USER_AGENT")
                .unwrap_or_else(|_| "leadsync/0.1".to_string()),
            http_timeout_secs: env_u64("LEADSYNC_HTTP_TIMEOUT_SECS", 20),
        }
    }
}

/// Static deployment settings: locations, categories and tag mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    pub locations: Vec<Location>,
    #[serde(default)]
    pub target_categories: Vec<String>,
    #[serde(default)]
    pub category_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub match_fields: MatchFields,
    #[serde(default)]
    pub source_schema: SourceSchema,
}

impl SyncSettings {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading settings from {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let settings: SyncSettings = serde_yaml::from_str(text).context("parsing settings yaml")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects settings that cannot identify locations; warns about gaps that
    /// only affect individual runs or records.
    pub fn validate(&self) -> Result<()> {
        if self.locations.is_empty() {
            bail!("settings define no locations");
        }
        let mut seen = HashSet::new();
        for location in &self.locations {
            if location.source_id.trim().is_empty() {
                bail!("location `{}` has a blank source_id", location.name);
            }
            if !seen.insert(location.source_id.trim()) {
                bail!("source_id `{}` is configured more than once", location.source_id);
            }
            if location.sink_id.trim().is_empty() || location.sink_credential.trim().is_empty() {
                warn!(location = %location.name, "location has no sink id or credential; its runs will be skipped");
            }
        }
        for category in &self.target_categories {
            if self.tag_for(category).is_none() {
                warn!(category = %category, "target category has no tag mapping; matching records will be skipped");
            }
        }
        Ok(())
    }

    pub fn match_rules(&self) -> MatchRules {
        MatchRules::new(self.target_categories.clone(), self.match_fields.clone())
    }

    pub fn tag_for(&self, category: &str) -> Option<&str> {
        let needle = category.trim();
        self.category_tags
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(needle))
            .map(|(_, tag)| tag.as_str())
            .filter(|tag| !tag.trim().is_empty())
    }

    pub fn location_by_source_id(&self, source_id: &str) -> Option<&Location> {
        self.locations.iter().find(|l| l.source_id == source_id.trim())
    }
}
