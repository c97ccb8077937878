//! Provider catalog (`providers.json`).
//!
//! The catalog is the serialized inventory of configured backends. Unknown
//! fields are preserved on round-trip so foreign tooling can annotate
//! entries without this crate dropping them.

use crate::error::{LlmError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

fn default_true() -> bool {
    true
}

/// One configured provider in `providers.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderEntry {
    pub id: String,
    pub name: String,
    /// Provider type, resolved against the registry's factories.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The full catalog, keyed by provider id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderCatalog {
    #[serde(flatten)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

impl ProviderCatalog {
    pub fn get(&self, provider_id: &str) -> Option<&ProviderEntry> {
        self.providers.get(provider_id)
    }

    pub fn insert(&mut self, entry: ProviderEntry) {
        self.providers.insert(entry.id.clone(), entry);
    }

    /// Load the catalog from a `providers.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| LlmError::Config(format!("cannot read providers.json: {e}")))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Save the catalog to a `providers.json` file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| LlmError::Config(format!("cannot write providers.json: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_unknown_fields() {
        let doc = json!({
            "sim": {
                "id": "sim",
                "name": "Simulation",
                "type": "simulation",
                "config": {"delay": 0.0},
                "models": ["default"],
                "enabled": true,
                "custom_annotation": {"owner": "qa"}
            }
        });

        let catalog: ProviderCatalog = serde_json::from_value(doc.clone()).unwrap();
        let entry = catalog.get("sim").unwrap();
        assert_eq!(entry.kind, "simulation");
        assert!(entry.extra.contains_key("custom_annotation"));

        let back = serde_json::to_value(&catalog).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn defaults_apply() {
        let entry: ProviderEntry = serde_json::from_value(json!({
            "id": "p1",
            "name": "P1",
            "type": "simulation"
        }))
        .unwrap();
        assert!(entry.enabled);
        assert!(entry.models.is_empty());
        assert!(entry.last_health_check.is_none());
    }
}
