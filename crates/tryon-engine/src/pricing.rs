use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::debug;
use tryon_contracts::request::GarmentCategory;

use crate::config::non_empty_env;

const DEFAULT_PRICING_TABLES_JSON: &str = include_str!("../resources/default_pricing.json");

/// Per-provider cost and latency rows keyed by provider id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PricingTables {
    rows: BTreeMap<String, Map<String, Value>>,
}

impl PricingTables {
    pub fn load() -> Self {
        let mut tables = Self::defaults();
        if let Some(path) = pricing_override_path() {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                debug!(path = %path.display(), "merging pricing overrides");
                tables.merge_json(&raw);
            }
        }
        tables
    }

    pub fn defaults() -> Self {
        Self::from_json(DEFAULT_PRICING_TABLES_JSON)
    }

    pub fn from_json(raw: &str) -> Self {
        let mut tables = Self::default();
        tables.merge_json(raw);
        tables
    }

    /// Field-level merge: override rows replace individual fields, not rows.
    pub fn merge_json(&mut self, raw: &str) {
        let Ok(payload) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(table) = payload.as_object() else {
            return;
        };
        for (pricing_key, row_value) in table {
            let Some(row) = row_value.as_object() else {
                continue;
            };
            let entry = self.rows.entry(pricing_key.to_string()).or_default();
            for (field, field_value) in row {
                entry.insert(field.to_string(), field_value.clone());
            }
        }
    }

    pub fn estimate(&self, provider: &str, category: Option<GarmentCategory>) -> Option<f64> {
        let row = self.rows.get(provider.trim())?;
        if let Some(category) = category {
            if let Some(cost) = row
                .get("cost_per_image_usd_by_category")
                .and_then(Value::as_object)
                .and_then(|by_category| by_category.get(category.as_str()))
                .and_then(parse_value_to_f64)
            {
                return Some(cost);
            }
        }
        row.get("cost_per_image_usd").and_then(parse_value_to_f64)
    }

    pub fn latency_per_image_s(&self, provider: &str) -> Option<f64> {
        self.rows
            .get(provider.trim())?
            .get("latency_per_image_s")
            .and_then(parse_value_to_f64)
    }
}

fn pricing_override_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("TRYON_PRICING_PATH") {
        return Some(PathBuf::from(path));
    }
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".tryon").join("pricing_overrides.json"))
}

fn parse_value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use tryon_contracts::request::GarmentCategory;

    use super::PricingTables;

    #[test]
    fn embedded_defaults_cover_shipped_adapters() {
        let tables = PricingTables::defaults();
        for provider in ["fal", "replicate", "vertex", "dryrun"] {
            assert!(tables.estimate(provider, None).is_some(), "{provider}");
        }
        assert_eq!(tables.estimate("unknown", None), None);
    }

    #[test]
    fn category_specific_cost_wins_over_base() {
        let tables = PricingTables::defaults();
        assert_eq!(
            tables.estimate("replicate", Some(GarmentCategory::FullBody)),
            Some(0.031)
        );
        assert_eq!(
            tables.estimate("replicate", Some(GarmentCategory::UpperBody)),
            Some(0.024)
        );
    }

    #[test]
    fn overrides_merge_per_field() {
        let mut tables = PricingTables::defaults();
        tables.merge_json(r#"{"fal": {"cost_per_image_usd": "0.05"}, "vertex": 7}"#);
        assert_eq!(tables.estimate("fal", None), Some(0.05));
        assert_eq!(tables.latency_per_image_s("fal"), Some(9.0));
        assert_eq!(tables.estimate("vertex", None), Some(0.06));
    }

    #[test]
    fn invalid_override_json_is_ignored() {
        let mut tables = PricingTables::defaults();
        let before = tables.clone();
        tables.merge_json("{not json");
        assert_eq!(tables, before);
    }
}
