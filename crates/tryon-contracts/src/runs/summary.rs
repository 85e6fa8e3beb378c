use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::outcome::{GenerationOutcome, OutcomeStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub job_id: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
    /// Provider with the lowest duration among outcomes that actually
    /// resolved. Skipped entries never qualify.
    pub fastest_model: Option<String>,
    pub fastest_duration_ms: Option<u64>,
    pub total_elapsed_ms: u64,
}

impl BenchmarkSummary {
    pub fn from_outcomes(job_id: &str, outcomes: &[GenerationOutcome], total_elapsed_ms: u64) -> Self {
        let mut summary = Self {
            job_id: job_id.to_string(),
            success_count: 0,
            failure_count: 0,
            skipped_count: 0,
            fastest_model: None,
            fastest_duration_ms: None,
            total_elapsed_ms,
        };
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Success => summary.success_count += 1,
                OutcomeStatus::Failed => summary.failure_count += 1,
                OutcomeStatus::Skipped => {
                    summary.skipped_count += 1;
                    continue;
                }
            }
            let faster = summary
                .fastest_duration_ms
                .map(|best| outcome.duration_ms < best)
                .unwrap_or(true);
            if faster {
                summary.fastest_model = Some(outcome.provider.clone());
                summary.fastest_duration_ms = Some(outcome.duration_ms);
            }
        }
        summary
    }

    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count + self.skipped_count
    }
}

pub fn write_report(
    path: &Path,
    summary: &BenchmarkSummary,
    outcomes: &[GenerationOutcome],
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert(
        "outcomes".to_string(),
        Value::Array(
            outcomes
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<Value>, _>>()?,
        ),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
