//! Job lifecycle records and the tracker interface the orchestrator writes through.

mod memory;
mod store;

use std::fmt;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::outcome::GenerationOutcome;
use crate::request::{GarmentCategory, GenerationRequest, Strategy};

pub use memory::{JobTransition, MemoryJobTracker};
pub use store::FileJobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub strategy: Strategy,
    pub category: GarmentCategory,
    pub provider: Option<String>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    pub fn from_request(request: &GenerationRequest) -> Self {
        let now = now_utc_iso();
        Self {
            id: request.job_id().to_string(),
            status: JobStatus::Pending,
            retry_count: 0,
            strategy: request.strategy(),
            category: request.category(),
            provider: None,
            result_ref: None,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// A new submission under an existing id. Failed jobs count as a retry.
    pub fn resubmit(&mut self, request: &GenerationRequest) {
        if self.status == JobStatus::Failed {
            self.retry_count = self.retry_count.saturating_add(1);
        }
        self.status = JobStatus::Pending;
        self.strategy = request.strategy();
        self.category = request.category();
        self.error_message = None;
        self.touch();
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.touch();
    }

    pub fn mark_completed(&mut self, outcome: &GenerationOutcome) {
        self.status = JobStatus::Completed;
        self.provider = Some(outcome.provider.clone());
        self.result_ref = Some(result_ref(outcome));
        self.error_message = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.error_message = Some(error.to_string());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = now_utc_iso();
    }
}

/// Persistence collaborator. The orchestrator only ever writes through these
/// four calls and never reads job history back.
#[async_trait]
pub trait JobTracker: Send + Sync {
    async fn create_job(&self, request: &GenerationRequest) -> anyhow::Result<String>;
    async fn mark_processing(&self, job_id: &str) -> anyhow::Result<()>;
    async fn mark_completed(&self, job_id: &str, outcome: &GenerationOutcome)
        -> anyhow::Result<()>;
    async fn mark_failed(&self, job_id: &str, error: &str) -> anyhow::Result<()>;
}

fn result_ref(outcome: &GenerationOutcome) -> String {
    match outcome.image.as_ref() {
        Some(image) => match image.source_url.as_deref() {
            Some(url) => url.to_string(),
            None => format!(
                "inline:{}:{}:{}bytes",
                outcome.provider,
                image.mime_type,
                image.bytes.len()
            ),
        },
        None => format!("none:{}", outcome.provider),
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
