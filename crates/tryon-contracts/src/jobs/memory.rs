use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::outcome::GenerationOutcome;
use crate::request::GenerationRequest;

use super::{Job, JobStatus, JobTracker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: IndexMap<String, Job>,
    transitions: Vec<JobTransition>,
}

/// Process-local tracker that keeps every transition for inspection.
#[derive(Debug, Default)]
pub struct MemoryJobTracker {
    state: Mutex<MemoryState>,
}

impl MemoryJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.lock().ok()?.jobs.get(job_id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock()
            .map(|state| state.jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn transitions(&self) -> Vec<JobTransition> {
        self.lock()
            .map(|state| state.transitions.clone())
            .unwrap_or_default()
    }

    pub fn statuses(&self, job_id: &str) -> Vec<JobStatus> {
        self.transitions()
            .into_iter()
            .filter(|transition| transition.job_id == job_id)
            .map(|transition| transition.status)
            .collect()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("job tracker lock poisoned"))
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut Job)) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("unknown job '{job_id}'"))?;
        apply(job);
        let status = job.status;
        state.transitions.push(JobTransition {
            job_id: job_id.to_string(),
            status,
        });
        Ok(())
    }
}

#[async_trait]
impl JobTracker for MemoryJobTracker {
    async fn create_job(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let mut state = self.lock()?;
        let job_id = request.job_id().to_string();
        state
            .jobs
            .entry(job_id.clone())
            .and_modify(|job| job.resubmit(request))
            .or_insert_with(|| Job::from_request(request));
        state.transitions.push(JobTransition {
            job_id: job_id.clone(),
            status: JobStatus::Pending,
        });
        Ok(job_id)
    }

    async fn mark_processing(&self, job_id: &str) -> anyhow::Result<()> {
        self.update(job_id, Job::mark_processing)
    }

    async fn mark_completed(
        &self,
        job_id: &str,
        outcome: &GenerationOutcome,
    ) -> anyhow::Result<()> {
        self.update(job_id, |job| job.mark_completed(outcome))
    }

    async fn mark_failed(&self, job_id: &str, error: &str) -> anyhow::Result<()> {
        self.update(job_id, |job| job.mark_failed(error))
    }
}
