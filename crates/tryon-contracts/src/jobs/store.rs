use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::outcome::GenerationOutcome;
use crate::request::GenerationRequest;

use super::{Job, JobTracker};

/// JSON file of `job_id -> Job`. Every write re-reads the file and only
/// replaces the touched record, so two stores sharing a path do not clobber
/// each other's jobs.
///
/// Tracker calls run their file I/O on the blocking pool; `get` and `list`
/// read synchronously.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    file: Arc<StoreFile>,
}

#[derive(Debug)]
struct StoreFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Arc::new(StoreFile {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        let payload = read_json_object(self.path())?;
        serde_json::from_value(payload.get(job_id)?.clone()).ok()
    }

    pub fn list(&self) -> Vec<Job> {
        read_json_object(self.path())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect()
    }

    async fn modify(
        &self,
        job_id: &str,
        apply: impl FnOnce(Option<Job>) -> anyhow::Result<Job> + Send + 'static,
    ) -> anyhow::Result<Job> {
        let file = self.file.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || file.modify(&job_id, apply))
            .await
            .map_err(|err| anyhow!("job store task failed: {err}"))?
    }

    async fn transition(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut Job) + Send + 'static,
    ) -> anyhow::Result<()> {
        let missing = format!("unknown job '{job_id}'");
        self.modify(job_id, move |current| {
            let mut job = current.ok_or_else(|| anyhow!(missing))?;
            apply(&mut job);
            Ok(job)
        })
        .await?;
        Ok(())
    }
}

impl StoreFile {
    fn modify(
        &self,
        job_id: &str,
        apply: impl FnOnce(Option<Job>) -> anyhow::Result<Job>,
    ) -> anyhow::Result<Job> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("job store lock poisoned"))?;
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        let current = on_disk
            .get(job_id)
            .cloned()
            .and_then(|value| serde_json::from_value::<Job>(value).ok());
        let updated = apply(current)?;
        on_disk.insert(job_id.to_string(), serde_json::to_value(&updated)?);
        write_json_object(&self.path, &on_disk)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(updated)
    }
}

#[async_trait]
impl JobTracker for FileJobStore {
    async fn create_job(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let job_id = request.job_id().to_string();
        let request = request.clone();
        let job = self
            .modify(&job_id, move |current| {
                Ok(match current {
                    Some(mut existing) => {
                        existing.resubmit(&request);
                        existing
                    }
                    None => Job::from_request(&request),
                })
            })
            .await?;
        Ok(job.id)
    }

    async fn mark_processing(&self, job_id: &str) -> anyhow::Result<()> {
        self.transition(job_id, Job::mark_processing).await
    }

    async fn mark_completed(
        &self,
        job_id: &str,
        outcome: &GenerationOutcome,
    ) -> anyhow::Result<()> {
        let outcome = outcome.clone();
        self.transition(job_id, move |job| job.mark_completed(&outcome))
            .await
    }

    async fn mark_failed(&self, job_id: &str, error: &str) -> anyhow::Result<()> {
        let error = error.to_string();
        self.transition(job_id, move |job| job.mark_failed(&error))
            .await
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
