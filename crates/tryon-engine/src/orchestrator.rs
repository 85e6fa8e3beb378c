//! Request execution: provider selection, strategy, fan-out/fan-in and job
//! bookkeeping.
//!
//! One request flows `submitted → preprocessing → dispatching →
//! awaiting_first | awaiting_all → aggregating → completed | failed`. The
//! current phase lives on a `watch` channel per in-flight job id; a second
//! request for the same id is answered with that phase instead of being run.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use tryon_contracts::events::EventWriter;
use tryon_contracts::jobs::JobTracker;
use tryon_contracts::outcome::{
    ErrorClass, GenerationOutcome, OutcomeStatus, ProviderErrorReport, RetryGuidance,
};
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::{GarmentCategory, GenerationRequest, Strategy};
use tryon_contracts::runs::summary::BenchmarkSummary;

use crate::config::EngineConfig;
use crate::context::{CallContext, CancelSignal};
use crate::error::OrchestrationError;
use crate::governor::Governor;
use crate::preprocess::{ImagePreprocessor, PreparedInputs};
use crate::providers::{AdapterRegistry, ProviderAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Submitted,
    Preprocessing,
    Dispatching,
    AwaitingFirst,
    AwaitingAll,
    Aggregating,
    Completed,
    Failed,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Submitted => "submitted",
            ExecutionPhase::Preprocessing => "preprocessing",
            ExecutionPhase::Dispatching => "dispatching",
            ExecutionPhase::AwaitingFirst => "awaiting_first",
            ExecutionPhase::AwaitingAll => "awaiting_all",
            ExecutionPhase::Aggregating => "aggregating",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Completed | ExecutionPhase::Failed)
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cascade or race result. `attempts` keeps every per-provider outcome in
/// dispatch order; `outcome` is the winner or the most actionable failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleResult {
    pub job_id: String,
    pub strategy: Strategy,
    pub outcome: GenerationOutcome,
    pub attempts: Vec<GenerationOutcome>,
    pub guidance: Option<RetryGuidance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkResult {
    pub job_id: String,
    pub outcomes: Vec<GenerationOutcome>,
    pub summary: BenchmarkSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestrationResult {
    Single(SingleResult),
    Benchmark(BenchmarkResult),
    AlreadyInFlight {
        job_id: String,
        phase: ExecutionPhase,
    },
}

impl OrchestrationResult {
    pub fn job_id(&self) -> &str {
        match self {
            OrchestrationResult::Single(result) => &result.job_id,
            OrchestrationResult::Benchmark(result) => &result.job_id,
            OrchestrationResult::AlreadyInFlight { job_id, .. } => job_id,
        }
    }

    /// True when at least one provider produced an image.
    pub fn is_success(&self) -> bool {
        match self {
            OrchestrationResult::Single(result) => result.outcome.is_success(),
            OrchestrationResult::Benchmark(result) => result.summary.success_count > 0,
            OrchestrationResult::AlreadyInFlight { .. } => false,
        }
    }
}

type InflightTable = Arc<Mutex<HashMap<String, watch::Receiver<ExecutionPhase>>>>;

/// Removes the job's idempotency entry however the request ends.
struct InflightGuard {
    table: InflightTable,
    job_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&self.job_id);
        }
    }
}

/// Per-request execution record.
struct Execution {
    job_id: String,
    strategy: Strategy,
    phase: watch::Sender<ExecutionPhase>,
    _guard: InflightGuard,
}

pub struct Orchestrator {
    registry: AdapterRegistry,
    preprocessor: ImagePreprocessor,
    governor: Governor,
    tracker: Arc<dyn JobTracker>,
    config: EngineConfig,
    events: Option<EventWriter>,
    inflight: InflightTable,
}

impl Orchestrator {
    pub fn new(
        registry: AdapterRegistry,
        preprocessor: ImagePreprocessor,
        governor: Governor,
        tracker: Arc<dyn JobTracker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            preprocessor,
            governor,
            tracker,
            config,
            events: None,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Phase updates for a job that is currently running.
    pub fn subscribe(&self, job_id: &str) -> Option<watch::Receiver<ExecutionPhase>> {
        self.inflight
            .lock()
            .ok()
            .and_then(|table| table.get(job_id).cloned())
    }

    pub async fn orchestrate(
        &self,
        request: GenerationRequest,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        self.orchestrate_with_cancel(request, CancelSignal::new())
            .await
    }

    /// Like `orchestrate`; cancelling `cancel` aborts every in-flight call.
    pub async fn orchestrate_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        let adapters = self.select_adapters(&request)?;
        let execution = match self.begin(&request) {
            Ok(execution) => execution,
            Err(phase) => {
                info!(job_id = request.job_id(), phase = %phase, "duplicate request for in-flight job");
                self.emit(
                    "duplicate_request",
                    request.job_id(),
                    json!({ "phase": phase.as_str() }),
                );
                return Ok(OrchestrationResult::AlreadyInFlight {
                    job_id: request.job_id().to_string(),
                    phase,
                });
            }
        };

        let job_id = self
            .tracker
            .create_job(&request)
            .await
            .map_err(|err| OrchestrationError::JobTracker(format!("{err:#}")))?;
        let provider_ids: Vec<&str> = adapters.iter().map(|adapter| adapter.name()).collect();
        info!(
            job_id = %job_id,
            strategy = %request.strategy(),
            category = %request.category(),
            providers = ?provider_ids,
            "job created"
        );
        self.emit(
            "job_created",
            &job_id,
            json!({
                "strategy": request.strategy().as_str(),
                "category": request.category().as_str(),
                "providers": provider_ids,
                "avatar": request.avatar().describe(),
                "garment": request.garment().describe(),
            }),
        );
        if let Err(err) = self.tracker.mark_processing(&job_id).await {
            warn!(job_id = %job_id, error = %err, "job tracker failed to mark processing");
        }

        self.advance(&execution, ExecutionPhase::Preprocessing);
        let preparing = CallContext::new(cancel.clone()).with_timeout(self.config.global_timeout);
        let inputs = match preparing
            .guard(self.preprocessor.prepare_inputs(&request))
            .await
        {
            Ok(Ok(inputs)) => inputs,
            Ok(Err((role, source))) => {
                let message = format!("failed to fetch {role} image: {source}");
                self.fail_job(&execution, &message).await;
                return Err(OrchestrationError::Fetch { role, source });
            }
            Err(interrupt) => {
                let message = format!("image preparation {interrupt}");
                self.fail_job(&execution, &message).await;
                return Err(OrchestrationError::Interrupted(interrupt));
            }
        };
        for prepared in [&inputs.avatar, &inputs.garment] {
            if let Some(reason) = prepared.degraded_reason.as_deref() {
                warn!(job_id = %job_id, role = %prepared.role, reason, "using original image bytes");
            }
        }

        self.advance(&execution, ExecutionPhase::Dispatching);
        let category = request.category();
        let result = match request.strategy() {
            Strategy::Cascade => {
                let attempts = self
                    .run_cascade(&execution, &adapters, &inputs, category, &cancel)
                    .await;
                let winner = attempts.iter().position(GenerationOutcome::is_success);
                self.finish_single(&execution, attempts, winner).await
            }
            Strategy::Race => {
                let (attempts, winner) = self
                    .run_race(&execution, &adapters, inputs, category, &cancel)
                    .await;
                self.finish_single(&execution, attempts, winner).await
            }
            Strategy::Benchmark => {
                self.run_benchmark(&execution, &adapters, inputs, category, &cancel)
                    .await
            }
        };
        Ok(result)
    }

    fn select_adapters(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<Arc<dyn ProviderAdapter>>, OrchestrationError> {
        let ids: Vec<String> = if request.providers().is_empty() {
            self.config.default_providers.clone()
        } else {
            request.providers().to_vec()
        };
        if ids.is_empty() {
            return Err(OrchestrationError::NoProviders);
        }
        let selected = self
            .registry
            .select(&ids)
            .map_err(OrchestrationError::UnknownProviders)?;
        Ok(selected.into_iter().cloned().collect())
    }

    /// Claims the job id, or returns the phase of the run already holding it.
    fn begin(&self, request: &GenerationRequest) -> Result<Execution, ExecutionPhase> {
        let job_id = request.job_id().to_string();
        let mut table = match self.inflight.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = table.get(&job_id) {
            return Err(*existing.borrow());
        }
        let (phase, receiver) = watch::channel(ExecutionPhase::Submitted);
        table.insert(job_id.clone(), receiver);
        drop(table);
        Ok(Execution {
            job_id: job_id.clone(),
            strategy: request.strategy(),
            phase,
            _guard: InflightGuard {
                table: self.inflight.clone(),
                job_id,
            },
        })
    }

    fn advance(&self, execution: &Execution, phase: ExecutionPhase) {
        let previous = execution.phase.send_replace(phase);
        debug!(job_id = %execution.job_id, from = %previous, to = %phase, "phase changed");
        self.emit(
            "phase_changed",
            &execution.job_id,
            json!({ "from": previous.as_str(), "phase": phase.as_str() }),
        );
    }

    async fn run_cascade(
        &self,
        execution: &Execution,
        adapters: &[Arc<dyn ProviderAdapter>],
        inputs: &PreparedInputs,
        category: GarmentCategory,
        cancel: &CancelSignal,
    ) -> Vec<GenerationOutcome> {
        self.advance(execution, ExecutionPhase::AwaitingFirst);
        let root = CallContext::new(cancel.clone());
        let mut attempts = Vec::with_capacity(adapters.len());
        for (index, adapter) in adapters.iter().enumerate() {
            if cancel.is_cancelled() {
                for skipped in &adapters[index..] {
                    attempts.push(abandoned_outcome(
                        skipped.name(),
                        ErrorClass::Cancelled,
                        "request cancelled before attempt",
                        0,
                    ));
                }
                break;
            }
            self.emit(
                "provider_dispatched",
                &execution.job_id,
                json!({ "provider": adapter.name(), "attempt": index + 1 }),
            );
            let ctx = root.child(Some(self.config.provider_timeout));
            let outcome = self
                .governor
                .run(adapter.as_ref(), &ctx, inputs, category)
                .instrument(info_span!("provider", job_id = %execution.job_id, provider = adapter.name()))
                .await;
            self.emit_outcome(&execution.job_id, &outcome);
            let succeeded = outcome.is_success();
            attempts.push(outcome);
            if succeeded {
                break;
            }
            debug!(job_id = %execution.job_id, provider = adapter.name(), "cascade advancing");
        }
        attempts
    }

    /// Returns every outcome in dispatch order plus the slot of the first
    /// success. Late successes collected during the drain never take its place.
    async fn run_race(
        &self,
        execution: &Execution,
        adapters: &[Arc<dyn ProviderAdapter>],
        inputs: PreparedInputs,
        category: GarmentCategory,
        cancel: &CancelSignal,
    ) -> (Vec<GenerationOutcome>, Option<usize>) {
        let started = Instant::now();
        let race_cancel = CancelSignal::new();
        let link = {
            let external = cancel.clone();
            let race_cancel = race_cancel.clone();
            tokio::spawn(async move {
                external.cancelled().await;
                race_cancel.cancel();
            })
        };
        let root = CallContext::new(race_cancel.clone()).with_timeout(self.config.global_timeout);
        let (mut results, handles) =
            self.dispatch(&execution.job_id, adapters, Arc::new(inputs), category, &root);
        self.advance(execution, ExecutionPhase::AwaitingFirst);

        let mut slots: Vec<Option<GenerationOutcome>> = adapters.iter().map(|_| None).collect();
        let collect_until = root.deadline().map(|deadline| deadline + self.governor.cancel_grace());
        let mut winner = None;
        while let Some((index, outcome)) = recv_until(&mut results, collect_until).await {
            self.emit_outcome(&execution.job_id, &outcome);
            let succeeded = outcome.is_success();
            slots[index] = Some(outcome);
            if succeeded {
                winner = Some(index);
                break;
            }
        }

        if let Some(index) = winner {
            info!(
                job_id = %execution.job_id,
                winner = adapters[index].name(),
                "race won; cancelling remaining providers"
            );
            race_cancel.cancel();
            let drain_until = Instant::now() + self.governor.cancel_grace();
            while let Some((index, outcome)) = recv_until(&mut results, Some(drain_until)).await {
                self.emit_outcome(&execution.job_id, &outcome);
                if slots[index].is_none() {
                    slots[index] = Some(outcome);
                }
            }
        }
        for handle in handles {
            handle.abort();
        }
        link.abort();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (class, reason) = if winner.is_some() {
            (ErrorClass::Cancelled, "cancelled after another provider won")
        } else {
            (ErrorClass::Timeout, "no response before the global deadline")
        };
        (fill_missing(adapters, slots, class, reason, elapsed_ms), winner)
    }

    async fn run_benchmark(
        &self,
        execution: &Execution,
        adapters: &[Arc<dyn ProviderAdapter>],
        inputs: PreparedInputs,
        category: GarmentCategory,
        cancel: &CancelSignal,
    ) -> OrchestrationResult {
        let started = Instant::now();
        let root = CallContext::new(cancel.clone()).with_timeout(self.config.global_timeout);
        let (mut results, handles) =
            self.dispatch(&execution.job_id, adapters, Arc::new(inputs), category, &root);
        self.advance(execution, ExecutionPhase::AwaitingAll);

        let mut slots: Vec<Option<GenerationOutcome>> = adapters.iter().map(|_| None).collect();
        let collect_until = root.deadline().map(|deadline| deadline + self.governor.cancel_grace());
        while let Some((index, outcome)) = recv_until(&mut results, collect_until).await {
            self.emit_outcome(&execution.job_id, &outcome);
            slots[index] = Some(outcome);
        }
        for handle in handles {
            handle.abort();
        }

        self.advance(execution, ExecutionPhase::Aggregating);
        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        let outcomes = fill_missing(
            adapters,
            slots,
            ErrorClass::Timeout,
            "no response before the global deadline",
            total_elapsed_ms,
        );
        let summary = BenchmarkSummary::from_outcomes(&execution.job_id, &outcomes, total_elapsed_ms);
        info!(
            job_id = %execution.job_id,
            success = summary.success_count,
            failed = summary.failure_count,
            skipped = summary.skipped_count,
            fastest = summary.fastest_model.as_deref().unwrap_or("-"),
            total_elapsed_ms,
            "benchmark finished"
        );

        let fastest_success = outcomes
            .iter()
            .filter(|outcome| outcome.is_success())
            .min_by_key(|outcome| outcome.duration_ms);
        match fastest_success {
            Some(outcome) => self.complete_job(execution, outcome).await,
            None => {
                let message = most_actionable(&outcomes)
                    .map(failure_message)
                    .unwrap_or_else(|| "no provider produced an image".to_string());
                self.fail_job(execution, &message).await;
            }
        }
        OrchestrationResult::Benchmark(BenchmarkResult {
            job_id: execution.job_id.clone(),
            outcomes,
            summary,
        })
    }

    /// One task per adapter; outcomes arrive tagged with their dispatch index.
    fn dispatch(
        &self,
        job_id: &str,
        adapters: &[Arc<dyn ProviderAdapter>],
        inputs: Arc<PreparedInputs>,
        category: GarmentCategory,
        root: &CallContext,
    ) -> (mpsc::Receiver<(usize, GenerationOutcome)>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(adapters.len().max(1));
        let mut handles = Vec::with_capacity(adapters.len());
        for (index, adapter) in adapters.iter().enumerate() {
            self.emit(
                "provider_dispatched",
                job_id,
                json!({ "provider": adapter.name(), "attempt": index + 1 }),
            );
            let span = info_span!("provider", job_id = %job_id, provider = adapter.name());
            let ctx = root.child(Some(self.config.provider_timeout));
            let governor = self.governor.clone();
            let adapter = adapter.clone();
            let inputs = inputs.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(
                async move {
                    let outcome = governor.run(adapter.as_ref(), &ctx, &inputs, category).await;
                    let _ = tx.send((index, outcome)).await;
                }
                .instrument(span),
            ));
        }
        (rx, handles)
    }

    async fn finish_single(
        &self,
        execution: &Execution,
        attempts: Vec<GenerationOutcome>,
        winner: Option<usize>,
    ) -> OrchestrationResult {
        self.advance(execution, ExecutionPhase::Aggregating);
        let chosen = winner
            .and_then(|index| attempts.get(index))
            .or_else(|| most_actionable(&attempts))
            .cloned();
        let outcome = match chosen {
            Some(outcome) => outcome,
            None => abandoned_outcome(
                "none",
                ErrorClass::Cancelled,
                "no provider was attempted",
                0,
            ),
        };
        if outcome.is_success() {
            self.complete_job(execution, &outcome).await;
        } else {
            self.fail_job(execution, &failure_message(&outcome)).await;
        }
        OrchestrationResult::Single(SingleResult {
            job_id: execution.job_id.clone(),
            strategy: execution.strategy,
            guidance: outcome.guidance,
            outcome,
            attempts,
        })
    }

    async fn complete_job(&self, execution: &Execution, outcome: &GenerationOutcome) {
        if let Err(err) = self.tracker.mark_completed(&execution.job_id, outcome).await {
            warn!(job_id = %execution.job_id, error = %err, "job tracker failed to mark completed");
        }
        self.advance(execution, ExecutionPhase::Completed);
        info!(
            job_id = %execution.job_id,
            strategy = %execution.strategy,
            provider = %outcome.provider,
            duration_ms = outcome.duration_ms,
            "job completed"
        );
        self.emit(
            "job_completed",
            &execution.job_id,
            json!({
                "strategy": execution.strategy.as_str(),
                "provider": outcome.provider,
                "duration_ms": outcome.duration_ms,
                "cost_estimate_usd": outcome.cost_estimate_usd,
            }),
        );
    }

    async fn fail_job(&self, execution: &Execution, message: &str) {
        if let Err(err) = self.tracker.mark_failed(&execution.job_id, message).await {
            warn!(job_id = %execution.job_id, error = %err, "job tracker failed to mark failed");
        }
        self.advance(execution, ExecutionPhase::Failed);
        warn!(job_id = %execution.job_id, strategy = %execution.strategy, error = message, "job failed");
        self.emit(
            "job_failed",
            &execution.job_id,
            json!({ "strategy": execution.strategy.as_str(), "error": message }),
        );
    }

    fn emit_outcome(&self, job_id: &str, outcome: &GenerationOutcome) {
        self.emit(
            "provider_outcome",
            job_id,
            json!({
                "provider": outcome.provider,
                "status": outcome.status.as_str(),
                "duration_ms": outcome.duration_ms,
                "cost_estimate_usd": outcome.cost_estimate_usd,
                "error": outcome.error,
                "guidance": outcome.guidance,
            }),
        );
    }

    fn emit(&self, event_type: &str, job_id: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(event_type, job_id, crate::map_object(payload)) {
            warn!(event = event_type, job_id, error = %err, "failed to write event");
        }
    }
}

/// Next outcome, or `None` once every sender is gone or `until` has passed.
async fn recv_until(
    results: &mut mpsc::Receiver<(usize, GenerationOutcome)>,
    until: Option<Instant>,
) -> Option<(usize, GenerationOutcome)> {
    match until {
        Some(until) => tokio::time::timeout_at(until, results.recv())
            .await
            .ok()
            .flatten(),
        None => results.recv().await,
    }
}

fn abandoned_outcome(
    provider: &str,
    class: ErrorClass,
    reason: &str,
    duration_ms: u64,
) -> GenerationOutcome {
    GenerationOutcome::unsuccessful(
        provider,
        OutcomeStatus::Skipped,
        ProviderErrorReport {
            class,
            retryable: true,
            retry_after_seconds: None,
            message: reason.to_string(),
        },
        RetryGuidance::retryable(),
        duration_ms,
    )
}

fn fill_missing(
    adapters: &[Arc<dyn ProviderAdapter>],
    slots: Vec<Option<GenerationOutcome>>,
    class: ErrorClass,
    reason: &str,
    elapsed_ms: u64,
) -> Vec<GenerationOutcome> {
    slots
        .into_iter()
        .zip(adapters)
        .map(|(slot, adapter)| {
            slot.unwrap_or_else(|| abandoned_outcome(adapter.name(), class, reason, elapsed_ms))
        })
        .collect()
}

/// The failure a caller can act on first: the rate limit with the shortest
/// countdown, then any rate limit, then the last unsuccessful attempt.
pub fn most_actionable(outcomes: &[GenerationOutcome]) -> Option<&GenerationOutcome> {
    let unsuccessful = || outcomes.iter().filter(|outcome| !outcome.is_success());
    let rate_limited = |outcome: &&GenerationOutcome| {
        outcome
            .guidance
            .is_some_and(|guidance| guidance.is_rate_limited)
    };
    unsuccessful()
        .filter(rate_limited)
        .filter_map(|outcome| {
            outcome
                .guidance
                .and_then(|guidance| guidance.retry_after_seconds)
                .map(|seconds| (seconds, outcome))
        })
        .min_by_key(|(seconds, _)| *seconds)
        .map(|(_, outcome)| outcome)
        .or_else(|| unsuccessful().find(rate_limited))
        .or_else(|| unsuccessful().last())
}

fn failure_message(outcome: &GenerationOutcome) -> String {
    let detail = outcome.error_message().unwrap_or("unknown error");
    match outcome.guidance.and_then(|guidance| guidance.retry_after_seconds) {
        Some(seconds) if outcome.guidance.is_some_and(|guidance| guidance.is_rate_limited) => {
            format!("{} rate limited; retry after {seconds}s: {detail}", outcome.provider)
        }
        _ => format!("{}: {detail}", outcome.provider),
    }
}
