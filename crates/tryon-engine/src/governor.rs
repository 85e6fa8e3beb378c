//! Turns adapter results into outcomes and failures into retry guidance.
//!
//! Nothing here retries. The governor classifies, extracts a countdown when
//! the provider offered one, and abandons adapters that outlive their
//! deadline or cancellation by more than the grace period.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};
use tryon_contracts::outcome::{
    ErrorClass, GeneratedImage, GenerationOutcome, OutcomeStatus, ProviderErrorReport,
    RetryGuidance,
};
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::GarmentCategory;

use crate::context::CallContext;
use crate::error::ProviderError;
use crate::preprocess::PreparedInputs;
use crate::pricing::PricingTables;
use crate::providers::ProviderAdapter;

const RATE_LIMIT_SIGNALS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "try again later",
    "resource_exhausted",
    "resource exhausted",
    "quota exceeded",
];

const COUNTDOWN_PHRASES: &[&str] = &["retry after", "retry-after", "try again in", "retry in"];

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: OutcomeStatus,
    pub report: ProviderErrorReport,
    pub guidance: RetryGuidance,
}

#[derive(Clone)]
pub struct Governor {
    cancel_grace: Duration,
    pricing: Arc<PricingTables>,
}

impl Governor {
    pub fn new(cancel_grace: Duration, pricing: Arc<PricingTables>) -> Self {
        Self {
            cancel_grace,
            pricing,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace
    }

    /// One provider attempt, start to outcome.
    pub async fn run(
        &self,
        adapter: &dyn ProviderAdapter,
        ctx: &CallContext,
        inputs: &PreparedInputs,
        category: GarmentCategory,
    ) -> GenerationOutcome {
        let provider = adapter.name().to_string();
        let started = Instant::now();
        let result = self
            .enforce(
                ctx,
                adapter.invoke(ctx, &inputs.avatar, &inputs.garment, category),
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(image) => {
                info!(provider = %provider, duration_ms, "provider returned image");
                GenerationOutcome::success(provider.as_str(), image, duration_ms)
                    .with_cost_estimate(self.pricing.estimate(&provider, Some(category)))
            }
            Err(err) => {
                let classified = classify(&err);
                warn!(
                    provider = %provider,
                    duration_ms,
                    status = %classified.status,
                    class = %classified.report.class,
                    retry_after_seconds = classified.report.retry_after_seconds,
                    error = %classified.report.message,
                    "provider attempt unsuccessful"
                );
                GenerationOutcome::unsuccessful(
                    provider,
                    classified.status,
                    classified.report,
                    classified.guidance,
                    duration_ms,
                )
            }
        }
    }

    /// Races the adapter against its deadline and cancel signal, each
    /// extended by the grace period.
    async fn enforce<F>(&self, ctx: &CallContext, call: F) -> Result<GeneratedImage, ProviderError>
    where
        F: Future<Output = Result<GeneratedImage, ProviderError>>,
    {
        let grace = self.cancel_grace;
        let past_deadline = async {
            match ctx.deadline() {
                Some(deadline) => tokio::time::sleep_until(deadline + grace).await,
                None => std::future::pending::<()>().await,
            }
        };
        let past_cancel = async {
            ctx.cancel_signal().cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::select! {
            result = call => result,
            _ = past_deadline => Err(ProviderError::Timeout { responding: ctx.response_started() }),
            _ = past_cancel => Err(ProviderError::Cancelled),
        }
    }
}

pub fn classify(err: &ProviderError) -> Classification {
    let message = crate::truncate_text(&err.to_string(), 512);
    match err {
        ProviderError::Auth(_) => terminal(ErrorClass::Auth, message),
        ProviderError::Http {
            status,
            retry_after,
            body,
            ..
        } => {
            if *status == 429 || has_rate_limit_signal(body) {
                let countdown = retry_after
                    .as_deref()
                    .and_then(retry_after_from_header)
                    .or_else(|| retry_after_from_body(body));
                return rate_limited(countdown, message);
            }
            match *status {
                401 | 403 => terminal(ErrorClass::Auth, message),
                408 | 500..=599 => retryable(OutcomeStatus::Failed, ErrorClass::Provider, message),
                _ => terminal(ErrorClass::Provider, message),
            }
        }
        ProviderError::RateLimited {
            retry_after_seconds,
            ..
        } => rate_limited(*retry_after_seconds, message),
        ProviderError::Rejected {
            message: detail,
            retryable: is_retryable,
        } => {
            if has_rate_limit_signal(detail) {
                return rate_limited(retry_after_from_body(detail), message);
            }
            if *is_retryable {
                retryable(OutcomeStatus::Failed, ErrorClass::Provider, message)
            } else {
                terminal(ErrorClass::Provider, message)
            }
        }
        ProviderError::Transport(_) => {
            retryable(OutcomeStatus::Failed, ErrorClass::Provider, message)
        }
        ProviderError::Malformed(_) | ProviderError::NotConfigured(_) => {
            terminal(ErrorClass::Provider, message)
        }
        ProviderError::Timeout { responding } => {
            let status = if *responding {
                OutcomeStatus::Failed
            } else {
                OutcomeStatus::Skipped
            };
            retryable(status, ErrorClass::Timeout, message)
        }
        ProviderError::Cancelled => {
            retryable(OutcomeStatus::Skipped, ErrorClass::Cancelled, message)
        }
    }
}

fn terminal(class: ErrorClass, message: String) -> Classification {
    Classification {
        status: OutcomeStatus::Failed,
        report: ProviderErrorReport {
            class,
            retryable: false,
            retry_after_seconds: None,
            message,
        },
        guidance: RetryGuidance::terminal(),
    }
}

fn retryable(status: OutcomeStatus, class: ErrorClass, message: String) -> Classification {
    Classification {
        status,
        report: ProviderErrorReport {
            class,
            retryable: true,
            retry_after_seconds: None,
            message,
        },
        guidance: RetryGuidance::retryable(),
    }
}

fn rate_limited(countdown: Option<u64>, message: String) -> Classification {
    Classification {
        status: OutcomeStatus::Failed,
        report: ProviderErrorReport {
            class: ErrorClass::RateLimited,
            retryable: true,
            retry_after_seconds: countdown,
            message,
        },
        guidance: RetryGuidance::rate_limited(countdown),
    }
}

pub fn has_rate_limit_signal(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    RATE_LIMIT_SIGNALS
        .iter()
        .any(|signal| lowered.contains(signal))
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn retry_after_from_header(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    if let Some(seconds) = parse_seconds(trimmed) {
        return Some(seconds);
    }
    let at = DateTime::parse_from_rfc2822(trimmed).ok()?;
    let delta = at.with_timezone(&Utc) - Utc::now();
    Some(delta.num_seconds().max(0) as u64)
}

/// Countdown hints inside an error body: JSON fields first, then prose.
pub fn retry_after_from_body(body: &str) -> Option<u64> {
    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        if let Some(seconds) = find_retry_field(&payload) {
            return Some(seconds);
        }
    }
    retry_after_from_text(body)
}

fn find_retry_field(value: &Value) -> Option<u64> {
    match value {
        Value::Object(map) => {
            for key in ["retry_after", "retryAfter", "retry_after_seconds"] {
                if let Some(seconds) = map.get(key).and_then(value_to_seconds) {
                    return Some(seconds);
                }
            }
            // google.rpc.RetryInfo
            if let Some(seconds) = map
                .get("retryDelay")
                .and_then(Value::as_str)
                .and_then(|raw| parse_seconds(raw.trim().trim_end_matches('s')))
            {
                return Some(seconds);
            }
            map.values().find_map(find_retry_field)
        }
        Value::Array(items) => items.iter().find_map(find_retry_field),
        _ => None,
    }
}

fn value_to_seconds(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v.ceil() as u64)),
        Value::String(raw) => parse_seconds(raw.trim().trim_end_matches('s')),
        _ => None,
    }
}

fn retry_after_from_text(text: &str) -> Option<u64> {
    let lowered = text.to_ascii_lowercase();
    for phrase in COUNTDOWN_PHRASES {
        let Some(pos) = lowered.find(phrase) else {
            continue;
        };
        let rest: String = lowered[pos + phrase.len()..].chars().take(16).collect();
        let digits: String = rest
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Some(seconds) = parse_seconds(digits.trim_end_matches('.')) {
            return Some(seconds);
        }
    }
    None
}

fn parse_seconds(raw: &str) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .map(|value| value.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tryon_contracts::outcome::{ErrorClass, OutcomeStatus, RetryGuidance};
    use tryon_contracts::providers::NamedProvider;
    use tryon_contracts::request::{GarmentCategory, ImageRole};

    use super::*;
    use crate::context::{CallContext, CancelSignal};
    use crate::error::AuthError;
    use crate::preprocess::{PreparedImage, PreparedInputs};

    fn http(status: u16, retry_after: Option<&str>, body: &str) -> ProviderError {
        ProviderError::Http {
            provider: "fal".to_string(),
            status,
            retry_after: retry_after.map(str::to_string),
            body: body.to_string(),
        }
    }

    fn inputs() -> PreparedInputs {
        PreparedInputs {
            avatar: PreparedImage::passthrough(ImageRole::Avatar, vec![1], "test".to_string()),
            garment: PreparedImage::passthrough(ImageRole::Garment, vec![2], "test".to_string()),
        }
    }

    #[test]
    fn http_429_with_retry_after_header() {
        let classified = classify(&http(429, Some("30"), "slow down"));
        assert_eq!(classified.status, OutcomeStatus::Failed);
        assert_eq!(
            classified.guidance,
            RetryGuidance {
                retry_after_seconds: Some(30),
                is_rate_limited: true,
                is_terminal: false,
            }
        );
        assert_eq!(classified.report.class, ErrorClass::RateLimited);
        assert!(classified.report.retryable);
        assert_eq!(classified.report.retry_after_seconds, Some(30));
    }

    #[test]
    fn http_date_retry_after_counts_down_from_now() {
        let at = Utc::now() + chrono::Duration::seconds(90);
        let header = at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let seconds = retry_after_from_header(&header).unwrap_or_default();
        assert!((85..=90).contains(&seconds), "{seconds}");
        let past = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(retry_after_from_header(past), Some(0));
    }

    #[test]
    fn body_signals_rate_limit_without_429() {
        let body = json!({
            "error": {
                "code": 400,
                "status": "RESOURCE_EXHAUSTED",
                "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "45s"}]
            }
        })
        .to_string();
        let classified = classify(&http(400, None, &body));
        assert_eq!(classified.guidance, RetryGuidance::rate_limited(Some(45)));
    }

    #[test]
    fn body_countdown_sources() {
        assert_eq!(retry_after_from_body(r#"{"retry_after": 12}"#), Some(12));
        assert_eq!(retry_after_from_body(r#"{"detail": {"retryAfter": "7"}}"#), Some(7));
        assert_eq!(retry_after_from_body(r#"{"retry_after": 2.5}"#), Some(3));
        assert_eq!(
            retry_after_from_body("Rate limit reached. Please try again in 20s."),
            Some(20)
        );
        assert_eq!(retry_after_from_body("Retry after 30 seconds"), Some(30));
        assert_eq!(retry_after_from_body("rate limit, no hint"), None);
    }

    #[test]
    fn rate_limit_without_countdown() {
        let classified = classify(&http(429, None, "Too Many Requests"));
        assert_eq!(classified.guidance, RetryGuidance::rate_limited(None));
    }

    #[test]
    fn auth_failures_are_terminal() {
        for err in [
            http(401, None, "unauthorized"),
            http(403, None, "forbidden"),
            ProviderError::Auth(AuthError::Rejected {
                status: 400,
                body: "invalid_grant".to_string(),
            }),
        ] {
            let classified = classify(&err);
            assert_eq!(classified.report.class, ErrorClass::Auth);
            assert_eq!(classified.guidance, RetryGuidance::terminal());
        }
    }

    #[test]
    fn server_and_transport_errors_are_retryable() {
        for err in [
            http(503, None, "upstream unavailable"),
            ProviderError::Transport("connection reset".to_string()),
        ] {
            let classified = classify(&err);
            assert_eq!(classified.report.class, ErrorClass::Provider);
            assert!(classified.report.retryable);
            assert!(!classified.guidance.is_terminal);
            assert!(!classified.guidance.is_rate_limited);
        }
    }

    #[test]
    fn client_errors_and_missing_config_are_terminal() {
        for err in [
            http(422, None, "invalid garment image"),
            ProviderError::NotConfigured("FAL_KEY not set".to_string()),
            ProviderError::Malformed("no image".to_string()),
        ] {
            assert!(classify(&err).guidance.is_terminal);
        }
    }

    #[test]
    fn timeout_status_depends_on_response_progress() {
        let quiet = classify(&ProviderError::Timeout { responding: false });
        assert_eq!(quiet.status, OutcomeStatus::Skipped);
        assert_eq!(quiet.report.class, ErrorClass::Timeout);
        let busy = classify(&ProviderError::Timeout { responding: true });
        assert_eq!(busy.status, OutcomeStatus::Failed);
        let cancelled = classify(&ProviderError::Cancelled);
        assert_eq!(cancelled.status, OutcomeStatus::Skipped);
        assert_eq!(cancelled.report.class, ErrorClass::Cancelled);
        assert!(cancelled.report.retryable);
    }

    struct StubbornAdapter;

    impl NamedProvider for StubbornAdapter {
        fn name(&self) -> &str {
            "stubborn"
        }
    }

    #[async_trait]
    impl ProviderAdapter for StubbornAdapter {
        fn is_configured(&self) -> bool {
            true
        }

        async fn invoke(
            &self,
            _ctx: &CallContext,
            _avatar: &PreparedImage,
            _garment: &PreparedImage,
            _category: GarmentCategory,
        ) -> Result<GeneratedImage, ProviderError> {
            // Ignores the context entirely.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ProviderError::Transport("unreachable".to_string()))
        }
    }

    struct QuickAdapter;

    impl NamedProvider for QuickAdapter {
        fn name(&self) -> &str {
            "fal"
        }
    }

    #[async_trait]
    impl ProviderAdapter for QuickAdapter {
        fn is_configured(&self) -> bool {
            true
        }

        async fn invoke(
            &self,
            _ctx: &CallContext,
            _avatar: &PreparedImage,
            _garment: &PreparedImage,
            _category: GarmentCategory,
        ) -> Result<GeneratedImage, ProviderError> {
            Ok(GeneratedImage {
                bytes: vec![9],
                mime_type: "image/png".to_string(),
                width: None,
                height: None,
                source_url: None,
            })
        }
    }

    fn governor() -> Governor {
        Governor::new(
            Duration::from_millis(500),
            Arc::new(PricingTables::defaults()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_ignoring_deadline_is_abandoned_after_grace() {
        let ctx = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(2));
        let started = Instant::now();
        let outcome = governor()
            .run(&StubbornAdapter, &ctx, &inputs(), GarmentCategory::UpperBody)
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.error_class(), Some(ErrorClass::Timeout));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_ignoring_cancel_is_abandoned_after_grace() {
        let signal = CancelSignal::new();
        let ctx = CallContext::new(signal.clone());
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let outcome = governor()
            .run(&StubbornAdapter, &ctx, &inputs(), GarmentCategory::UpperBody)
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert_eq!(outcome.error_class(), Some(ErrorClass::Cancelled));
    }

    #[tokio::test]
    async fn success_carries_cost_estimate() {
        let ctx = CallContext::new(CancelSignal::new());
        let outcome = governor()
            .run(&QuickAdapter, &ctx, &inputs(), GarmentCategory::UpperBody)
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.cost_estimate_usd, Some(0.075));
        assert!(outcome.error.is_none());
    }
}
