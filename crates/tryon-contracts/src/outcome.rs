use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    /// No answer arrived before the deadline, or the call was cancelled.
    Skipped,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    RateLimited,
    Provider,
    Timeout,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "auth",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Provider => "provider",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized provider error contract every adapter failure is reduced to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderErrorReport {
    pub class: ErrorClass,
    pub retryable: bool,
    pub retry_after_seconds: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetryGuidance {
    pub retry_after_seconds: Option<u64>,
    pub is_rate_limited: bool,
    pub is_terminal: bool,
}

impl RetryGuidance {
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self {
            retry_after_seconds,
            is_rate_limited: true,
            is_terminal: false,
        }
    }

    pub fn terminal() -> Self {
        Self {
            retry_after_seconds: None,
            is_rate_limited: false,
            is_terminal: true,
        }
    }

    pub fn retryable() -> Self {
        Self::default()
    }

    pub fn has_countdown(&self) -> bool {
        self.is_rate_limited && self.retry_after_seconds.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Where the provider served the image from, when it was fetched by URL.
    pub source_url: Option<String>,
}

impl GeneratedImage {
    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        "png"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub provider: String,
    pub status: OutcomeStatus,
    pub image: Option<GeneratedImage>,
    pub duration_ms: u64,
    pub cost_estimate_usd: Option<f64>,
    pub error: Option<ProviderErrorReport>,
    pub guidance: Option<RetryGuidance>,
}

impl GenerationOutcome {
    pub fn success(provider: impl Into<String>, image: GeneratedImage, duration_ms: u64) -> Self {
        Self {
            provider: provider.into(),
            status: OutcomeStatus::Success,
            image: Some(image),
            duration_ms,
            cost_estimate_usd: None,
            error: None,
            guidance: None,
        }
    }

    pub fn unsuccessful(
        provider: impl Into<String>,
        status: OutcomeStatus,
        error: ProviderErrorReport,
        guidance: RetryGuidance,
        duration_ms: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            status,
            image: None,
            duration_ms,
            cost_estimate_usd: None,
            error: Some(error),
            guidance: Some(guidance),
        }
    }

    pub fn with_cost_estimate(mut self, cost_usd: Option<f64>) -> Self {
        self.cost_estimate_usd = cost_usd;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|error| error.class)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outcome_serializes_without_image_bytes() -> anyhow::Result<()> {
        let outcome = GenerationOutcome::success(
            "fal",
            GeneratedImage {
                bytes: vec![1, 2, 3],
                mime_type: "image/png".to_string(),
                width: Some(768),
                height: Some(1024),
                source_url: None,
            },
            1500,
        )
        .with_cost_estimate(Some(0.075));
        let value = serde_json::to_value(&outcome)?;
        assert_eq!(value["status"], json!("success"));
        assert_eq!(value["image"]["mime_type"], json!("image/png"));
        assert!(value["image"].get("bytes").is_none());
        assert_eq!(value["cost_estimate_usd"], json!(0.075));
        Ok(())
    }

    #[test]
    fn guidance_countdown_requires_rate_limit() {
        assert!(RetryGuidance::rate_limited(Some(30)).has_countdown());
        assert!(!RetryGuidance::rate_limited(None).has_countdown());
        let odd = RetryGuidance {
            retry_after_seconds: Some(5),
            is_rate_limited: false,
            is_terminal: false,
        };
        assert!(!odd.has_countdown());
        assert!(RetryGuidance::terminal().is_terminal);
    }

    #[test]
    fn image_extension_follows_mime() {
        let mut image = GeneratedImage {
            bytes: Vec::new(),
            mime_type: "image/jpeg".to_string(),
            width: None,
            height: None,
            source_url: None,
        };
        assert_eq!(image.extension(), "jpg");
        image.mime_type = "image/webp".to_string();
        assert_eq!(image.extension(), "webp");
        image.mime_type = "application/octet-stream".to_string();
        assert_eq!(image.extension(), "png");
    }
}
