use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::{debug, info};
use tryon_contracts::outcome::GeneratedImage;
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::GarmentCategory;

use super::{download_image, extract_urls, send_json, ProviderAdapter};
use crate::config::{env_api_base, non_empty_env};
use crate::context::CallContext;
use crate::error::ProviderError;
use crate::preprocess::PreparedImage;

const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";
/// cuuupid/idm-vton
const DEFAULT_VERSION: &str = "c871bb9b046607b680449ecbae55fd8c6d945e0a1948644bf2361b3d021d3ff4";

/// Replicate IDM-VTON prediction. Created with `Prefer: wait`, then polled
/// until it reaches a terminal status.
#[derive(Debug, Clone)]
pub struct ReplicateAdapter {
    api_base: String,
    version: String,
    api_key: Option<String>,
    poll_interval: Duration,
    http: HttpClient,
}

impl ReplicateAdapter {
    pub fn from_env() -> Self {
        Self {
            api_base: env_api_base("REPLICATE_API_BASE", DEFAULT_API_BASE),
            version: non_empty_env("REPLICATE_TRYON_VERSION")
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            api_key: non_empty_env("REPLICATE_API_TOKEN")
                .or_else(|| non_empty_env("REPLICATE_API_KEY")),
            poll_interval: Duration::from_secs(1),
            http: HttpClient::new(),
        }
    }

    pub fn new(api_base: &str, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            version: DEFAULT_VERSION.to_string(),
            api_key,
            poll_interval: Duration::from_secs(1),
            http: HttpClient::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.clamp(Duration::from_millis(10), Duration::from_secs(5));
        self
    }

    pub fn category_label(category: GarmentCategory) -> &'static str {
        match category {
            GarmentCategory::UpperBody => "upper_body",
            GarmentCategory::LowerBody => "lower_body",
            GarmentCategory::FullBody => "dresses",
        }
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.api_base)
    }

    fn status_of(prediction: &Value) -> String {
        prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn prediction_url(prediction: &Value, key: &str) -> Option<String> {
        prediction
            .get("urls")
            .and_then(Value::as_object)
            .and_then(|urls| urls.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    fn failure(prediction: &Value) -> ProviderError {
        let detail = prediction
            .get("error")
            .and_then(|error| match error {
                Value::String(message) => Some(message.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .unwrap_or_else(|| format!("prediction {}", Self::status_of(prediction)));
        ProviderError::Rejected {
            message: format!("replicate prediction failed: {}", crate::truncate_text(&detail, 512)),
            retryable: false,
        }
    }

    async fn poll_prediction(
        &self,
        ctx: &CallContext,
        poll_url: &str,
        api_key: &str,
    ) -> Result<Value, ProviderError> {
        loop {
            ctx.sleep(self.poll_interval).await?;
            let request = self.http.get(poll_url).bearer_auth(api_key);
            let prediction = send_json(ctx, "replicate poll", request).await?;
            match Self::status_of(&prediction).as_str() {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => return Err(Self::failure(&prediction)),
                status => debug!(status, "replicate prediction pending"),
            }
        }
    }

    /// Fire-and-forget cancel so an abandoned prediction stops billing.
    fn cancel_remote(&self, cancel_url: String, api_key: String) {
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http.post(&cancel_url).bearer_auth(api_key).send().await;
            debug!(url = %cancel_url, ok = result.is_ok(), "replicate prediction cancel sent");
        });
    }
}

impl NamedProvider for ReplicateAdapter {
    fn name(&self) -> &str {
        "replicate"
    }
}

#[async_trait]
impl ProviderAdapter for ReplicateAdapter {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        avatar: &PreparedImage,
        garment: &PreparedImage,
        category: GarmentCategory,
    ) -> Result<GeneratedImage, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::NotConfigured(
                "REPLICATE_API_TOKEN not set".to_string(),
            ));
        };
        let payload = json!({
            "version": self.version,
            "input": {
                "human_img": avatar.data_url(),
                "garm_img": garment.data_url(),
                "garment_des": format!("{} garment", category.as_str().replace('_', " ")),
                "category": Self::category_label(category),
                "crop": false,
                "steps": 30,
                "seed": 42,
            },
        });
        let request = self
            .http
            .post(self.predictions_endpoint())
            .bearer_auth(api_key)
            .header("Prefer", "wait")
            .json(&payload);
        let mut prediction = send_json(ctx, "replicate", request).await?;
        ctx.mark_response_started();
        if let Some(id) = prediction.get("id").and_then(Value::as_str) {
            info!(prediction_id = id, "replicate prediction created");
        }

        match Self::status_of(&prediction).as_str() {
            "succeeded" => {}
            "failed" | "canceled" => return Err(Self::failure(&prediction)),
            _ => {
                let poll_url = Self::prediction_url(&prediction, "get").ok_or_else(|| {
                    ProviderError::Malformed("replicate prediction missing poll URL".to_string())
                })?;
                prediction = match self.poll_prediction(ctx, &poll_url, api_key).await {
                    Ok(done) => done,
                    Err(err) => {
                        if matches!(err, ProviderError::Cancelled | ProviderError::Timeout { .. }) {
                            if let Some(cancel_url) = Self::prediction_url(&prediction, "cancel") {
                                self.cancel_remote(cancel_url, api_key.to_string());
                            }
                        }
                        return Err(err);
                    }
                };
            }
        }

        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            extract_urls(output, &mut urls);
        }
        let Some(url) = urls.first() else {
            return Err(ProviderError::Malformed(
                "replicate response returned no image URLs".to_string(),
            ));
        };
        download_image(ctx, &self.http, "replicate", url).await
    }
}
