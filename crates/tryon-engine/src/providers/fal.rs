use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::debug;
use tryon_contracts::outcome::GeneratedImage;
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::GarmentCategory;

use super::{download_image, extract_urls, image_from_bytes, send_json, ProviderAdapter};
use crate::config::{env_api_base, non_empty_env};
use crate::context::CallContext;
use crate::error::ProviderError;
use crate::fetch::decode_data_uri;
use crate::preprocess::PreparedImage;

const DEFAULT_API_BASE: &str = "https://fal.run";
const DEFAULT_ENDPOINT: &str = "fal-ai/fashn/tryon/v1.6";

/// fal.ai FASHN virtual try-on, synchronous run endpoint.
#[derive(Debug, Clone)]
pub struct FalAdapter {
    api_base: String,
    endpoint: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl FalAdapter {
    pub fn from_env() -> Self {
        Self {
            api_base: env_api_base("FAL_API_BASE", DEFAULT_API_BASE),
            endpoint: non_empty_env("FAL_TRYON_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key: non_empty_env("FAL_KEY").or_else(|| non_empty_env("FAL_API_KEY")),
            http: HttpClient::new(),
        }
    }

    pub fn new(api_base: &str, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key,
            http: HttpClient::new(),
        }
    }

    fn resolve_endpoint(&self) -> String {
        let raw = self.endpoint.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return raw.to_string();
        }
        format!("{}/{}", self.api_base, raw.trim_start_matches('/'))
    }

    pub fn category_label(category: GarmentCategory) -> &'static str {
        match category {
            GarmentCategory::UpperBody => "tops",
            GarmentCategory::LowerBody => "bottoms",
            GarmentCategory::FullBody => "one-pieces",
        }
    }

    fn first_inline_image(payload: &Value) -> Option<Result<GeneratedImage, ProviderError>> {
        let url = payload
            .get("images")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(|row| row.get("url").and_then(Value::as_str))
            .find(|url| url.trim_start().starts_with("data:"))?;
        Some(
            decode_data_uri(url)
                .map(|(mime, bytes)| image_from_bytes(bytes, mime, None))
                .map_err(|err| ProviderError::Malformed(format!("fal inline image: {err}"))),
        )
    }
}

impl NamedProvider for FalAdapter {
    fn name(&self) -> &str {
        "fal"
    }
}

#[async_trait]
impl ProviderAdapter for FalAdapter {
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
                "FAL_KEY (or FAL_API_KEY) not set".to_string(),
            ));
        };
        let endpoint = self.resolve_endpoint();
        let payload = json!({
            "model_image": avatar.data_url(),
            "garment_image": garment.data_url(),
            "category": Self::category_label(category),
            "mode": "balanced",
            "num_samples": 1,
            "output_format": "png",
        });
        debug!(endpoint = %endpoint, category = %category, "fal try-on request");
        let request = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .json(&payload);
        let response = send_json(ctx, "fal", request).await?;
        ctx.mark_response_started();

        if let Some(inline) = Self::first_inline_image(&response) {
            return inline;
        }
        let mut urls = Vec::new();
        extract_urls(&response, &mut urls);
        let Some(url) = urls.first() else {
            return Err(ProviderError::Malformed(
                "fal response returned no image URLs".to_string(),
            ));
        };
        download_image(ctx, &self.http, "fal", url).await
    }
}
