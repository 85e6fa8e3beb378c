//! Provider adapters and the shared HTTP plumbing they use.

mod dryrun;
mod fal;
mod replicate;
mod vertex;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::Value;
use tryon_contracts::outcome::GeneratedImage;
use tryon_contracts::providers::{NamedProvider, ProviderRegistry};
use tryon_contracts::request::GarmentCategory;

use crate::context::CallContext;
use crate::credentials::CredentialBroker;
use crate::error::ProviderError;
use crate::preprocess::PreparedImage;

pub use dryrun::DryrunAdapter;
pub use fal::FalAdapter;
pub use replicate::ReplicateAdapter;
pub use vertex::{vertex_token_exchange, VertexAdapter};

/// Uniform call contract for one try-on backend.
///
/// Implementations translate the garment category into their own vocabulary,
/// wrap every await in `ctx`, and raise `ctx.mark_response_started()` once the
/// backend has accepted the job.
#[async_trait]
pub trait ProviderAdapter: NamedProvider + Send + Sync {
    /// Whether the credentials this adapter needs are present.
    fn is_configured(&self) -> bool;

    async fn invoke(
        &self,
        ctx: &CallContext,
        avatar: &PreparedImage,
        garment: &PreparedImage,
        category: GarmentCategory,
    ) -> Result<GeneratedImage, ProviderError>;
}

pub type AdapterRegistry = ProviderRegistry<Arc<dyn ProviderAdapter>>;

/// Shipped adapters in default priority order.
pub fn default_adapter_registry(broker: Arc<CredentialBroker>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::default();
    registry.register(Arc::new(FalAdapter::from_env()));
    registry.register(Arc::new(ReplicateAdapter::from_env()));
    registry.register(Arc::new(VertexAdapter::from_env(broker)));
    registry.register(Arc::new(DryrunAdapter::from_env()));
    registry
}

/// Broker with the service-account exchange registered for each provider
/// that has a key configured.
pub fn default_credential_broker() -> CredentialBroker {
    let mut broker = CredentialBroker::new();
    match vertex_token_exchange() {
        Ok(Some(exchange)) => broker.register(vertex::PROVIDER_ID, Arc::new(exchange)),
        Ok(None) => {}
        Err(err) => tracing::warn!(provider = vertex::PROVIDER_ID, error = %err, "ignoring service account key"),
    }
    broker
}

pub(crate) async fn send_json(
    ctx: &CallContext,
    provider: &str,
    request: RequestBuilder,
) -> Result<Value, ProviderError> {
    ctx.call(async {
        let response = request.send().await.map_err(transport_error)?;
        response_json_or_error(provider, response).await
    })
    .await
}

pub(crate) async fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(ProviderError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            retry_after,
            body: crate::truncate_text(&body, 512),
        });
    }
    serde_json::from_str(&body).map_err(|err| {
        ProviderError::Malformed(format!("{provider} returned invalid JSON payload: {err}"))
    })
}

pub(crate) fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transport(err.to_string())
    } else {
        ProviderError::Rejected {
            message: err.to_string(),
            retryable: false,
        }
    }
}

pub(crate) async fn download_image(
    ctx: &CallContext,
    http: &HttpClient,
    provider: &str,
    url: &str,
) -> Result<GeneratedImage, ProviderError> {
    ctx.call(async {
        let response = http.get(url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                provider: format!("{provider} image download"),
                status: status.as_u16(),
                retry_after,
                body: crate::truncate_text(&body, 512),
            });
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(transport_error)?.to_vec();
        Ok(image_from_bytes(bytes, mime_type, Some(url.to_string())))
    })
    .await
}

pub(crate) fn image_from_bytes(
    bytes: Vec<u8>,
    mime_type: Option<String>,
    source_url: Option<String>,
) -> GeneratedImage {
    let mime_type = mime_type
        .map(|mime| mime.split(';').next().unwrap_or_default().trim().to_string())
        .filter(|mime| mime.starts_with("image/"))
        .or_else(|| {
            image::guess_format(&bytes)
                .ok()
                .map(|format| format.to_mime_type().to_string())
        })
        .unwrap_or_else(|| "image/png".to_string());
    let dims = image::load_from_memory(&bytes)
        .ok()
        .map(|decoded| (decoded.width(), decoded.height()));
    GeneratedImage {
        bytes,
        mime_type,
        width: dims.map(|(width, _)| width),
        height: dims.map(|(_, height)| height),
        source_url,
    }
}

/// Collects `http(s)` URLs from the usual output shapes (`url`, `images`,
/// `image`, `output`), deduplicated, in document order.
pub(crate) fn extract_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && trimmed.starts_with("http")
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "images", "image", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}
