use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use tracing::{debug, warn};
use tryon_contracts::outcome::GeneratedImage;
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::GarmentCategory;

use super::{image_from_bytes, response_json_or_error, transport_error, ProviderAdapter};
use crate::config::non_empty_env;
use crate::context::CallContext;
use crate::credentials::{
    CredentialBroker, ServiceAccountExchange, ServiceAccountKey, CLOUD_PLATFORM_SCOPE,
};
use crate::error::{AuthError, ProviderError};
use crate::preprocess::PreparedImage;

pub const PROVIDER_ID: &str = "vertex";
const DEFAULT_LOCATION: &str = "us-central1";
const DEFAULT_MODEL: &str = "virtual-try-on-preview-08-04";

/// Service account key from `TRYON_VERTEX_SERVICE_ACCOUNT_JSON` (inline) or
/// the file named by `GOOGLE_APPLICATION_CREDENTIALS`.
fn service_account_key() -> Result<Option<ServiceAccountKey>, AuthError> {
    if let Some(raw) = non_empty_env("TRYON_VERTEX_SERVICE_ACCOUNT_JSON") {
        return ServiceAccountKey::from_json(&raw).map(Some);
    }
    match non_empty_env("GOOGLE_APPLICATION_CREDENTIALS") {
        Some(path) => ServiceAccountKey::from_file(Path::new(&path)).map(Some),
        None => Ok(None),
    }
}

/// Token exchange for the Vertex adapter, or `None` when no key is configured.
pub fn vertex_token_exchange() -> Result<Option<ServiceAccountExchange>, AuthError> {
    Ok(service_account_key()?.map(|key| ServiceAccountExchange::new(key, CLOUD_PLATFORM_SCOPE)))
}

/// Vertex AI virtual try-on `:predict`. The model infers the garment region
/// itself, so the category is not sent.
#[derive(Clone)]
pub struct VertexAdapter {
    broker: Arc<CredentialBroker>,
    project: Option<String>,
    location: String,
    model: String,
    api_base: String,
    http: HttpClient,
}

impl VertexAdapter {
    pub fn from_env(broker: Arc<CredentialBroker>) -> Self {
        let project = non_empty_env("VERTEX_PROJECT")
            .or_else(|| non_empty_env("GOOGLE_CLOUD_PROJECT"))
            .or_else(|| {
                service_account_key()
                    .ok()
                    .flatten()
                    .and_then(|key| key.project_id)
            });
        let location =
            non_empty_env("VERTEX_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let api_base = non_empty_env("VERTEX_API_BASE")
            .map(|raw| raw.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com/v1"));
        Self {
            broker,
            project,
            location,
            model: non_empty_env("VERTEX_TRYON_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_base,
            http: HttpClient::new(),
        }
    }

    pub fn new(broker: Arc<CredentialBroker>, api_base: &str, project: Option<String>) -> Self {
        Self {
            broker,
            project,
            location: DEFAULT_LOCATION.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self, project: &str) -> String {
        format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:predict",
            self.api_base, project, self.location, self.model
        )
    }

    fn extract_predictions(payload: &Value) -> Result<Vec<GeneratedImage>, ProviderError> {
        let mut out = Vec::new();
        let predictions = payload
            .get("predictions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in predictions {
            let Some(obj) = row.as_object() else {
                continue;
            };
            let Some(encoded) = obj
                .get("bytesBase64Encoded")
                .or_else(|| obj.get("bytes_base64_encoded"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let bytes = BASE64.decode(encoded.as_bytes()).map_err(|err| {
                ProviderError::Malformed(format!("vertex image base64 decode failed: {err}"))
            })?;
            let mime_type = obj
                .get("mimeType")
                .or_else(|| obj.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            out.push(image_from_bytes(bytes, mime_type, None));
        }
        Ok(out)
    }
}

impl NamedProvider for VertexAdapter {
    fn name(&self) -> &str {
        PROVIDER_ID
    }
}

#[async_trait]
impl ProviderAdapter for VertexAdapter {
    fn is_configured(&self) -> bool {
        self.project.is_some() && self.broker.has_provider(PROVIDER_ID)
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        avatar: &PreparedImage,
        garment: &PreparedImage,
        category: GarmentCategory,
    ) -> Result<GeneratedImage, ProviderError> {
        let Some(project) = self.project.as_deref() else {
            return Err(ProviderError::NotConfigured(
                "VERTEX_PROJECT (or GOOGLE_CLOUD_PROJECT) not set".to_string(),
            ));
        };
        let credential = ctx
            .call(async {
                self.broker
                    .get_token(PROVIDER_ID)
                    .await
                    .map_err(ProviderError::from)
            })
            .await?;
        let endpoint = self.endpoint(project);
        debug!(endpoint = %endpoint, category = %category, "vertex try-on request");
        let payload = json!({
            "instances": [{
                "personImage": {"image": {"bytesBase64Encoded": avatar.base64()}},
                "productImages": [{"image": {"bytesBase64Encoded": garment.base64()}}],
            }],
            "parameters": {"sampleCount": 1},
        });
        let request = self
            .http
            .post(&endpoint)
            .bearer_auth(&credential.token)
            .json(&payload);
        // A slow body after 2xx headers counts as a provider that was responding.
        let sent = ctx
            .call(async {
                let response = request.send().await.map_err(transport_error)?;
                if response.status().is_success() {
                    ctx.mark_response_started();
                }
                response_json_or_error(PROVIDER_ID, response).await
            })
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, ProviderError::Http { status: 401, .. }) {
                    warn!(provider = PROVIDER_ID, "bearer token rejected; dropping cached token");
                    self.broker.invalidate(PROVIDER_ID);
                }
                return Err(err);
            }
        };

        Self::extract_predictions(&response)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProviderError::Malformed("vertex response returned no predictions".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine as _;
    use serde_json::json;
    use tryon_contracts::request::{GarmentCategory, ImageRole};

    use super::{VertexAdapter, BASE64, PROVIDER_ID};
    use crate::context::{CallContext, CancelSignal};
    use crate::credentials::{CredentialBroker, ExchangedToken, TokenExchange};
    use crate::error::{AuthError, ProviderError};
    use crate::preprocess::PreparedImage;
    use crate::providers::ProviderAdapter;
    use crate::test_support::{StubResponse, StubServer};

    #[derive(Default)]
    struct CountingExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenExchange for CountingExchange {
        async fn exchange(&self) -> Result<ExchangedToken, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ExchangedToken {
                access_token: format!("ya29.token-{call}"),
                expires_in: Duration::from_secs(3600),
            })
        }
    }

    fn broker(exchange: Arc<CountingExchange>) -> Arc<CredentialBroker> {
        let mut broker = CredentialBroker::new();
        broker.register(PROVIDER_ID, exchange);
        Arc::new(broker)
    }

    fn prepared(role: ImageRole) -> PreparedImage {
        PreparedImage::passthrough(role, vec![0xff, 0xd8, 0xff], "test".to_string())
    }

    fn ctx() -> CallContext {
        CallContext::new(CancelSignal::new()).with_timeout(Duration::from_secs(10))
    }

    #[test]
    fn configured_needs_project_and_credentials() {
        let exchange = Arc::new(CountingExchange::default());
        let with_both = VertexAdapter::new(broker(exchange), "http://127.0.0.1:9", Some("p".into()));
        assert!(with_both.is_configured());
        let no_creds = VertexAdapter::new(
            Arc::new(CredentialBroker::new()),
            "http://127.0.0.1:9",
            Some("p".into()),
        );
        assert!(!no_creds.is_configured());
    }

    #[tokio::test]
    async fn predict_uses_broker_token_and_decodes_image() -> anyhow::Result<()> {
        let mut png = Vec::new();
        image::DynamicImage::new_rgb8(5, 7)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;
        let server = StubServer::start(vec![StubResponse::json(
            200,
            json!({"predictions": [{"bytesBase64Encoded": BASE64.encode(&png), "mimeType": "image/png"}]}),
        )])
        .await?;
        let exchange = Arc::new(CountingExchange::default());
        let adapter = VertexAdapter::new(broker(exchange.clone()), server.base(), Some("demo".into()));
        let image = adapter
            .invoke(
                &ctx(),
                &prepared(ImageRole::Avatar),
                &prepared(ImageRole::Garment),
                GarmentCategory::UpperBody,
            )
            .await?;
        assert_eq!((image.width, image.height), (Some(5), Some(7)));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);

        let requests = server.requests();
        assert_eq!(
            requests[0].path,
            "/projects/demo/locations/us-central1/publishers/google/models/virtual-try-on-preview-08-04:predict"
        );
        assert_eq!(requests[0].header("authorization"), Some("Bearer ya29.token-1"));
        let body = requests[0].json();
        assert!(body["instances"][0]["personImage"]["image"]["bytesBase64Encoded"].is_string());
        assert_eq!(body["parameters"]["sampleCount"], json!(1));
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_drops_cached_token() -> anyhow::Result<()> {
        let server = StubServer::start(vec![
            StubResponse::json(401, json!({"error": {"status": "UNAUTHENTICATED"}})),
            StubResponse::json(200, json!({"predictions": []})),
        ])
        .await?;
        let exchange = Arc::new(CountingExchange::default());
        let adapter = VertexAdapter::new(broker(exchange.clone()), server.base(), Some("demo".into()));
        let first = adapter
            .invoke(
                &ctx(),
                &prepared(ImageRole::Avatar),
                &prepared(ImageRole::Garment),
                GarmentCategory::UpperBody,
            )
            .await;
        assert!(matches!(first, Err(ProviderError::Http { status: 401, .. })));

        let second = adapter
            .invoke(
                &ctx(),
                &prepared(ImageRole::Avatar),
                &prepared(ImageRole::Garment),
                GarmentCategory::UpperBody,
            )
            .await;
        assert!(matches!(second, Err(ProviderError::Malformed(_))));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            server.requests()[1].header("authorization"),
            Some("Bearer ya29.token-2")
        );
        Ok(())
    }

    #[tokio::test]
    async fn stalled_body_after_headers_times_out_as_responding() -> anyhow::Result<()> {
        let server = StubServer::start(vec![StubResponse::json(
            200,
            json!({"predictions": []}),
        )
        .with_body_delay(Duration::from_secs(5))])
        .await?;
        let adapter = VertexAdapter::new(
            broker(Arc::new(CountingExchange::default())),
            server.base(),
            Some("demo".into()),
        );
        let ctx = CallContext::new(CancelSignal::new()).with_timeout(Duration::from_millis(300));
        let result = adapter
            .invoke(
                &ctx,
                &prepared(ImageRole::Avatar),
                &prepared(ImageRole::Garment),
                GarmentCategory::UpperBody,
            )
            .await;
        assert!(matches!(result, Err(ProviderError::Timeout { responding: true })));
        Ok(())
    }

    #[tokio::test]
    async fn missing_credentials_surface_auth_error() {
        let adapter = VertexAdapter::new(
            Arc::new(CredentialBroker::new()),
            "http://127.0.0.1:9",
            Some("demo".into()),
        );
        let result = adapter
            .invoke(
                &ctx(),
                &prepared(ImageRole::Avatar),
                &prepared(ImageRole::Garment),
                GarmentCategory::UpperBody,
            )
            .await;
        assert!(matches!(
            result,
            Err(ProviderError::Auth(AuthError::NotConfigured(_)))
        ));
    }
}
