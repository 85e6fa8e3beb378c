use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client as HttpClient;
use tracing::debug;
use tryon_contracts::request::ImageRef;

use crate::error::FetchError;

/// Resolves an image reference to raw bytes.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_bytes(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError>;
}

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Local files, `http(s)` URLs and inline data URIs.
#[derive(Debug, Clone)]
pub struct DefaultImageSource {
    http: HttpClient,
}

impl Default for DefaultImageSource {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }
}

impl DefaultImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Downloads give up after `timeout`, headers and body included.
    pub fn with_timeout(timeout: Duration) -> Self {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                debug!(error = %err, "falling back to default http client for image fetches");
                HttpClient::new()
            });
        Self { http }
    }

    pub fn with_client(http: HttpClient) -> Self {
        Self { http }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|err| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageSource for DefaultImageSource {
    async fn fetch_bytes(&self, image: &ImageRef) -> Result<Vec<u8>, FetchError> {
        let bytes = match image {
            ImageRef::Path(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| FetchError::Io {
                        path: path.clone(),
                        source,
                    })?
            }
            ImageRef::Url(url) => self.download(url).await?,
            ImageRef::DataUri(uri) => decode_data_uri(uri)?.1,
        };
        if bytes.is_empty() {
            return Err(FetchError::Empty(image.describe()));
        }
        debug!(source = %image, bytes = bytes.len(), "fetched image");
        Ok(bytes)
    }
}

/// Splits `data:<mime>;base64,<payload>` into its mime type and bytes.
pub fn decode_data_uri(uri: &str) -> Result<(Option<String>, Vec<u8>), FetchError> {
    let rest = uri
        .trim()
        .strip_prefix("data:")
        .ok_or_else(|| FetchError::InvalidDataUri("missing data: prefix".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::InvalidDataUri("missing ',' separator".to_string()))?;
    let mut parts = header.split(';');
    let mime = parts
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if !parts.any(|part| part.trim().eq_ignore_ascii_case("base64")) {
        return Err(FetchError::InvalidDataUri(
            "only base64 data uris are supported".to_string(),
        ));
    }
    let bytes = BASE64
        .decode(payload.trim().as_bytes())
        .map_err(|err| FetchError::InvalidDataUri(err.to_string()))?;
    Ok((mime, bytes))
}
