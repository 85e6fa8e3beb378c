use std::path::PathBuf;

use thiserror::Error;
use tryon_contracts::request::ImageRole;

use crate::context::Interrupt;

/// Failure to obtain a bearer token. Cloned to every caller that shared one
/// in-flight exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential exchange configured for provider '{0}'")]
    NotConfigured(String),
    #[error("invalid service account key: {0}")]
    InvalidKey(String),
    #[error("token exchange rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("token exchange transport error: {0}")]
    Transport(String),
    #[error("token exchange returned malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image download failed ({status}) for {url}")]
    Status { url: String, status: u16 },
    #[error("image download failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("invalid data uri: {0}")]
    InvalidDataUri(String),
    #[error("image source is empty: {0}")]
    Empty(String),
}

/// Decode or encode failure during normalization. Never fatal: callers fall
/// back to the fetched bytes.
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("{role} image decode failed: {message}")]
    Decode { role: ImageRole, message: String },
    #[error("{role} image encode failed: {message}")]
    Encode { role: ImageRole, message: String },
    #[error("preprocessing task aborted: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{provider} request failed ({status}): {body}")]
    Http {
        provider: String,
        status: u16,
        retry_after: Option<String>,
        body: String,
    },
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after_seconds: Option<u64>,
        message: String,
    },
    #[error("{message}")]
    Rejected { message: String, retryable: bool },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("deadline exceeded")]
    Timeout { responding: bool },
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    NotConfigured(String),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("no providers selected")]
    NoProviders,
    #[error("unknown providers: {}", .0.join(", "))]
    UnknownProviders(Vec<String>),
    #[error("failed to fetch {role} image: {source}")]
    Fetch {
        role: ImageRole,
        #[source]
        source: FetchError,
    },
    #[error("request interrupted while preparing images: {0}")]
    Interrupted(Interrupt),
    #[error("job tracker rejected job: {0}")]
    JobTracker(String),
}
