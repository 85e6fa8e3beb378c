use std::env;
use std::time::Duration;

use crate::preprocess::PreprocessConfig;

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(2_000);
pub const DEFAULT_PROVIDERS: &[&str] = &["fal", "replicate", "vertex"];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-attempt deadline.
    pub provider_timeout: Duration,
    /// Request-wide deadline shared by race and benchmark dispatches.
    pub global_timeout: Duration,
    /// How long an adapter that ignores its context is waited on.
    pub cancel_grace: Duration,
    pub default_providers: Vec<String>,
    pub preprocess: PreprocessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            default_providers: DEFAULT_PROVIDERS.iter().map(|id| id.to_string()).collect(),
            preprocess: PreprocessConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("TRYON_PROVIDER_TIMEOUT_SECS") {
            config.provider_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("TRYON_GLOBAL_TIMEOUT_SECS") {
            config.global_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env_u64("TRYON_CANCEL_GRACE_MS") {
            config.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(raw) = non_empty_env("TRYON_DEFAULT_PROVIDERS") {
            let providers = parse_provider_list(&raw);
            if !providers.is_empty() {
                config.default_providers = providers;
            }
        }
        config
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_default_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_providers = providers.into_iter().map(Into::into).collect();
        self
    }
}

pub fn parse_provider_list(raw: &str) -> Vec<String> {
    let mut providers: Vec<String> = Vec::new();
    for item in raw.split(',') {
        let id = item.trim().to_ascii_lowercase();
        if id.is_empty() || providers.contains(&id) {
            continue;
        }
        providers.push(id);
    }
    providers
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn env_api_base(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str) -> Option<u64> {
    non_empty_env(key).and_then(|value| value.parse::<u64>().ok())
}
