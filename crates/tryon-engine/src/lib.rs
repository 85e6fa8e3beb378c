pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod fetch;
pub mod governor;
pub mod orchestrator;
pub mod preprocess;
pub mod pricing;
pub mod providers;

#[cfg(test)]
mod test_support;

use serde_json::{Map, Value};

pub use config::EngineConfig;
pub use context::{CallContext, CancelSignal, Interrupt};
pub use credentials::{Credential, CredentialBroker, ServiceAccountExchange, ServiceAccountKey};
pub use error::{AuthError, FetchError, OrchestrationError, PreprocessError, ProviderError};
pub use fetch::{DefaultImageSource, ImageSource};
pub use governor::{classify, Governor};
pub use orchestrator::{
    most_actionable, BenchmarkResult, ExecutionPhase, OrchestrationResult, Orchestrator,
    SingleResult,
};
pub use preprocess::{ImagePreprocessor, PreparedImage, PreparedInputs, PreprocessConfig};
pub use pricing::PricingTables;
pub use providers::{
    default_adapter_registry, default_credential_broker, AdapterRegistry, ProviderAdapter,
};

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::truncate_text;

    #[test]
    fn truncate_text_marks_cut() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdef", 3), "abc…");
    }
}
