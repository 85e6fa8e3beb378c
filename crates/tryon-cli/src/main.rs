use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tryon_contracts::events::EventWriter;
use tryon_contracts::jobs::FileJobStore;
use tryon_contracts::outcome::GenerationOutcome;
use tryon_contracts::providers::NamedProvider;
use tryon_contracts::request::{
    new_job_id, GarmentCategory, GenerationRequest, ImageRef, ImageRole, Strategy,
};
use tryon_contracts::runs::summary::write_report;
use tryon_engine::{
    default_adapter_registry, default_credential_broker, CancelSignal, DefaultImageSource,
    EngineConfig, Governor, ImagePreprocessor, ImageSource, OrchestrationResult, Orchestrator,
    PricingTables, ProviderAdapter,
};

#[derive(Debug, Parser)]
#[command(name = "tryon-rs", version, about = "Virtual try-on generation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate one try-on image with the cascade or race strategy.
    Run(RunArgs),
    /// Run every selected provider and write a comparison report.
    Benchmark(BenchmarkArgs),
    /// Normalize a single input image without calling any provider.
    Prepare(PrepareArgs),
    /// List registered providers.
    Providers,
}

#[derive(Debug, Args)]
struct InputArgs {
    #[arg(long)]
    avatar: String,
    #[arg(long)]
    garment: String,
    #[arg(long, default_value = "upper_body")]
    category: GarmentCategory,
    /// Provider id; repeat to set priority order. Defaults to the configured list.
    #[arg(long = "provider")]
    providers: Vec<String>,
    #[arg(long)]
    job_id: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    provider_timeout_secs: Option<u64>,
    #[arg(long)]
    global_timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[command(flatten)]
    inputs: InputArgs,
    #[arg(long, default_value = "cascade")]
    strategy: Strategy,
}

#[derive(Debug, Parser)]
struct BenchmarkArgs {
    #[command(flatten)]
    inputs: InputArgs,
}

#[derive(Debug, Parser)]
struct PrepareArgs {
    #[arg(long)]
    image: String,
    #[arg(long, default_value = "avatar")]
    role: ImageRole,
    #[arg(long)]
    out: PathBuf,
}

const EXIT_FAILED_OUTCOME: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tryon-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async move {
        match cli.command {
            Command::Run(args) => run_generation(args.inputs, args.strategy).await,
            Command::Benchmark(args) => run_generation(args.inputs, Strategy::Benchmark).await,
            Command::Prepare(args) => run_prepare(args).await,
            Command::Providers => run_providers(),
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn engine_config(inputs: &InputArgs) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(secs) = inputs.provider_timeout_secs {
        config = config.with_provider_timeout(Duration::from_secs(secs.max(1)));
    }
    if let Some(secs) = inputs.global_timeout_secs {
        config = config.with_global_timeout(Duration::from_secs(secs.max(1)));
    }
    config
}

fn build_orchestrator(inputs: &InputArgs) -> Result<Orchestrator> {
    fs::create_dir_all(&inputs.out)
        .with_context(|| format!("failed to create {}", inputs.out.display()))?;
    let config = engine_config(inputs);
    let registry = default_adapter_registry(Arc::new(default_credential_broker()));
    let source: Arc<dyn ImageSource> = Arc::new(DefaultImageSource::new());
    let preprocessor = ImagePreprocessor::new(source, config.preprocess.clone());
    let governor = Governor::new(config.cancel_grace, Arc::new(PricingTables::load()));
    let tracker = Arc::new(FileJobStore::new(inputs.out.join("jobs.json")));
    let mut orchestrator = Orchestrator::new(registry, preprocessor, governor, tracker, config);
    if let Some(events) = inputs.events.as_ref() {
        orchestrator = orchestrator.with_events(EventWriter::new(events));
    }
    Ok(orchestrator)
}

fn build_request(inputs: &InputArgs, strategy: Strategy) -> GenerationRequest {
    let job_id = inputs.job_id.clone().unwrap_or_else(new_job_id);
    GenerationRequest::new(
        job_id,
        ImageRef::parse(&inputs.avatar),
        ImageRef::parse(&inputs.garment),
        inputs.category,
    )
    .with_strategy(strategy)
    .with_providers(inputs.providers.iter().map(String::as_str))
}

async fn run_generation(inputs: InputArgs, strategy: Strategy) -> Result<i32> {
    let orchestrator = build_orchestrator(&inputs)?;
    let request = build_request(&inputs, strategy);

    let cancel = CancelSignal::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling in-flight providers");
                cancel.cancel();
            }
        })
    };
    let result = orchestrator.orchestrate_with_cancel(request, cancel).await;
    interrupt.abort();
    let result = result?;

    let files = match &result {
        OrchestrationResult::Single(single) => {
            write_outputs(&inputs.out, &single.job_id, std::slice::from_ref(&single.outcome))?
        }
        OrchestrationResult::Benchmark(bench) => {
            let files = write_outputs(&inputs.out, &bench.job_id, &bench.outcomes)?;
            let mut extra = Map::new();
            extra.insert("strategy".to_string(), json!(Strategy::Benchmark.as_str()));
            extra.insert("files".to_string(), json!(display_paths(&files)));
            let report_path = inputs.out.join("benchmark.json");
            write_report(&report_path, &bench.summary, &bench.outcomes, Some(&extra))?;
            files
        }
        OrchestrationResult::AlreadyInFlight { .. } => Vec::new(),
    };

    let mut printed = serde_json::to_value(&result)?;
    if let Value::Object(map) = &mut printed {
        map.insert("files".to_string(), json!(display_paths(&files)));
    }
    println!("{}", serde_json::to_string_pretty(&printed)?);
    Ok(if result.is_success() {
        0
    } else {
        EXIT_FAILED_OUTCOME
    })
}

fn output_path(out: &Path, job_id: &str, outcome: &GenerationOutcome) -> Option<PathBuf> {
    let image = outcome.image.as_ref()?;
    Some(out.join(format!(
        "{job_id}-{}.{}",
        outcome.provider,
        image.extension()
    )))
}

fn write_outputs(out: &Path, job_id: &str, outcomes: &[GenerationOutcome]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for outcome in outcomes {
        let (Some(path), Some(image)) = (output_path(out, job_id, outcome), outcome.image.as_ref())
        else {
            continue;
        };
        fs::write(&path, &image.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|path| path.display().to_string()).collect()
}

async fn run_prepare(args: PrepareArgs) -> Result<i32> {
    let config = EngineConfig::from_env();
    let source: Arc<dyn ImageSource> = Arc::new(DefaultImageSource::new());
    let preprocessor = ImagePreprocessor::new(source, config.preprocess);
    let prepared = preprocessor
        .prepare(&ImageRef::parse(&args.image), args.role)
        .await
        .with_context(|| format!("failed to load {}", args.image))?;
    if let Some(parent) = args.out.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, &prepared.bytes)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "role": prepared.role.as_str(),
            "mime_type": prepared.mime_type,
            "width": prepared.width,
            "height": prepared.height,
            "normalized": prepared.is_normalized(),
            "degraded_reason": prepared.degraded_reason,
            "out": args.out.display().to_string(),
        }))?
    );
    Ok(0)
}

fn run_providers() -> Result<i32> {
    let registry = default_adapter_registry(Arc::new(default_credential_broker()));
    let pricing = PricingTables::load();
    let defaults = EngineConfig::from_env().default_providers;
    for adapter in registry.providers() {
        let name = adapter.name();
        let cost = pricing
            .estimate(name, None)
            .map(|cost| format!("${cost:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{name:<10} configured={:<5} default={:<5} cost_per_image={cost}",
            adapter.is_configured(),
            defaults.iter().any(|id| id == name),
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tryon_contracts::outcome::{GeneratedImage, GenerationOutcome};
    use tryon_contracts::request::{GarmentCategory, ImageRef, Strategy};

    use super::*;

    #[test]
    fn run_args_parse_repeated_providers() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "tryon-rs",
            "run",
            "--avatar",
            "me.jpg",
            "--garment",
            "https://shop.test/shirt.png",
            "--category",
            "bottoms",
            "--strategy",
            "race",
            "--provider",
            "replicate",
            "--provider",
            "fal",
            "--job-id",
            "job-1",
            "--out",
            "out",
        ])?;
        let Command::Run(args) = cli.command else {
            anyhow::bail!("expected run command");
        };
        assert_eq!(args.strategy, Strategy::Race);
        assert_eq!(args.inputs.category, GarmentCategory::LowerBody);
        let request = build_request(&args.inputs, args.strategy);
        assert_eq!(request.job_id(), "job-1");
        assert_eq!(request.providers().to_vec(), vec!["replicate", "fal"]);
        assert!(matches!(request.garment(), ImageRef::Url(_)));
        Ok(())
    }

    #[test]
    fn benchmark_generates_job_id_when_missing() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "tryon-rs", "benchmark", "--avatar", "a.png", "--garment", "g.png", "--out", "out",
        ])?;
        let Command::Benchmark(args) = cli.command else {
            anyhow::bail!("expected benchmark command");
        };
        let request = build_request(&args.inputs, Strategy::Benchmark);
        assert!(request.job_id().starts_with("job-"));
        assert!(request.providers().is_empty());
        Ok(())
    }

    #[test]
    fn timeout_flags_override_config() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "tryon-rs",
            "run",
            "--avatar",
            "a.png",
            "--garment",
            "g.png",
            "--out",
            "out",
            "--provider-timeout-secs",
            "7",
            "--global-timeout-secs",
            "9",
        ])?;
        let Command::Run(args) = cli.command else {
            anyhow::bail!("expected run command");
        };
        let config = engine_config(&args.inputs);
        assert_eq!(config.provider_timeout, Duration::from_secs(7));
        assert_eq!(config.global_timeout, Duration::from_secs(9));
        Ok(())
    }

    #[test]
    fn only_successful_outcomes_are_written() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = GeneratedImage {
            bytes: vec![0x89, b'P', b'N', b'G'],
            mime_type: "image/png".to_string(),
            width: None,
            height: None,
            source_url: None,
        };
        let outcomes = vec![
            GenerationOutcome::success("fal", image, 40),
            GenerationOutcome::unsuccessful(
                "replicate",
                tryon_contracts::outcome::OutcomeStatus::Failed,
                tryon_contracts::outcome::ProviderErrorReport {
                    class: tryon_contracts::outcome::ErrorClass::Provider,
                    retryable: true,
                    retry_after_seconds: None,
                    message: "boom".to_string(),
                },
                tryon_contracts::outcome::RetryGuidance::retryable(),
                80,
            ),
        ];
        let written = write_outputs(temp.path(), "job-9", &outcomes)?;
        assert_eq!(written, vec![temp.path().join("job-9-fal.png")]);
        assert_eq!(fs::read(&written[0])?, vec![0x89, b'P', b'N', b'G']);
        Ok(())
    }
}
