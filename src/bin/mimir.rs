//! mimir CLI: inspect configuration and exercise the engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use tracing::info;

use mimir::backend::EchoBackend;
use mimir::config::Config;
use mimir::{GenerateRequest, Mimir, SamplingParams, StrategyKind};

/// Admission-controlled model pooling engine.
#[derive(Parser)]
#[command(name = "mimir")]
#[command(version = mimir::PKG_VERSION)]
#[command(about = "Admission-controlled model pooling engine")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved configuration as TOML
    Config,

    /// Drive generations against the echo backend and print statistics
    Bench {
        /// Number of requests to submit at once
        #[arg(short = 'n', long, default_value_t = 20)]
        requests: usize,
        /// Number of distinct (virtual) model files
        #[arg(short, long, default_value_t = 2)]
        models: usize,
        /// Simulated inference latency in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
        /// Override the configured instance strategy
        #[arg(long)]
        strategy: Option<StrategyKind>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: info; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load_or_default(args.config.as_deref())?;
    config.apply_env_overrides()?;
    config.validate()?;

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Bench {
            requests,
            models,
            latency_ms,
            strategy,
        } => {
            if let Some(strategy) = strategy {
                config.models.strategy = strategy;
            }
            info!(version = mimir::version_string(), requests, models, "mimir bench starting");

            let backend = EchoBackend::new()
                .latency(Duration::from_millis(latency_ms))
                .virtual_size(1024 * 1024 * 1024);
            let engine = Mimir::builder()
                .from_config(&config)
                .backend(Arc::new(backend))
                .build()?;

            if !config.generation.warmup.is_empty() {
                let report = engine.warmup(&config.generation.warmup).await;
                info!(
                    warmed = report.warmed.len(),
                    skipped = report.skipped.len(),
                    failed = report.failed.len(),
                    "warmup finished"
                );
            }

            let batch: Vec<GenerateRequest> = (0..requests)
                .map(|i| {
                    let path = PathBuf::from(format!("bench-{}.gguf", i % models.max(1)));
                    GenerateRequest::new(path, format!("request {i} says hello"))
                        .sampling(SamplingParams::new().max_tokens(16))
                })
                .collect();

            let started = Instant::now();
            let results = join_all(batch.into_iter().map(|r| engine.submit_generation(r))).await;
            let elapsed = started.elapsed();

            let succeeded = results.iter().filter(|r| r.success).count();
            let report = serde_json::json!({
                "requests": requests,
                "succeeded": succeeded,
                "elapsed_ms": elapsed.as_millis() as u64,
                "service": engine.stats().await,
                "concurrency": engine.concurrency_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            engine.shutdown(Some(Duration::from_secs(5))).await;
        }
    }

    Ok(())
}
