use clap::Parser;
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use youtube_enricher_lib::enricher::EnrichError;
use youtube_enricher_lib::{init_logging, BackendKind, EnrichmentConfig, EnrichmentPipeline, VideoRecord};

/// Enrich a watch-history export with video metadata
#[derive(Parser)]
#[command(name = "youtube-enricher", version)]
struct Cli {
    /// JSON array of records or URLs; `-` reads stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend tried first: llm, api or scraping
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Only use the preferred backend
    #[arg(long)]
    no_fallback: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum identifiers in flight at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// USD ceiling for language-model calls in this run
    #[arg(long)]
    cost_limit: Option<f64>,
}

/// Input entries may be full records or bare URLs
#[derive(Deserialize)]
#[serde(untagged)]
enum InputEntry {
    Url(String),
    Record(VideoRecord),
}

impl From<InputEntry> for VideoRecord {
    fn from(entry: InputEntry) -> Self {
        match entry {
            InputEntry::Url(url) => VideoRecord::from_url(url),
            InputEntry::Record(record) => record,
        }
    }
}

fn build_config(cli: &Cli) -> Result<EnrichmentConfig, EnrichError> {
    let mut config = match &cli.config {
        Some(path) => EnrichmentConfig::load(path)?,
        None => EnrichmentConfig::load_default()?,
    }
    .apply_env()?;

    if let Some(backend) = cli.backend {
        config = config.with_preferred_backend(backend);
    }
    if cli.no_fallback {
        config = config.with_fallback(false);
    }
    if let Some(n) = cli.batch_size {
        config = config.with_batch_size(n);
    }
    if let Some(n) = cli.concurrency {
        config = config.with_max_concurrent_requests(n);
    }
    if let Some(usd) = cli.cost_limit {
        config = config.with_cost_limit(usd);
    }
    config.validate()?;
    Ok(config)
}

fn read_records(input: &str) -> Result<Vec<VideoRecord>, EnrichError> {
    let raw = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| EnrichError::Config(format!("Failed to read stdin: {}", e)))?;
        buf
    } else {
        std::fs::read_to_string(input)
            .map_err(|e| EnrichError::Config(format!("Failed to read {}: {}", input, e)))?
    };

    let entries: Vec<InputEntry> = serde_json::from_str(&raw)?;
    Ok(entries.into_iter().map(VideoRecord::from).collect())
}

async fn run(cli: Cli) -> Result<(), EnrichError> {
    let config = build_config(&cli)?;
    let records = read_records(&cli.input)?;
    info!(records = records.len(), preferred = %config.preferred_backend, "Loaded input");

    let pipeline = EnrichmentPipeline::new(config)?;
    let report = pipeline.enrich(records).await;
    pipeline.shutdown();
    let report = report?;

    let json = serde_json::to_string_pretty(&report)?;
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
