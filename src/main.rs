use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use docforensics_core::config::{Config, Device, StoreSpec};
use docforensics_core::pipeline::{analyze_path, DocumentAnalyzer};
use docforensics_core::resnet::ResNet;
use docforensics_core::storage::open_store;

/// Score document pages for tampering and print the results as JSON.
#[derive(Debug, Parser)]
#[command(name = "docforensics", version)]
struct Cli {
    /// A PDF/JPEG/PNG file, or a folder of them.
    path: PathBuf,

    /// Loan or customer id; required for localization overlays to be uploaded.
    #[arg(long)]
    document_id: Option<String>,

    #[arg(long)]
    threshold: Option<f64>,

    #[arg(long)]
    dpi: Option<u32>,

    /// JPEG quality used for error level analysis.
    #[arg(long)]
    quality: Option<u8>,

    #[arg(long)]
    device: Option<Device>,

    /// Artifact store, `dir:<path>` or `sled:<path>`.
    #[arg(long)]
    store: Option<StoreSpec>,

    /// ResNet-50 safetensors checkpoint; fetched from the model hub when omitted.
    #[arg(long)]
    weights: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,
}

impl Cli {
    fn apply(self, mut config: Config) -> (PathBuf, Config) {
        if let Some(id) = self.document_id {
            config.document_id = Some(id);
        }
        if let Some(threshold) = self.threshold {
            config.tamper_threshold = threshold;
        }
        if let Some(dpi) = self.dpi {
            config.dpi = dpi;
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(store) = self.store {
            config.artifact_store = Some(store);
        }
        if let Some(weights) = self.weights {
            config.model_weights = Some(weights);
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        (self.path, config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // ----------------------------------------------------------------
    // 0. Configuration: environment first, flags on top
    // ----------------------------------------------------------------
    let cli = Cli::parse();
    let (path, config) = cli.apply(Config::from_env()?);
    config.validate()?;
    info!(
        quality = config.quality,
        dpi = config.dpi,
        threshold = config.tamper_threshold,
        workers = config.workers,
        "configuration loaded"
    );

    // ----------------------------------------------------------------
    // 1. Classifier and artifact store
    // ----------------------------------------------------------------
    let classifier = ResNet::pretrained(config.model_weights.as_deref(), config.device)
        .context("loading classifier")?;
    // One replica per worker, all sharing the loaded weights.
    let replicas: Vec<ResNet> = (1..config.workers.max(1)).map(|_| classifier.fork()).collect();
    let store = config
        .artifact_store
        .as_ref()
        .map(open_store)
        .transpose()
        .context("opening artifact store")?;

    let mut analyzer = DocumentAnalyzer::new(classifier, config).with_replicas(replicas);
    if let Some(store) = store {
        analyzer = analyzer.with_store(store);
    }

    // ----------------------------------------------------------------
    // 2. Analysis
    // ----------------------------------------------------------------
    let envelope = analyze_path(Arc::new(analyzer), &path).await;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
