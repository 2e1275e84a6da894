//! studylink-eval - report-to-study matching
//!
//! Reads an evaluate request (JSON, from `--request <path>` or stdin) and
//! prints the evaluation result as JSON. With `--stream`, stdout carries one
//! SSE frame per stage, then a `result` frame, then the completion sentinel
//! as the last frame. `--output <path>` writes the result JSON to a file
//! instead of stdout; with `--stream` the frames are still printed.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use studylink_common::config::StudylinkConfig;
use studylink_eval::attachments::{
    AttachmentProvider, DocumentStore, FileUploader, HttpDocumentStore, HttpFileUploader, InMemoryAttachmentCache,
};
use studylink_eval::gateway::openai::OpenAiBackend;
use studylink_eval::output::{write_result_file, write_sse};
use studylink_eval::{ClassifierGateway, ClassifierVariant, EvaluateRequest, Evaluator, RetryPolicy};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "studylink-eval", version, about = "Match a submitted report to existing studies")]
struct Args {
    /// Evaluate request JSON file (stdin when omitted)
    #[arg(short, long)]
    request: Option<PathBuf>,

    /// Print progress as SSE frames
    #[arg(long)]
    stream: bool,

    /// Also write the result JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Config file (overrides STUDYLINK_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = StudylinkConfig::load(args.config.as_deref());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting studylink-eval {}", env!("CARGO_PKG_VERSION"));

    let raw = read_request(args.request.as_ref())?;
    let request = EvaluateRequest::from_json(&raw).context("Invalid evaluate request")?;

    let default_variant = config.classifier.model.parse().unwrap_or_else(|e| {
        warn!("{}; using {}", e, ClassifierVariant::default());
        ClassifierVariant::default()
    });
    let (report, studies, eval_config) = request.into_parts(default_variant);

    let evaluator = build_evaluator(&config)?;

    if args.stream {
        let (handle, events) = evaluator.evaluate_stream(report, studies, eval_config);
        let mut stdout = std::io::stdout();
        let result = write_sse(events, handle, &mut stdout).await?;
        if let Some(path) = &args.output {
            write_result_file(path, &result).with_context(|| format!("Failed to write {}", path.display()))?;
        }
    } else {
        let result = evaluator.evaluate(report, studies, eval_config).await;
        match &args.output {
            Some(path) => {
                write_result_file(path, &result).with_context(|| format!("Failed to write {}", path.display()))?
            }
            None => println!("{}", serde_json::to_string_pretty(&result)?),
        }
    }

    Ok(())
}

fn read_request(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read request from stdin")?;
            Ok(raw)
        }
    }
}

fn build_evaluator(config: &StudylinkConfig) -> Result<Evaluator> {
    let backend = OpenAiBackend::new(&config.classifier).context("Failed to build classifier backend")?;
    let gateway = ClassifierGateway::new(Arc::new(backend), RetryPolicy::from_settings(&config.classifier));

    let attachments = match HttpDocumentStore::from_settings(&config.document_store)? {
        Some(store) => {
            let uploader: Option<Arc<dyn FileUploader>> = if config.file_upload.enabled {
                HttpFileUploader::from_settings(&config.classifier)?
                    .map(|u| Arc::new(u) as Arc<dyn FileUploader>)
            } else {
                None
            };
            let store: Arc<dyn DocumentStore> = Arc::new(store);
            Some(Arc::new(AttachmentProvider::new(
                store,
                uploader,
                Arc::new(InMemoryAttachmentCache::new()),
            )))
        }
        None => {
            info!("No document store configured; report attachments disabled");
            None
        }
    };

    Ok(Evaluator::new(gateway, attachments))
}
