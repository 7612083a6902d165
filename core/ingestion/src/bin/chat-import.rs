/// Import a chat export into the configured vector and graph stores
///
/// Usage:
///   chat-import <SOURCE> [--format <format>] [--resume] [--concurrency <n>] [--metadata-only]
///
/// Store endpoints, embedder and write mode come from the same environment
/// variables as the service. Ctrl-C stops scheduling new conversations and
/// prints the statistics of what finished.
use anyhow::Result;
use clap::Parser;
use chat_grapher_ingestion::{ConversationProcessor, ExportFormat, IngestError, PipelineConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-import")]
#[command(about = "Rebuild conversation trees from a chat export and project them into vector and graph stores")]
struct Args {
    /// Export archive or conversations.json file
    source: PathBuf,

    /// Export format (openai_native, json, html, markdown); guessed from the extension when omitted
    #[arg(long, short)]
    format: Option<String>,

    /// Skip conversations the ledger already records as committed
    #[arg(long)]
    resume: bool,

    /// Conversations processed at once
    #[arg(long, short)]
    concurrency: Option<usize>,

    /// Only read and print source metadata
    #[arg(long)]
    metadata_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Chat Grapher - Import Tool v0.1.0");

    let args = Args::parse();

    let format = match &args.format {
        Some(raw) => ExportFormat::parse(raw)?,
        None => ExportFormat::detect(&args.source),
    };
    let importer = format.importer();

    info!("Source: {} ({})", args.source.display(), format.as_str());

    if args.metadata_only {
        let metadata = importer.extract_metadata(&args.source)?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    let config = PipelineConfig::from_env()?;
    let mut processor_config = config.processor_config();
    if let Some(concurrency) = args.concurrency {
        processor_config.concurrency = concurrency.max(1);
    }

    let ledger = config.open_ledger()?;
    if args.resume {
        if ledger.is_none() {
            anyhow::bail!("--resume needs a ledger; set LEDGER_PATH");
        }
        processor_config.resume = true;
    }

    let collaborators = config.build_collaborators().await?;
    let mut processor = ConversationProcessor::new(collaborators, processor_config);
    if let Some(ledger) = ledger {
        processor = processor.with_ledger(ledger);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight conversations");
            interrupt.cancel();
        }
    });

    match processor
        .process_import(importer.as_ref(), &args.source, &cancel)
        .await
    {
        Ok(stats) => {
            info!("");
            info!("Import finished:");
            info!("  Conversations processed: {}", stats.conversations_processed);
            info!("  Conversations skipped: {}", stats.conversations_skipped);
            info!("  Conversations failed: {}", stats.conversations_failed);
            info!("  Vectors created: {}", stats.vectors_created);
            info!("  Relationships created: {}", stats.relationships_created);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Err(IngestError::RunAborted { source, stats }) => {
            error!(
                "Import aborted during {} of {}: {}",
                source.stage(),
                source.conversation().unwrap_or("<unknown>"),
                source
            );
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Err(IngestError::RunAborted { source, stats }.into())
        }
        Err(e) => Err(e.into()),
    }
}
