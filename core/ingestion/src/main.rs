use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chat_grapher_indexing::{PayloadFilter, SemanticSearch};
use chat_grapher_ingestion::{
    ConversationProcessor, ExportFormat, ImportSlot, IngestError, PipelineConfig, ThreadMetrics,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    processor: Arc<ConversationProcessor>,
    search: Arc<SemanticSearch>,
    imports: Arc<ImportSlot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Chat Grapher Ingestion Service v0.1.0");

    let config = PipelineConfig::from_env()?;
    let collaborators = config.build_collaborators().await?;

    let search = SemanticSearch::new(
        collaborators.vectors.clone(),
        collaborators.embedder.clone(),
        config.collection.clone(),
    );

    let mut processor_config = config.processor_config();
    let ledger = config.open_ledger()?;
    processor_config.resume = ledger.is_some();

    let mut processor = ConversationProcessor::new(collaborators, processor_config);
    if let Some(ledger) = ledger {
        processor = processor.with_ledger(ledger);
    }

    let state = AppState {
        processor: Arc::new(processor),
        search: Arc::new(search),
        imports: Arc::new(ImportSlot::new()),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/import", post(import))
        .route("/import/cancel", post(cancel_import))
        .route("/metadata", post(source_metadata))
        .route("/metrics", post(conversation_metrics))
        .route("/search", post(semantic_search))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Starting HTTP server on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chat-grapher-ingestion",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

#[derive(Debug, Deserialize)]
struct SourceRequest {
    source_path: PathBuf,
    #[serde(default)]
    format: Option<String>,
}

impl SourceRequest {
    fn format(&self) -> Result<ExportFormat, (StatusCode, String)> {
        match &self.format {
            Some(raw) => ExportFormat::parse(raw).map_err(status_for),
            None => Ok(ExportFormat::detect(&self.source_path)),
        }
    }
}

fn status_for(e: IngestError) -> (StatusCode, String) {
    let status = match &e {
        IngestError::InvalidSource { .. }
        | IngestError::UnsupportedFormat(_)
        | IngestError::MalformedSourceData { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

async fn import(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let format = request.format()?;

    info!(
        "Importing {} as {}",
        request.source_path.display(),
        format.as_str()
    );

    // The run outlives this request if the client disconnects
    let running = state
        .imports
        .start(state.processor.clone(), format.importer(), request.source_path)
        .await
        .ok_or_else(|| (StatusCode::CONFLICT, "an import is already running".to_string()))?;

    let result = running.await.map_err(|e| {
        error!("Import task failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    match result {
        Ok(stats) => Ok(Json(serde_json::to_value(&stats).unwrap_or(Value::Null))),
        Err(IngestError::RunAborted { source, stats }) => {
            error!("Import aborted: {}", source);
            let body = serde_json::json!({
                "error": source.to_string(),
                "stage": source.stage().as_str(),
                "conversation_id": source.conversation(),
                "stats": stats,
            });
            Err((StatusCode::INTERNAL_SERVER_ERROR, body.to_string()))
        }
        Err(e) => {
            error!("Import failed: {}", e);
            Err(status_for(e))
        }
    }
}

async fn cancel_import(State(state): State<AppState>) -> impl IntoResponse {
    let cancelled = state.imports.cancel().await;
    Json(serde_json::json!({"cancelled": cancelled}))
}

async fn source_metadata(
    Json(request): Json<SourceRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let format = request.format()?;
    let metadata = format
        .importer()
        .extract_metadata(&request.source_path)
        .map_err(|e| {
            error!("Failed to read metadata: {}", e);
            status_for(e)
        })?;

    Ok(Json(metadata))
}

/// Structural metrics per conversation, without writing to either store
async fn conversation_metrics(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let format = request.format()?;
    let records = format
        .importer()
        .extract_conversations(&request.source_path)
        .map_err(status_for)?;

    let mut metrics: Vec<ThreadMetrics> = Vec::new();
    let mut skipped = 0usize;

    for record in records {
        match record.and_then(|raw| state.processor.reconstruct(&raw)) {
            Ok(thread) => metrics.push(state.processor.extract_metrics(&thread)),
            Err(e) => {
                warn!("Skipping conversation in metrics: {}", e);
                skipped += 1;
            }
        }
    }

    Ok(Json(serde_json::json!({
        "conversations": metrics,
        "skipped": skipped
    })))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    filters: Map<String, Value>,
}

fn default_limit() -> usize {
    10
}

async fn semantic_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let filter = PayloadFilter::from_map(&request.filters);

    let hits = state
        .search
        .search(&request.query, request.limit, &filter)
        .await
        .map_err(|e| {
            error!("Search failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(serde_json::json!({
        "query": request.query,
        "results": hits
    })))
}
