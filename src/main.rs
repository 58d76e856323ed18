//! Course PDF knowledge extraction server.
//!
//! Upload a course PDF plus a JSON template describing the desired knowledge
//! structure; get back one merged JSON object in the template's shape.

mod config;
mod error;
mod extractor;
mod llm;
mod schema;
mod segmenter;
mod upload;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use config::Settings;
use error::PipelineError;
use extractor::KnowledgeExtractor;
use llm::ChatClient;
use schema::{ErrorResponse, ProcessResponse};
use segmenter::Segmenter;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    segmenter: Arc<Segmenter>,
    pipeline: Arc<KnowledgeExtractor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "course_knowledge_extractor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env()?);
    info!(
        model = %settings.model,
        max_concurrent_chapters = settings.max_concurrent_chapters,
        "Configuration loaded"
    );

    let model = Arc::new(ChatClient::new(&settings)?);
    let state = AppState {
        segmenter: Arc::new(Segmenter::new(settings.chunk_size, settings.chunk_overlap)),
        pipeline: Arc::new(KnowledgeExtractor::new(
            model,
            settings.max_concurrent_chapters,
        )),
        settings: Arc::clone(&settings),
    };

    let body_limit = settings.max_pdf_bytes + settings.max_json_bytes;
    let app = Router::new()
        .route("/", get(root))
        .route("/process", post(process_files))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn root() -> Json<Value> {
    Json(json!({
        "message": "Course PDF Knowledge Extraction API",
        "status": "running",
    }))
}

/// Process a course PDF and a knowledge template into merged knowledge points.
async fn process_files(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ProcessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("process_request", %request_id);

    match run_pipeline(state, multipart).instrument(span).await {
        Ok(data) => Ok(Json(ProcessResponse::new(
            "Knowledge points extracted successfully",
            data,
        ))),
        Err(err) => {
            error!(%request_id, error = %err, "Processing failed");
            let body = if err.is_client_error() {
                ErrorResponse::new(err.to_string())
            } else {
                ErrorResponse::with_detail("Failed to extract knowledge points", err.to_string())
            };
            Err((error_status(&err), Json(body)))
        }
    }
}

/// The full request pipeline: uploads -> template -> text -> chapters ->
/// fan-out extraction -> merge.
async fn run_pipeline(state: AppState, multipart: Multipart) -> Result<Value, PipelineError> {
    let uploads = upload::collect_uploads(multipart, &state.settings).await?;

    let template: Value = serde_json::from_slice(&uploads.template.data)
        .map_err(|e| PipelineError::Validation(format!("Invalid JSON template: {e}")))?;
    schema::validate_template(&template)?;

    let text = extract_pdf_text(&uploads.pdf.data).map_err(|e| {
        PipelineError::Segmentation(format!(
            "Could not extract text from {}: {e}",
            uploads.pdf.filename
        ))
    })?;
    if text.trim().is_empty() {
        return Err(PipelineError::Segmentation(format!(
            "No extractable text in {}",
            uploads.pdf.filename
        )));
    }

    let document_hash = format!("{:x}", Sha256::digest(text.as_bytes()));
    info!(%document_hash, chars = text.len(), "Extracted document text");

    let chapters = state.segmenter.segment(&text);
    state.pipeline.extract_knowledge(chapters, &template).await
}

/// Map pipeline failures to HTTP status codes: caller faults are 4xx,
/// processing faults are 5xx.
fn error_status(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Segmentation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Pipeline { .. } | PipelineError::Merge { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Extract text from a PDF using lopdf, joining pages in reading order.
fn extract_pdf_text(data: &[u8]) -> anyhow::Result<String> {
    use lopdf::Document;
    use std::io::Cursor;

    let doc = Document::load_from(Cursor::new(data))
        .map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let mut text = String::new();
    // get_pages is a BTreeMap, so iteration preserves page order
    for (page_num, _) in doc.get_pages() {
        if let Ok(content) = doc.extract_text(&[page_num]) {
            text.push_str(&content);
            text.push('\n');
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;

    #[test]
    fn validation_maps_to_400() {
        let err = PipelineError::Validation("bad".into());
        assert_eq!(error_status(&err), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unextractable_text_maps_to_422() {
        let err = PipelineError::Segmentation("no text".into());
        assert_eq!(error_status(&err), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn processing_failures_map_to_500() {
        let pipeline = PipelineError::Pipeline { attempted: 3 };
        let merge = PipelineError::Merge {
            source: ModelError::EmptyResponse,
        };
        assert_eq!(error_status(&pipeline), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_status(&merge), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn garbage_bytes_are_not_a_pdf() {
        assert!(extract_pdf_text(b"definitely not a pdf").is_err());
    }
}
