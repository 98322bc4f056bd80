//! HTTP surface: a thin layer translating requests into calls on
//! `IngestionFront`, `UploadRegistry`, and `RecoveryLoop`. Framing-level
//! concerns (auth, rate limiting, the balance/CPF query endpoints) are out
//! of scope; this module exposes exactly the six routes the ingestion
//! pipeline itself needs.

use crate::app_state::PipelineState;
use crate::domain::UploadStatus;
use crate::error::IngestError;
use crate::ingestion_front::{self, UploadOutcome};
use crate::recovery_loop::RecoveryLoop;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

pub fn create_router(state: Arc<PipelineState>) -> Router {
    Router::new()
        .route("/uploads", post(create_upload).get(list_uploads))
        .route("/uploads/incomplete", get(list_incomplete_uploads))
        .route("/uploads/:id/resume", post(resume_upload))
        .route("/uploads/resume-all", post(resume_all_uploads))
        .route("/transactions", delete(clear_transactions))
        .with_state(state)
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            IngestError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            IngestError::PayloadTooLarge(..) => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::Registry(_) | IngestError::ObjectStore(_) | IngestError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn create_upload(State(state): State<Arc<PipelineState>>, mut multipart: Multipart) -> Response {
    let mut filename = None;
    let mut content = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return IngestError::BadRequest(format!("malformed multipart body: {e}")).into_response(),
        };
        if field.name() == Some("file") {
            filename = field.file_name().map(str::to_string);
            content = match field.bytes().await {
                Ok(b) => b.to_vec(),
                Err(e) => return IngestError::BadRequest(format!("could not read file part: {e}")).into_response(),
            };
        }
    }

    match ingestion_front::ingest(&state, filename, content).await {
        Ok(UploadOutcome::Accepted { upload_id }) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "message": "File accepted and queued for background processing",
                "status": "processing",
                "uploadId": upload_id,
            })),
        )
            .into_response(),
        Ok(UploadOutcome::Processed { upload_id, status, transaction_count }) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "File processed",
                "count": transaction_count,
                "uploadId": upload_id,
                "status": status,
            })),
        )
            .into_response(),
        Ok(UploadOutcome::Duplicate { existing_upload_id }) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "message": "File already uploaded",
                "existingUploadId": existing_upload_id,
            })),
        )
            .into_response(),
        Err(e) => {
            error!("upload rejected: {e}");
            e.into_response()
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    status: Option<UploadStatus>,
}

fn default_page_size() -> usize {
    20
}

async fn list_uploads(State(state): State<Arc<PipelineState>>, Query(q): Query<ListQuery>) -> Response {
    match state.registry.list(q.page, q.page_size, q.status) {
        Ok(uploads) => Json(uploads).into_response(),
        Err(e) => {
            error!("list uploads failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_incomplete_uploads(State(state): State<Arc<PipelineState>>, Query(q): Query<ListQuery>) -> Response {
    match state.registry.list_incomplete(q.page, q.page_size) {
        Ok(uploads) => Json(uploads).into_response(),
        Err(e) => {
            error!("list incomplete uploads failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn resume_upload(State(state): State<Arc<PipelineState>>, Path(id): Path<String>) -> Response {
    let recovery = RecoveryLoop::new(state);
    match recovery.resume(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            error!("resume failed for {id}: {e}");
            (StatusCode::NOT_FOUND, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

async fn resume_all_uploads(State(state): State<Arc<PipelineState>>) -> Response {
    let recovery = RecoveryLoop::new(state);
    match recovery.resume_all().await {
        Ok(n) => Json(serde_json::json!({ "resumed": n })).into_response(),
        Err(e) => {
            error!("resume-all failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn clear_transactions(State(state): State<Arc<PipelineState>>) -> Response {
    match state.registry.clear_all() {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("clear_all failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
