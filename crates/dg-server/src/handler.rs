use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use dg_core::core::{
    BlobError, CreateDatasetCommand, CreateFineTuneCommand, ExternalError, ItemView,
    PipelineError,
};

use crate::service::{
    CatalogService, FineTuneStatusUpdate, ItemInput, NewCorpus, NewProject, NewPrompt,
    StatusUpdate,
};

const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";
const UPLOAD_FIELD: &str = "file";

// ---------------------------------------------------------------------------
// AppState — shared state for all handlers
// ---------------------------------------------------------------------------

pub struct AppState {
    pub service: CatalogService,
    /// Parent of every per-request token. Cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(service: CatalogService) -> Self {
        Self {
            service,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project))
        .route("/corpora", post(create_corpus))
        .route("/prompts", post(create_prompt))
        .route("/datasets", post(create_dataset))
        .route("/datasets/status", post(update_dataset_status))
        .route("/datasets/{id}", get(get_dataset).delete(delete_dataset))
        .route("/datasets/{id}/resubmit", post(resubmit_dataset))
        .route("/datasets/{id}/ingest", post(ingest_dataset))
        .route("/datasets/{id}/items", get(list_items).put(replace_items))
        .route("/datasets/{id}/csv", get(download_csv).post(append_csv))
        .route("/datasets/{id}/versions", post(new_version))
        .route("/fine-tunes", post(create_fine_tune))
        .route("/fine-tunes/status", post(update_fine_tune_status))
        .route(
            "/fine-tunes/{id}",
            get(get_fine_tune).delete(delete_fine_tune),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// ApiError — what a handler can fail with
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    /// Request shape problems caught before the service is called.
    BadRequest(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Pipeline(err) => pipeline_error_to_response(err),
            Self::BadRequest(message) => {
                error_body(StatusCode::BAD_REQUEST, "invalid_request_error", message)
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Reference registration
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewProject>,
) -> ApiResult<Response> {
    let project = state.service.create_project(input).await?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn create_corpus(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewCorpus>,
) -> ApiResult<Response> {
    let corpus = state.service.create_corpus(input).await?;
    Ok((StatusCode::CREATED, Json(corpus)).into_response())
}

async fn create_prompt(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewPrompt>,
) -> ApiResult<Response> {
    let prompt = state.service.create_prompt(input).await?;
    Ok((StatusCode::CREATED, Json(prompt)).into_response())
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

async fn create_dataset(
    State(state): State<Arc<AppState>>,
    Json(command): Json<CreateDatasetCommand>,
) -> ApiResult<Response> {
    let dataset = state.service.create_dataset(command).await?;
    Ok((StatusCode::CREATED, Json(dataset)).into_response())
}

async fn get_dataset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let dataset = state.service.dataset(id).await?;
    Ok(Json(dataset).into_response())
}

async fn delete_dataset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.service.delete_dataset(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resubmit_dataset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let dataset = state.service.resubmit_dataset(id).await?;
    Ok((StatusCode::ACCEPTED, Json(dataset)).into_response())
}

async fn update_dataset_status(
    State(state): State<Arc<AppState>>,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<Response> {
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    let dataset = state.service.update_dataset_status(update, &cancel).await?;
    Ok(Json(dataset).into_response())
}

async fn ingest_dataset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();
    let report = state.service.ingest_dataset(id, &cancel).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct ItemsQuery {
    limit: Option<usize>,
    #[serde(default)]
    include_corrections: bool,
}

async fn list_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ItemsQuery>,
) -> ApiResult<Response> {
    let view = ItemView {
        include_corrections: query.include_corrections,
        limit: query.limit,
    };
    let items = state.service.dataset_items(id, view).await?;
    Ok(Json(items).into_response())
}

async fn replace_items(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(rows): Json<Vec<ItemInput>>,
) -> ApiResult<Response> {
    let count = state.service.replace_items(id, rows).await?;
    Ok(Json(serde_json::json!({ "dataset_id": id, "items": count })).into_response())
}

async fn download_csv(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let exported = state.service.export_csv(id).await?;
    let disposition = format!("attachment; filename=\"{}\"", exported.filename);
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, CSV_CONTENT_TYPE.to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        exported.body,
    )
        .into_response())
}

async fn append_csv(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let upload = read_upload(multipart).await?;
    let count = state.service.append_csv(id, upload).await?;
    Ok(Json(serde_json::json!({ "dataset_id": id, "items": count })).into_response())
}

async fn new_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let upload = read_upload(multipart).await?;
    let dataset = state.service.new_version_from_csv(id, upload).await?;
    Ok((StatusCode::CREATED, Json(dataset)).into_response())
}

// ---------------------------------------------------------------------------
// Fine-tunes
// ---------------------------------------------------------------------------

async fn create_fine_tune(
    State(state): State<Arc<AppState>>,
    Json(command): Json<CreateFineTuneCommand>,
) -> ApiResult<Response> {
    let fine_tune = state.service.create_fine_tune(command).await?;
    Ok((StatusCode::CREATED, Json(fine_tune)).into_response())
}

async fn get_fine_tune(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let fine_tune = state.service.fine_tune(id).await?;
    Ok(Json(fine_tune).into_response())
}

async fn delete_fine_tune(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.service.delete_fine_tune(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_fine_tune_status(
    State(state): State<Arc<AppState>>,
    Json(update): Json<FineTuneStatusUpdate>,
) -> ApiResult<Response> {
    let fine_tune = state.service.update_fine_tune_status(update).await?;
    Ok(Json(fine_tune).into_response())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns the bytes of the multipart `file` field.
async fn read_upload(mut multipart: Multipart) -> ApiResult<Vec<u8>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
            return Ok(bytes.to_vec());
        }
    }
    Err(ApiError::BadRequest(format!(
        "multipart field '{UPLOAD_FIELD}' is required"
    )))
}

// ---------------------------------------------------------------------------
// Error → Response conversion
// ---------------------------------------------------------------------------

pub fn pipeline_error_to_response(err: PipelineError) -> Response {
    let (status, error_type) = match &err {
        PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
        PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error"),
        PipelineError::Integrity(_) => (StatusCode::UNPROCESSABLE_ENTITY, "integrity_error"),
        PipelineError::External(ExternalError::Cancelled) => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        PipelineError::External(ExternalError::Blob(BlobError::AlreadyExists(_))) => {
            (StatusCode::CONFLICT, "conflict_error")
        }
        PipelineError::External(ExternalError::Blob(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "blob_store_error")
        }
        PipelineError::External(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
    };
    if status.is_server_error() {
        error!(error = %err, status = status.as_u16(), "request failed");
    }
    error_body(status, error_type, err.to_string())
}

fn error_body(status: StatusCode, error_type: &str, message: String) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": status.as_u16(),
        }
    });

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use dg_core::core::{IntegrityError, NotFoundError, ValidationError};

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let cases: Vec<(PipelineError, StatusCode)> = vec![
            (ValidationError::EmptyPromptText.into(), StatusCode::BAD_REQUEST),
            (
                NotFoundError::Project(Uuid::nil()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                IntegrityError::NoResultFiles {
                    prefix: "results/x/".into(),
                }
                .into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                BlobError::Unreachable("down".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BlobError::AlreadyExists("dataset_generation/a.json".into()).into(),
                StatusCode::CONFLICT,
            ),
            (
                ExternalError::Cancelled.into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ExternalError::Store("locked".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(pipeline_error_to_response(err).status(), expected);
        }
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = pipeline_error_to_response(ValidationError::ZeroTargetCount.into());
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["code"], 400);
        assert_eq!(
            body["error"]["message"],
            "target example count must be at least 1"
        );
    }

    #[tokio::test]
    async fn test_bad_request_body() {
        let response = ApiError::BadRequest("multipart field 'file' is required".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "multipart field 'file' is required");
    }
}
