use std::sync::Arc;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crate::codec::decode_chunk;
use crate::errors::UploadError;
use crate::protocol::{
    CancelResponse, ChunkAck, ErrorBody, FinalizeResponse, InitSessionRequest, InitSessionResponse,
    ProgressQuery, ProgressResponse, SessionRequest, UploadChunkRequest, CANCEL_PATH, CHUNK_PATH,
    FINALIZE_PATH, INIT_PATH, OWNER_HEADER, PROGRESS_PATH,
};
use crate::types::OwnerId;
use super::store::SessionStore;

/// Headroom on top of a base64-encoded max-size chunk.
const BODY_OVERHEAD: usize = 64 * 1024;

pub fn router(store: Arc<SessionStore>) -> Router {
    let max_chunk = store.config().max_chunk_size as usize;
    let body_limit = max_chunk.div_ceil(3) * 4 + BODY_OVERHEAD;

    Router::new()
        .route(INIT_PATH, post(init_session))
        .route(CHUNK_PATH, post(upload_chunk))
        .route(PROGRESS_PATH, get(get_progress))
        .route(FINALIZE_PATH, post(finalize))
        .route(CANCEL_PATH, post(cancel))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(store)
}

pub enum ApiError {
    MissingOwner,
    Upload(UploadError),
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        Self::Upload(err)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn status_for(err: &UploadError) -> StatusCode {
    match err {
        UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        UploadError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        UploadError::InvalidChunkIndex { .. }
        | UploadError::InvalidRequest(_)
        | UploadError::Json(_)
        | UploadError::FileRequired(_)
        | UploadError::BelowResumableThreshold { .. } => StatusCode::BAD_REQUEST,
        UploadError::IncompleteUpload { .. } | UploadError::InvalidState(_) | UploadError::Cancelled => {
            StatusCode::CONFLICT
        }
        UploadError::FileMismatch(_) | UploadError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        UploadError::TransientNetwork(_) | UploadError::Http(_) => StatusCode::SERVICE_UNAVAILABLE,
        UploadError::Server { status_code, .. } => {
            StatusCode::from_u16(*status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        UploadError::Storage(_) | UploadError::Io(_) | UploadError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::MissingOwner => {
                let body = ErrorBody {
                    error: "Unauthenticated".to_string(),
                    message: format!("missing {OWNER_HEADER} header"),
                    missing: None,
                    missing_count: None,
                    total_chunks: None,
                };
                return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            }
            ApiError::Upload(err) => err,
        };

        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        } else {
            tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
        }

        let (missing, missing_count) = match &err {
            UploadError::IncompleteUpload { missing, missing_count } => (Some(missing.clone()), Some(*missing_count)),
            _ => (None, None),
        };
        let total_chunks = match &err {
            UploadError::InvalidChunkIndex { total_chunks, .. } => Some(*total_chunks),
            _ => None,
        };
        let body = ErrorBody {
            error: err.code().to_string(),
            message: err.to_string(),
            missing,
            missing_count,
            total_chunks,
        };
        (status, Json(body)).into_response()
    }
}

fn owner(headers: &HeaderMap) -> ApiResult<OwnerId> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(OwnerId::new)
        .ok_or(ApiError::MissingOwner)
}

async fn init_session(
    State(store): State<Arc<SessionStore>>,
    headers: HeaderMap,
    Json(request): Json<InitSessionRequest>,
) -> ApiResult<Json<InitSessionResponse>> {
    let owner = owner(&headers)?;
    Ok(Json(store.init_session(&owner, request).await?))
}

async fn upload_chunk(
    State(store): State<Arc<SessionStore>>,
    headers: HeaderMap,
    Json(request): Json<UploadChunkRequest>,
) -> ApiResult<Json<ChunkAck>> {
    let owner = owner(&headers)?;
    let data = decode_chunk(&request.data)?;
    let ack = store
        .put_chunk(
            &owner,
            &request.session_token,
            request.chunk_index,
            data,
            request.checksum.as_deref(),
        )
        .await?;
    Ok(Json(ack))
}

async fn get_progress(
    State(store): State<Arc<SessionStore>>,
    headers: HeaderMap,
    Query(query): Query<ProgressQuery>,
) -> ApiResult<Json<ProgressResponse>> {
    let owner = owner(&headers)?;
    Ok(Json(store.get_progress(&owner, &query.session_token).await?))
}

async fn finalize(
    State(store): State<Arc<SessionStore>>,
    headers: HeaderMap,
    Json(request): Json<SessionRequest>,
) -> ApiResult<Json<FinalizeResponse>> {
    let owner = owner(&headers)?;
    Ok(Json(store.finalize(&owner, &request.session_token).await?))
}

async fn cancel(
    State(store): State<Arc<SessionStore>>,
    headers: HeaderMap,
    Json(request): Json<SessionRequest>,
) -> ApiResult<Json<CancelResponse>> {
    let owner = owner(&headers)?;
    let success = store.cancel_session(&owner, &request.session_token).await?;
    Ok(Json(CancelResponse { success }))
}
