use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;
use crate::codec::encode_chunk;
use crate::errors::{Result, UploadError};
use crate::protocol::{
    CancelResponse, ChunkAck, ErrorBody, FinalizeResponse, InitSessionRequest, InitSessionResponse,
    ProgressResponse, SessionRequest, UploadChunkRequest, CANCEL_PATH, CHUNK_PATH, FINALIZE_PATH,
    INIT_PATH, OWNER_HEADER, PROGRESS_PATH,
};
use crate::server::SessionStore;
use crate::types::{OwnerId, SessionToken};
use crate::utils::{retry_with_config, RetryConfig};

/// The scheduler's view of the server.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn init_session(&self, request: InitSessionRequest) -> Result<InitSessionResponse>;

    async fn upload_chunk(&self, token: &SessionToken, index: u32, data: Bytes, checksum: String) -> Result<ChunkAck>;

    async fn get_progress(&self, token: &SessionToken) -> Result<ProgressResponse>;

    async fn finalize(&self, token: &SessionToken) -> Result<FinalizeResponse>;

    async fn cancel(&self, token: &SessionToken) -> Result<bool>;
}

/// JSON-over-HTTP transport.
///
/// Control calls are retried here; chunk sends are not, the scheduler owns their backoff.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    owner: OwnerId,
    retry: Arc<RetryConfig>,
}

impl HttpTransport {
    pub fn new(base_url: &str, owner: OwnerId, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| UploadError::InvalidRequest(format!("invalid server url {base_url}: {err}")))?;
        let client = Client::builder().timeout(timeout).tcp_nodelay(true).build()?;

        Ok(Self {
            client,
            base_url,
            owner,
            retry: Arc::new(RetryConfig::default()),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Arc::new(retry);
        self
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|err| UploadError::internal_error(format!("cannot build url for {path}: {err}")))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B, token: &SessionToken, index: Option<u32>) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path)?)
            .header(OWNER_HEADER, self.owner.as_str())
            .json(body)
            .send()
            .await?;
        parse_response(response, token, index).await
    }
}

/// Maps a response to its body, or the error body back to an [`UploadError`].
async fn parse_response<T: DeserializeOwned>(
    response: Response,
    token: &SessionToken,
    index: Option<u32>,
) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(error_from_body(status, body, token, index)),
        Err(_) => Err(UploadError::server_error(status.as_u16(), text)),
    }
}

fn error_from_body(status: StatusCode, body: ErrorBody, token: &SessionToken, index: Option<u32>) -> UploadError {
    match (body.error.as_str(), index) {
        ("ChecksumMismatch", Some(index)) => return UploadError::ChecksumMismatch { index },
        ("InvalidChunkIndex", Some(index)) => {
            return UploadError::InvalidChunkIndex {
                index,
                total_chunks: body.total_chunks.unwrap_or_default(),
            };
        }
        _ => {}
    }

    match body.error.as_str() {
        "SessionNotFound" => UploadError::SessionNotFound(token.to_string()),
        "Unauthorized" => UploadError::Unauthorized {
            token: token.to_string(),
        },
        "IncompleteUpload" => {
            let missing = body.missing.unwrap_or_default();
            UploadError::IncompleteUpload {
                missing_count: body.missing_count.unwrap_or(missing.len()),
                missing,
            }
        }
        "FileMismatch" => UploadError::FileMismatch(body.message),
        "InvalidState" => UploadError::InvalidState(body.message),
        "InvalidRequest" => UploadError::InvalidRequest(body.message),
        "TransientNetworkError" => UploadError::TransientNetwork(body.message),
        "StorageFailure" => UploadError::Storage(body.message),
        _ => UploadError::server_error(status.as_u16(), body.message),
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn init_session(&self, request: InitSessionRequest) -> Result<InitSessionResponse> {
        let token = request.session_token.clone();
        retry_with_config(&self.retry, || self.post_json(INIT_PATH, &request, &token, None)).await
    }

    async fn upload_chunk(&self, token: &SessionToken, index: u32, data: Bytes, checksum: String) -> Result<ChunkAck> {
        let request = UploadChunkRequest {
            session_token: token.clone(),
            chunk_index: index,
            data: encode_chunk(&data),
            checksum: Some(checksum),
        };
        self.post_json(CHUNK_PATH, &request, token, Some(index)).await
    }

    async fn get_progress(&self, token: &SessionToken) -> Result<ProgressResponse> {
        retry_with_config(&self.retry, || async {
            let mut url = self.url(PROGRESS_PATH)?;
            url.query_pairs_mut().append_pair("session_token", token.as_str());
            let response = self
                .client
                .get(url)
                .header(OWNER_HEADER, self.owner.as_str())
                .send()
                .await?;
            parse_response(response, token, None).await
        })
        .await
    }

    async fn finalize(&self, token: &SessionToken) -> Result<FinalizeResponse> {
        let request = SessionRequest {
            session_token: token.clone(),
        };
        retry_with_config(&self.retry, || self.post_json(FINALIZE_PATH, &request, token, None)).await
    }

    async fn cancel(&self, token: &SessionToken) -> Result<bool> {
        let request = SessionRequest {
            session_token: token.clone(),
        };
        let response: CancelResponse =
            retry_with_config(&self.retry, || self.post_json(CANCEL_PATH, &request, token, None)).await?;
        Ok(response.success)
    }
}

/// In-process transport bound to one owner, for embedding and tests.
#[derive(Clone)]
pub struct LocalTransport {
    store: Arc<SessionStore>,
    owner: OwnerId,
}

impl LocalTransport {
    pub fn new(store: Arc<SessionStore>, owner: OwnerId) -> Self {
        Self { store, owner }
    }
}

#[async_trait]
impl UploadTransport for LocalTransport {
    async fn init_session(&self, request: InitSessionRequest) -> Result<InitSessionResponse> {
        self.store.init_session(&self.owner, request).await
    }

    async fn upload_chunk(&self, token: &SessionToken, index: u32, data: Bytes, checksum: String) -> Result<ChunkAck> {
        self.store
            .put_chunk(&self.owner, token, index, data, Some(&checksum))
            .await
    }

    async fn get_progress(&self, token: &SessionToken) -> Result<ProgressResponse> {
        self.store.get_progress(&self.owner, token).await
    }

    async fn finalize(&self, token: &SessionToken) -> Result<FinalizeResponse> {
        self.store.finalize(&self.owner, token).await
    }

    async fn cancel(&self, token: &SessionToken) -> Result<bool> {
        self.store.cancel_session(&self.owner, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use axum::extract::{Json, State};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use crate::utils::RetryStrategy;

    fn body(error: &str, message: &str) -> ErrorBody {
        ErrorBody {
            error: error.into(),
            message: message.into(),
            missing: None,
            missing_count: None,
            total_chunks: None,
        }
    }

    #[test]
    fn maps_error_bodies_back() {
        let token = SessionToken::parse("t1").unwrap();
        assert!(matches!(
            error_from_body(StatusCode::NOT_FOUND, body("SessionNotFound", "gone"), &token, None),
            UploadError::SessionNotFound(t) if t == "t1"
        ));
        assert!(matches!(
            error_from_body(StatusCode::INTERNAL_SERVER_ERROR, body("StorageFailure", "disk"), &token, None),
            UploadError::Storage(_)
        ));

        let incomplete = ErrorBody {
            missing: Some(vec![4, 5]),
            missing_count: Some(7),
            ..body("IncompleteUpload", "missing")
        };
        match error_from_body(StatusCode::CONFLICT, incomplete, &token, None) {
            UploadError::IncompleteUpload { missing, missing_count } => {
                assert_eq!(missing, vec![4, 5]);
                assert_eq!(missing_count, 7);
            }
            other => panic!("unexpected error {other:?}"),
        }

        // unknown codes keep the status so retry classification still works
        assert!(matches!(
            error_from_body(StatusCode::UNPROCESSABLE_ENTITY, body("ChecksumMismatch", "bad"), &token, Some(3)),
            UploadError::ChecksumMismatch { index: 3 }
        ));

        let out_of_range = ErrorBody {
            total_chunks: Some(4),
            ..body("InvalidChunkIndex", "out of range")
        };
        let err = error_from_body(StatusCode::BAD_REQUEST, out_of_range, &token, Some(9));
        assert!(matches!(err, UploadError::InvalidChunkIndex { index: 9, total_chunks: 4 }));
        assert!(!err.is_retryable());

        let err = error_from_body(StatusCode::IM_A_TEAPOT, body("Teapot", "short and stout"), &token, None);
        assert!(matches!(err, UploadError::Server { status_code: 418, .. }));
    }

    /// Fails every other request with a retryable error.
    async fn flaky_init(
        State(hits): State<Arc<AtomicUsize>>,
        Json(request): Json<InitSessionRequest>,
    ) -> axum::response::Response {
        if hits.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            let busy = body("TransientNetworkError", "try again");
            return (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(busy)).into_response();
        }
        Json(InitSessionResponse {
            session_token: request.session_token,
            total_chunks: 2,
            chunk_size_bytes: 5,
        })
        .into_response()
    }

    #[tokio::test]
    async fn control_calls_follow_the_retry_config() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(INIT_PATH, post(flaky_init)).with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let request = InitSessionRequest {
            session_token: SessionToken::parse("t1").unwrap(),
            filename: "a.bin".into(),
            mime_type: "application/octet-stream".into(),
            total_size_bytes: 10,
            chunk_size_bytes: Some(5),
        };
        let transport = |attempts| {
            HttpTransport::new(&base, OwnerId::new("alice"), Duration::from_secs(5))
                .unwrap()
                .with_retry(RetryConfig::with_strategy(attempts, RetryStrategy::Fixed(Duration::from_millis(1))))
        };

        let err = transport(1).init_session(request.clone()).await.unwrap_err();
        assert!(matches!(err, UploadError::TransientNetwork(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        hits.store(0, Ordering::SeqCst);
        let response = transport(3).init_session(request).await.unwrap();
        assert_eq!(response.total_chunks, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn joins_paths_onto_base() {
        let transport = HttpTransport::new("http://127.0.0.1:8080/", OwnerId::new("alice"), Duration::from_secs(5)).unwrap();
        assert_eq!(transport.url(INIT_PATH).unwrap().as_str(), "http://127.0.0.1:8080/api/uploads/init");
        assert!(HttpTransport::new("not a url", OwnerId::new("alice"), Duration::from_secs(5)).is_err());
    }
}
