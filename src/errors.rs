use thiserror::Error;

/// Upper bound on how many missing indices an `IncompleteUpload` carries.
pub const MISSING_INDICES_CAP: usize = 20;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {token} does not belong to the caller")]
    Unauthorized {
        token: String,
    },

    #[error("Chunk index {index} out of range, total chunks: {total_chunks}")]
    InvalidChunkIndex {
        index: u32,
        total_chunks: u32,
    },

    #[error("Upload incomplete, {missing_count} chunk(s) missing: {missing:?}")]
    IncompleteUpload {
        /// First missing indices, capped at [`MISSING_INDICES_CAP`]
        missing: Vec<u32>,
        missing_count: usize,
    },

    #[error("File mismatch: {0}")]
    FileMismatch(String),

    #[error("Checksum mismatch for chunk {index}")]
    ChecksumMismatch {
        index: u32,
    },

    #[error("Session {0} needs the file to be selected again")]
    FileRequired(String),

    #[error("File size {size} is below the resumable threshold {threshold}")]
    BelowResumableThreshold {
        size: u64,
        threshold: u64,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Server error: status code {status_code}, message: {message}")]
    Server {
        status_code: u16,
        message: String,
    },

    #[error("HTTP Request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn incomplete(missing: impl IntoIterator<Item = u32>) -> Self {
        let mut missing_count = 0;
        let mut capped = Vec::new();
        for index in missing {
            missing_count += 1;
            if capped.len() < MISSING_INDICES_CAP {
                capped.push(index);
            }
        }

        Self::IncompleteUpload {
            missing: capped,
            missing_count,
        }
    }

    /// Whether a chunk send that failed with this error may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::Http(_) | Self::Io(_) | Self::Storage(_) => true,
            Self::Server { status_code, .. } => *status_code >= 500 || *status_code == 429,
            _ => false,
        }
    }

    /// Stable machine-readable code, used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::InvalidChunkIndex { .. } => "InvalidChunkIndex",
            Self::IncompleteUpload { .. } => "IncompleteUpload",
            Self::FileMismatch(_) => "FileMismatch",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::FileRequired(_) => "FileRequired",
            Self::BelowResumableThreshold { .. } => "BelowResumableThreshold",
            Self::InvalidState(_) => "InvalidState",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::TransientNetwork(_) | Self::Http(_) => "TransientNetworkError",
            Self::Storage(_) | Self::Io(_) => "StorageFailure",
            Self::Json(_) => "InvalidRequest",
            Self::Server { .. } => "ServerError",
            Self::Cancelled => "Cancelled",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;
