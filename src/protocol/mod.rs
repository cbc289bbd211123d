//! Wire types of the client-facing transfer protocol.

use serde::{Deserialize, Serialize};
use crate::types::SessionToken;

/// Header carrying the authenticated owner id, set by the identity layer.
pub const OWNER_HEADER: &str = "X-Owner-Id";

pub const INIT_PATH: &str = "/api/uploads/init";
pub const CHUNK_PATH: &str = "/api/uploads/chunk";
pub const PROGRESS_PATH: &str = "/api/uploads/progress";
pub const FINALIZE_PATH: &str = "/api/uploads/finalize";
pub const CANCEL_PATH: &str = "/api/uploads/cancel";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSessionRequest {
    pub session_token: SessionToken,
    pub filename: String,
    pub mime_type: String,
    pub total_size_bytes: u64,
    /// Server default when absent.
    #[serde(default)]
    pub chunk_size_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitSessionResponse {
    pub session_token: SessionToken,
    pub total_chunks: u32,
    pub chunk_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChunkRequest {
    pub session_token: SessionToken,
    pub chunk_index: u32,
    /// Base64 chunk bytes
    pub data: String,
    /// Hex SHA-256 of the decoded bytes
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub received_count: u32,
    pub total_chunks: u32,
    pub progress_percent: f64,
}

impl ChunkAck {
    pub fn new(received_count: u32, total_chunks: u32) -> Self {
        let progress_percent = if total_chunks == 0 {
            0.0
        } else {
            received_count as f64 / total_chunks as f64 * 100.0
        };

        Self {
            received_count,
            total_chunks,
            progress_percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressQuery {
    pub session_token: SessionToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub received_count: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_token: SessionToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub file_id: String,
    #[serde(default)]
    pub video_id: Option<String>,
    pub url: String,
    pub file_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
}

/// JSON error body returned for every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}
