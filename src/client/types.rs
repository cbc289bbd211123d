use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use crate::codec::{ChunkPlan, FileSource};
use crate::errors::Result;
use crate::network::{NetworkQuality, QualityThresholds};
use crate::protocol::FinalizeResponse;
use crate::types::{Priority, SessionStatus, SessionToken, UploadKind};
use crate::utils::RetryStrategy;

/// Client-side record of one resumable upload. Everything but the file bytes is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSession {
    pub token: SessionToken,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// Indices acknowledged by the server
    pub received: BTreeSet<u32>,
    pub status: SessionStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub kind: UploadKind,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub device_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Position in the scheduling order
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub outcome: Option<FinalizeResponse>,
    /// 文件句柄只存在于内存中, 重新加载后总是 false
    #[serde(skip)]
    pub has_live_file_handle: bool,
}

impl ClientSession {
    pub fn plan(&self) -> Result<ChunkPlan> {
        ChunkPlan::new(self.total_size, self.chunk_size)
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u64 == self.total_chunks as u64
    }

    pub fn uploaded_bytes(&self) -> u64 {
        let Ok(plan) = self.plan() else {
            return 0;
        };
        self.received
            .iter()
            .filter_map(|index| plan.chunk_len(*index))
            .sum()
    }

    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received.len() as f64 / self.total_chunks as f64
    }
}

/// Best-effort MIME type from the file extension.
pub fn guess_mime_type(filename: &str, kind: UploadKind) -> String {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let mime = match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "txt" => "text/plain",
        "json" => "application/json",
        _ if kind == UploadKind::Video => "video/mp4",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 最大并发分片数
    pub concurrency: usize,
    /// 全局限速 (bytes/s)
    pub speed_limit: Option<u64>,
    pub chunk_size: u64,
    /// Files smaller than this take the one-shot path and are rejected here.
    pub resumable_threshold: u64,
    pub max_consecutive_failures: u32,
    pub backoff: RetryStrategy,
    /// 调度间隔
    pub tick_interval: Duration,
    pub device_info: Option<String>,
    pub thresholds: QualityThresholds,
    /// Completed or cancelled sessions still answered by `get_session`
    pub recent_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            speed_limit: None,
            chunk_size: 5 * 1024 * 1024,
            resumable_threshold: 5 * 1024 * 1024,
            max_consecutive_failures: 5,
            backoff: RetryStrategy::default(),
            tick_interval: Duration::from_millis(250),
            device_info: None,
            thresholds: QualityThresholds::default(),
            recent_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    pub token: SessionToken,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// 0.0 ..= 1.0
    pub fraction: f64,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeAllReport {
    pub resumed: Vec<SessionToken>,
    /// Sessions that cannot continue until the file is selected again
    pub needs_file: Vec<SessionToken>,
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 任务状态变更
    StateChanged {
        token: SessionToken,
        old_status: SessionStatus,
        new_status: SessionStatus,
    },

    Progress(SessionProgress),

    /// 任务完成
    Completed {
        token: SessionToken,
        outcome: FinalizeResponse,
    },

    /// 任务失败
    Failed {
        token: SessionToken,
        error: String,
    },

    /// 需要用户重新选择文件
    NeedsFile {
        token: SessionToken,
        filename: String,
    },

    NetworkQuality(NetworkQuality),
}

/// 调度器命令
pub enum SchedulerCommand {
    StartUpload {
        file: Arc<dyn FileSource>,
        kind: UploadKind,
        metadata: HashMap<String, String>,
        reply: oneshot::Sender<Result<SessionToken>>,
    },

    PauseUpload {
        token: SessionToken,
        reply: oneshot::Sender<Result<()>>,
    },

    ResumeUpload {
        token: SessionToken,
        file: Option<Arc<dyn FileSource>>,
        reply: oneshot::Sender<Result<()>>,
    },

    CancelUpload {
        token: SessionToken,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 暂停所有
    PauseAll {
        reply: oneshot::Sender<usize>,
    },

    /// 恢复所有
    ResumeAll {
        reply: oneshot::Sender<ResumeAllReport>,
    },

    RetryAllFailed {
        reply: oneshot::Sender<ResumeAllReport>,
    },

    ScheduleRetry {
        token: SessionToken,
        delay_minutes: u32,
        reply: oneshot::Sender<Result<DateTime<Utc>>>,
    },

    CancelScheduledRetry {
        token: SessionToken,
        reply: oneshot::Sender<Result<()>>,
    },

    SetPriority {
        token: SessionToken,
        priority: Priority,
        reply: oneshot::Sender<Result<()>>,
    },

    Reorder {
        from: usize,
        to: usize,
        reply: oneshot::Sender<Result<()>>,
    },

    SetConcurrency {
        concurrency: usize,
        reply: oneshot::Sender<Result<()>>,
    },

    SetSpeedLimit {
        bytes_per_second: Option<u64>,
        reply: oneshot::Sender<Result<()>>,
    },

    /// 获取任务信息
    GetSession {
        token: SessionToken,
        reply: oneshot::Sender<Option<ClientSession>>,
    },

    /// 按调度顺序获取所有任务
    ListSessions {
        reply: oneshot::Sender<Vec<ClientSession>>,
    },

    Progress {
        token: SessionToken,
        reply: oneshot::Sender<Option<SessionProgress>>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
