use std::collections::HashMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use crate::codec::FileSource;
use crate::errors::{Result, UploadError};
use crate::types::{Priority, SessionToken, UploadKind};
use super::persistence::SessionPersistence;
use super::scheduler_worker::SchedulerWorker;
use super::transport::UploadTransport;
use super::types::{ClientSession, ResumeAllReport, SchedulerCommand, SchedulerConfig, SessionProgress, UploadEvent};

/// Cloneable handle to the scheduler task.
#[derive(Clone)]
pub struct UploadScheduler {
    command_tx: mpsc::Sender<SchedulerCommand>,
    event_tx: broadcast::Sender<UploadEvent>,
}

/// 调度器句柄 - 包含调度器和工作线程
pub struct UploadSchedulerHandle {
    pub scheduler: UploadScheduler,
    pub worker_handle: JoinHandle<()>,
}

impl UploadSchedulerHandle {
    /// Persists every session, stops in-flight sends and waits for the worker.
    pub async fn shutdown(self) -> Result<()> {
        self.scheduler.shutdown().await?;
        self.worker_handle
            .await
            .map_err(|err| UploadError::internal_error(format!("Worker panic: {}", err)))
    }
}

impl UploadScheduler {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        persistence: Arc<dyn SessionPersistence>,
        config: SchedulerConfig,
    ) -> UploadSchedulerHandle {
        let (command_tx, command_rx) = mpsc::channel(100);
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let worker_handle = tokio::spawn(SchedulerWorker::run(
            transport,
            persistence,
            config,
            command_rx,
            event_tx.clone(),
        ));

        UploadSchedulerHandle {
            scheduler: Self { command_tx, event_tx },
            worker_handle,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| UploadError::internal_error("Scheduler shut down"))?;

        // 等待响应
        reply_rx
            .await
            .map_err(|err| UploadError::internal_error(err.to_string()))
    }

    /// Creates the server session and starts sending chunks.
    pub async fn start_upload(
        &self,
        file: Arc<dyn FileSource>,
        kind: UploadKind,
        metadata: HashMap<String, String>,
    ) -> Result<SessionToken> {
        self.request(|reply| SchedulerCommand::StartUpload {
            file,
            kind,
            metadata,
            reply,
        })
        .await?
    }

    pub async fn pause_upload(&self, token: SessionToken) -> Result<()> {
        self.request(|reply| SchedulerCommand::PauseUpload { token, reply }).await?
    }

    /// Continues from the first unacknowledged chunk. `file` is required once the
    /// in-memory handle is gone and must match the recorded size and fingerprint.
    pub async fn resume_upload(&self, token: SessionToken, file: Option<Arc<dyn FileSource>>) -> Result<()> {
        self.request(|reply| SchedulerCommand::ResumeUpload { token, file, reply })
            .await?
    }

    pub async fn cancel_upload(&self, token: SessionToken) -> Result<()> {
        self.request(|reply| SchedulerCommand::CancelUpload { token, reply }).await?
    }

    /// Returns how many sessions were paused.
    pub async fn pause_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::PauseAll { reply }).await
    }

    pub async fn resume_all(&self) -> Result<ResumeAllReport> {
        self.request(|reply| SchedulerCommand::ResumeAll { reply }).await
    }

    pub async fn retry_all_failed(&self) -> Result<ResumeAllReport> {
        self.request(|reply| SchedulerCommand::RetryAllFailed { reply }).await
    }

    pub async fn schedule_retry(&self, token: SessionToken, delay_minutes: u32) -> Result<DateTime<Utc>> {
        self.request(|reply| SchedulerCommand::ScheduleRetry {
            token,
            delay_minutes,
            reply,
        })
        .await?
    }

    pub async fn cancel_scheduled_retry(&self, token: SessionToken) -> Result<()> {
        self.request(|reply| SchedulerCommand::CancelScheduledRetry { token, reply })
            .await?
    }

    pub async fn pin_upload(&self, token: SessionToken) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetPriority {
            token,
            priority: Priority::High,
            reply,
        })
        .await?
    }

    pub async fn unpin_upload(&self, token: SessionToken) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetPriority {
            token,
            priority: Priority::Normal,
            reply,
        })
        .await?
    }

    /// Moves the session at position `from` of [`list_sessions`](Self::list_sessions) to `to`.
    pub async fn reorder_uploads(&self, from: usize, to: usize) -> Result<()> {
        self.request(|reply| SchedulerCommand::Reorder { from, to, reply }).await?
    }

    pub async fn set_concurrency(&self, concurrency: usize) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetConcurrency { concurrency, reply })
            .await?
    }

    /// `None` removes the limit.
    pub async fn set_speed_limit(&self, bytes_per_second: Option<u64>) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetSpeedLimit {
            bytes_per_second,
            reply,
        })
        .await?
    }

    /// Live sessions, plus the last `recent_capacity` completed or cancelled ones.
    pub async fn get_session(&self, token: SessionToken) -> Result<Option<ClientSession>> {
        self.request(|reply| SchedulerCommand::GetSession { token, reply }).await
    }

    /// Sessions still queued, in scheduling order.
    pub async fn list_sessions(&self) -> Result<Vec<ClientSession>> {
        self.request(|reply| SchedulerCommand::ListSessions { reply }).await
    }

    pub async fn progress(&self, token: SessionToken) -> Result<Option<SessionProgress>> {
        self.request(|reply| SchedulerCommand::Progress { token, reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| SchedulerCommand::Shutdown { reply }).await
    }

    /// 订阅事件
    ///
    /// 注意：
    /// - 如果接收速度跟不上发送速度，可能会丢失事件（lagged error）
    /// - 每个订阅者都会收到完整的事件副本
    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }
}
