use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use crate::codec::{checksum_bytes, fingerprint, ChunkPlan, FileSource};
use crate::errors::{Result, UploadError};
use crate::network::{NetworkMonitor, NetworkQuality, SpeedCalculator};
use crate::protocol::{ChunkAck, FinalizeResponse, InitSessionRequest};
use crate::types::{Priority, SessionStatus, SessionToken, UploadKind};
use super::persistence::SessionPersistence;
use super::transport::UploadTransport;
use super::types::{
    guess_mime_type, ClientSession, ResumeAllReport, SchedulerCommand, SchedulerConfig, SessionProgress, UploadEvent,
};

/// Window for per-session speed and the network monitor.
const SPEED_WINDOW: Duration = Duration::from_secs(5);
const SPEED_MIN_SAMPLES: usize = 3;
const MIN_TICK: Duration = Duration::from_millis(10);

/// An upload whose server session is being created.
struct PendingUpload {
    token: SessionToken,
    file: Arc<dyn FileSource>,
    filename: String,
    mime_type: String,
    kind: UploadKind,
    metadata: HashMap<String, String>,
}

enum TaskOutcome {
    Init {
        upload: PendingUpload,
        result: Result<(ChunkPlan, String)>,
        reply: oneshot::Sender<Result<SessionToken>>,
    },
    Chunk {
        token: SessionToken,
        index: u32,
        bytes: u64,
        result: Result<ChunkAck>,
    },
    Finalize {
        token: SessionToken,
        result: Result<FinalizeResponse>,
    },
}

struct SessionEntry {
    session: ClientSession,
    plan: ChunkPlan,
    file: Option<Arc<dyn FileSource>>,
    in_flight: BTreeSet<u32>,
    cancellation_token: CancellationToken,
    backoff_until: Option<Instant>,
    finalize_in_flight: bool,
    speed: SpeedCalculator,
}

impl SessionEntry {
    fn new(session: ClientSession, plan: ChunkPlan, file: Option<Arc<dyn FileSource>>) -> Self {
        Self {
            session,
            plan,
            file,
            in_flight: BTreeSet::new(),
            cancellation_token: CancellationToken::new(),
            backoff_until: None,
            finalize_in_flight: false,
            speed: SpeedCalculator::with_min_samples(SPEED_WINDOW, SPEED_MIN_SAMPLES),
        }
    }

    /// Lowest index neither acknowledged nor currently being sent.
    fn next_index(&self) -> Option<u32> {
        (0..self.plan.total_chunks())
            .find(|index| !self.session.received.contains(index) && !self.in_flight.contains(index))
    }

    fn can_send(&self, now: Instant) -> bool {
        self.session.status == SessionStatus::Active
            && self.file.is_some()
            && !self.finalize_in_flight
            && self.backoff_until.is_none_or(|until| now >= until)
    }

    /// Whether the session can make progress without the user selecting the file again.
    fn can_continue(&self) -> bool {
        self.file.is_some() || self.session.is_complete()
    }

    fn progress(&self) -> SessionProgress {
        progress_of(&self.session, Some(&self.speed))
    }
}

fn progress_of(session: &ClientSession, speed: Option<&SpeedCalculator>) -> SessionProgress {
    let uploaded_bytes = session.uploaded_bytes();
    let remaining = session.total_size.saturating_sub(uploaded_bytes);

    SessionProgress {
        token: session.token.clone(),
        received_chunks: session.received.len() as u32,
        total_chunks: session.total_chunks,
        uploaded_bytes,
        total_bytes: session.total_size,
        fraction: session.fraction(),
        bytes_per_second: speed.map_or(0.0, SpeedCalculator::bytes_per_second),
        eta: speed.and_then(|speed| speed.eta(remaining)),
    }
}

pub struct SchedulerWorker {
    transport: Arc<dyn UploadTransport>,
    persistence: Arc<dyn SessionPersistence>,
    config: SchedulerConfig,
    sessions: HashMap<SessionToken, SessionEntry>,
    /// Insertion order, adjustable with `Reorder`
    order: Vec<SessionToken>,
    /// 已完成或已取消的任务, 最旧的在前
    recent: VecDeque<ClientSession>,
    next_order: u64,
    in_flight: usize,
    next_send_at: Instant,
    monitor: NetworkMonitor,
    quality: NetworkQuality,

    event_tx: broadcast::Sender<UploadEvent>,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<TaskOutcome>,
}

impl SchedulerWorker {
    pub(crate) async fn run(
        transport: Arc<dyn UploadTransport>,
        persistence: Arc<dyn SessionPersistence>,
        config: SchedulerConfig,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let mut ticker = tokio::time::interval(config.tick_interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut worker = Self {
            transport,
            persistence,
            monitor: NetworkMonitor::new(SPEED_WINDOW, config.thresholds),
            config,
            sessions: HashMap::new(),
            order: Vec::new(),
            recent: VecDeque::new(),
            next_order: 0,
            in_flight: 0,
            next_send_at: Instant::now(),
            quality: NetworkQuality::Unknown,
            event_tx,
            outcome_tx,
            outcome_rx,
        };

        // 恢复之前的状态
        if let Err(err) = worker.restore().await {
            tracing::error!(error = %err, "failed to restore upload sessions");
        }

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(SchedulerCommand::Shutdown { reply }) => {
                        worker.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => worker.handle_command(command).await,
                    None => {
                        worker.shutdown().await;
                        break;
                    }
                },
                Some(outcome) = worker.outcome_rx.recv() => {
                    worker.handle_outcome(outcome).await;
                }
                _ = ticker.tick() => {
                    worker.handle_tick().await;
                }
            }

            worker.process_queue().await;
        }
    }

    async fn restore(&mut self) -> Result<()> {
        for mut session in self.persistence.list().await? {
            let plan = match session.plan() {
                Ok(plan) => plan,
                Err(err) => {
                    tracing::warn!(token = %session.token, error = %err, "dropping unusable session record");
                    continue;
                }
            };
            let token = session.token.clone();
            session.has_live_file_handle = false;

            match session.status {
                SessionStatus::Completed | SessionStatus::Cancelled => {
                    self.persistence.delete(&token).await?;
                    continue;
                }
                SessionStatus::Pending | SessionStatus::Active => {
                    // 文件句柄已丢失, 需要用户重新选择文件
                    session.status = SessionStatus::Paused;
                    self.persistence.save(&session).await?;
                    let _ = self.event_tx.send(UploadEvent::NeedsFile {
                        token: token.clone(),
                        filename: session.filename.clone(),
                    });
                }
                _ => {}
            }

            let finalizing = session.status == SessionStatus::Finalizing;
            self.next_order = self.next_order.max(session.order + 1);
            self.order.push(token.clone());
            self.sessions.insert(token.clone(), SessionEntry::new(session, plan, None));

            // finalize needs no file
            if finalizing {
                self.spawn_finalize(&token);
            }
        }

        tracing::info!(sessions = self.sessions.len(), "restored upload sessions");
        Ok(())
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::StartUpload { file, kind, metadata, reply } => {
                self.start_upload(file, kind, metadata, reply);
            }
            SchedulerCommand::PauseUpload { token, reply } => {
                let result = self.pause_upload(&token).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::ResumeUpload { token, file, reply } => {
                let result = self.resume_upload(&token, file).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::CancelUpload { token, reply } => {
                let result = self.cancel_upload(&token).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::PauseAll { reply } => {
                let paused = self.pause_all().await;
                let _ = reply.send(paused);
            }
            SchedulerCommand::ResumeAll { reply } => {
                let report = self.resume_matching(SessionStatus::Paused).await;
                let _ = reply.send(report);
            }
            SchedulerCommand::RetryAllFailed { reply } => {
                let report = self.resume_matching(SessionStatus::Error).await;
                let _ = reply.send(report);
            }
            SchedulerCommand::ScheduleRetry { token, delay_minutes, reply } => {
                let result = self.schedule_retry(&token, delay_minutes).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::CancelScheduledRetry { token, reply } => {
                let result = self.cancel_scheduled_retry(&token).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::SetPriority { token, priority, reply } => {
                let result = self.set_priority(&token, priority).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::Reorder { from, to, reply } => {
                let result = self.reorder(from, to).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::SetConcurrency { concurrency, reply } => {
                let result = if concurrency == 0 {
                    Err(UploadError::InvalidRequest("concurrency must be at least 1".to_string()))
                } else {
                    self.config.concurrency = concurrency;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            SchedulerCommand::SetSpeedLimit { bytes_per_second, reply } => {
                let result = if bytes_per_second == Some(0) {
                    Err(UploadError::InvalidRequest("speed limit must be positive".to_string()))
                } else {
                    self.config.speed_limit = bytes_per_second;
                    self.next_send_at = Instant::now();
                    Ok(())
                };
                let _ = reply.send(result);
            }
            SchedulerCommand::GetSession { token, reply } => {
                let session = match self.sessions.get(&token) {
                    Some(entry) => Some(entry.session.clone()),
                    None => self.recent_session(&token).cloned(),
                };
                let _ = reply.send(session);
            }
            SchedulerCommand::ListSessions { reply } => {
                let sessions = self
                    .order
                    .iter()
                    .filter_map(|token| self.sessions.get(token))
                    .map(|entry| entry.session.clone())
                    .collect();
                let _ = reply.send(sessions);
            }
            SchedulerCommand::Progress { token, reply } => {
                let progress = match self.sessions.get(&token) {
                    Some(entry) => Some(entry.progress()),
                    None => self.recent_session(&token).map(|session| progress_of(session, None)),
                };
                let _ = reply.send(progress);
            }
            SchedulerCommand::Shutdown { reply } => {
                // handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    /// Validates synchronously, then creates the server session and fingerprints the file
    /// in a task of its own. The reply is sent once `TaskOutcome::Init` comes back.
    fn start_upload(
        &mut self,
        file: Arc<dyn FileSource>,
        kind: UploadKind,
        metadata: HashMap<String, String>,
        reply: oneshot::Sender<Result<SessionToken>>,
    ) {
        let size = file.size();
        if size < self.config.resumable_threshold {
            let _ = reply.send(Err(UploadError::BelowResumableThreshold {
                size,
                threshold: self.config.resumable_threshold,
            }));
            return;
        }

        let filename = file.name().to_string();
        let mime_type = metadata
            .get("mime_type")
            .cloned()
            .unwrap_or_else(|| guess_mime_type(&filename, kind));
        let upload = PendingUpload {
            token: SessionToken::new(),
            file,
            filename,
            mime_type,
            kind,
            metadata,
        };
        let request = InitSessionRequest {
            session_token: upload.token.clone(),
            filename: upload.filename.clone(),
            mime_type: upload.mime_type.clone(),
            total_size_bytes: size,
            chunk_size_bytes: Some(self.config.chunk_size),
        };

        let transport = self.transport.clone();
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = prepare_upload(transport.as_ref(), upload.file.as_ref(), request).await;
            let _ = outcome_tx.send(TaskOutcome::Init { upload, result, reply });
        });
    }

    /// Adds a session whose server side exists and starts sending.
    async fn register_upload(&mut self, upload: PendingUpload, plan: ChunkPlan, fingerprint: String) -> Result<SessionToken> {
        let PendingUpload {
            token,
            file,
            filename,
            mime_type,
            kind,
            metadata,
        } = upload;

        let now = Utc::now();
        let session = ClientSession {
            token: token.clone(),
            filename,
            mime_type,
            total_size: plan.total_size(),
            chunk_size: plan.chunk_size(),
            total_chunks: plan.total_chunks(),
            received: BTreeSet::new(),
            status: SessionStatus::Pending,
            priority: Priority::Normal,
            kind,
            metadata,
            fingerprint: Some(fingerprint),
            device_info: self.config.device_info.clone(),
            created_at: now,
            last_activity_at: now,
            scheduled_retry_at: None,
            error: None,
            consecutive_failures: 0,
            order: self.next_order,
            outcome: None,
            has_live_file_handle: true,
        };

        if let Err(err) = self.persistence.save(&session).await {
            // 本地记录写不进去, 服务端会话交给过期清理之前先尝试释放
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let _ = transport.cancel(&token).await;
            });
            return Err(err);
        }

        tracing::info!(
            %token,
            filename = %session.filename,
            total_size = session.total_size,
            total_chunks = plan.total_chunks(),
            "upload started"
        );

        self.next_order += 1;
        self.order.push(token.clone());
        self.sessions.insert(token.clone(), SessionEntry::new(session, plan, Some(file)));
        self.transition(&token, SessionStatus::Active);
        self.persist(&token).await;

        Ok(token)
    }

    async fn pause_upload(&mut self, token: &SessionToken) -> Result<()> {
        let status = self.entry(token)?.session.status;
        match status {
            SessionStatus::Pending | SessionStatus::Active => {
                self.transition(token, SessionStatus::Paused);
                self.persist(token).await;
                Ok(())
            }
            SessionStatus::Paused => Ok(()),
            other => Err(UploadError::InvalidState(format!("cannot pause session in state {other}"))),
        }
    }

    async fn resume_upload(&mut self, token: &SessionToken, file: Option<Arc<dyn FileSource>>) -> Result<()> {
        let entry = self.entry(token)?;
        match entry.session.status {
            SessionStatus::Pending | SessionStatus::Active | SessionStatus::Paused | SessionStatus::Error => {}
            other => return Err(UploadError::InvalidState(format!("cannot resume session in state {other}"))),
        }

        match &file {
            Some(file) => validate_file(&entry.session, file.as_ref()).await?,
            None if !entry.can_continue() => return Err(UploadError::FileRequired(token.to_string())),
            None => {}
        }

        if let Some(entry) = self.sessions.get_mut(token) {
            if let Some(file) = file {
                entry.file = Some(file);
                entry.session.has_live_file_handle = true;
            }
        }
        self.reactivate(token);
        self.persist(token).await;
        Ok(())
    }

    async fn cancel_upload(&mut self, token: &SessionToken) -> Result<()> {
        let Some(entry) = self.sessions.get_mut(token) else {
            return match self.recent_session(token).map(|session| session.status) {
                Some(SessionStatus::Cancelled) => Ok(()),
                Some(_) => Err(UploadError::InvalidState("cannot cancel a completed session".to_string())),
                None => Err(UploadError::SessionNotFound(token.to_string())),
            };
        };

        // 取消正在进行的上传
        entry.cancellation_token.cancel();
        entry.file = None;
        entry.session.has_live_file_handle = false;
        entry.backoff_until = None;
        self.transition(token, SessionStatus::Cancelled);

        let transport = self.transport.clone();
        let remote = token.clone();
        tokio::spawn(async move {
            match transport.cancel(&remote).await {
                Ok(released) => tracing::debug!(token = %remote, released, "server session cancelled"),
                Err(err) => tracing::warn!(token = %remote, error = %err, "server cancel failed, expiry will reclaim"),
            }
        });

        if let Err(err) = self.persistence.delete(token).await {
            tracing::warn!(%token, error = %err, "failed to delete session record");
        }
        self.retire(token);
        tracing::info!(%token, "upload cancelled");
        Ok(())
    }

    async fn pause_all(&mut self) -> usize {
        let targets: Vec<SessionToken> = self
            .order
            .iter()
            .filter(|token| {
                self.sessions.get(*token).is_some_and(|entry| {
                    matches!(entry.session.status, SessionStatus::Pending | SessionStatus::Active)
                })
            })
            .cloned()
            .collect();

        for token in &targets {
            self.transition(token, SessionStatus::Paused);
            self.persist(token).await;
        }
        targets.len()
    }

    async fn resume_matching(&mut self, status: SessionStatus) -> ResumeAllReport {
        let mut report = ResumeAllReport::default();
        let targets: Vec<SessionToken> = self
            .order
            .iter()
            .filter(|token| self.sessions.get(*token).is_some_and(|entry| entry.session.status == status))
            .cloned()
            .collect();

        for token in targets {
            let Some(entry) = self.sessions.get(&token) else {
                continue;
            };
            if entry.can_continue() {
                self.reactivate(&token);
                self.persist(&token).await;
                report.resumed.push(token);
            } else {
                self.emit_needs_file(&token);
                report.needs_file.push(token);
            }
        }
        report
    }

    async fn schedule_retry(&mut self, token: &SessionToken, delay_minutes: u32) -> Result<chrono::DateTime<Utc>> {
        let Some(entry) = self.sessions.get_mut(token) else {
            return Err(self.not_live(token));
        };
        if !matches!(entry.session.status, SessionStatus::Error | SessionStatus::Paused) {
            return Err(UploadError::InvalidState(format!(
                "cannot schedule a retry for session in state {}",
                entry.session.status
            )));
        }

        let at = Utc::now() + chrono::Duration::minutes(delay_minutes as i64);
        entry.session.scheduled_retry_at = Some(at);
        tracing::info!(%token, retry_at = %at, "retry scheduled");
        self.persist(token).await;
        Ok(at)
    }

    async fn cancel_scheduled_retry(&mut self, token: &SessionToken) -> Result<()> {
        let Some(entry) = self.sessions.get_mut(token) else {
            return Err(self.not_live(token));
        };
        entry.session.scheduled_retry_at = None;
        self.persist(token).await;
        Ok(())
    }

    async fn set_priority(&mut self, token: &SessionToken, priority: Priority) -> Result<()> {
        let Some(entry) = self.sessions.get_mut(token) else {
            return Err(self.not_live(token));
        };
        entry.session.priority = priority;
        self.persist(token).await;
        Ok(())
    }

    async fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.order.len();
        if from >= len || to >= len {
            return Err(UploadError::InvalidRequest(format!(
                "cannot move position {from} to {to} in a list of {len}"
            )));
        }

        let token = self.order.remove(from);
        self.order.insert(to, token);

        for (position, token) in self.order.iter().enumerate() {
            if let Some(entry) = self.sessions.get_mut(token) {
                entry.session.order = position as u64;
            }
        }
        self.next_order = len as u64;

        for token in self.order.clone() {
            self.persist(&token).await;
        }
        Ok(())
    }

    async fn handle_tick(&mut self) {
        let now = Utc::now();
        let due: Vec<SessionToken> = self
            .order
            .iter()
            .filter(|token| {
                self.sessions
                    .get(*token)
                    .and_then(|entry| entry.session.scheduled_retry_at)
                    .is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();

        for token in due {
            let Some(entry) = self.sessions.get_mut(&token) else {
                continue;
            };
            entry.session.scheduled_retry_at = None;

            if matches!(entry.session.status, SessionStatus::Error | SessionStatus::Paused) {
                if entry.can_continue() {
                    tracing::info!(%token, "scheduled retry fired");
                    self.reactivate(&token);
                } else {
                    self.emit_needs_file(&token);
                }
            }
            self.persist(&token).await;
        }

        let quality = self.monitor.quality();
        if quality != self.quality {
            tracing::info!(?quality, bytes_per_second = self.monitor.bytes_per_second(), "network quality changed");
            self.quality = quality;
            let _ = self.event_tx.send(UploadEvent::NetworkQuality(quality));
        }
    }

    async fn process_queue(&mut self) {
        // 所有分片已确认的任务进入 finalize
        let ready: Vec<SessionToken> = self
            .order
            .iter()
            .filter(|token| {
                self.sessions.get(*token).is_some_and(|entry| {
                    entry.session.status == SessionStatus::Active
                        && entry.session.is_complete()
                        && entry.in_flight.is_empty()
                        && !entry.finalize_in_flight
                })
            })
            .cloned()
            .collect();
        for token in ready {
            self.transition(&token, SessionStatus::Finalizing);
            self.persist(&token).await;
            self.spawn_finalize(&token);
        }

        let limit = self.monitor.recommended_concurrency(self.config.concurrency);
        while self.in_flight < limit {
            let now = Instant::now();
            if self.config.speed_limit.is_some() && now < self.next_send_at {
                break;
            }
            let Some((token, index)) = self.next_candidate(now) else {
                break;
            };
            self.dispatch(token, index);
        }

        // 空闲期间不计入吞吐量
        if self.in_flight == 0 && self.next_candidate(Instant::now()).is_none() {
            self.monitor.reset();
        }
    }

    /// Pinned sessions first, then scheduling order; lowest free index within a session.
    fn next_candidate(&self, now: Instant) -> Option<(SessionToken, u32)> {
        [Priority::High, Priority::Normal].into_iter().find_map(|priority| {
            self.order.iter().find_map(|token| {
                let entry = self.sessions.get(token)?;
                if entry.session.priority != priority || !entry.can_send(now) {
                    return None;
                }
                entry.next_index().map(|index| (token.clone(), index))
            })
        })
    }

    fn dispatch(&mut self, token: SessionToken, index: u32) {
        let Some(entry) = self.sessions.get_mut(&token) else {
            return;
        };
        let Some(file) = entry.file.clone() else {
            return;
        };
        let plan = entry.plan;
        let bytes = plan.chunk_len(index).unwrap_or(0);

        entry.in_flight.insert(index);
        self.in_flight += 1;

        if let Some(limit) = self.config.speed_limit {
            let start = self.next_send_at.max(Instant::now());
            self.next_send_at = start + Duration::from_secs_f64(bytes as f64 / limit as f64);
        }

        let cancellation_token = entry.cancellation_token.clone();
        let transport = self.transport.clone();
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancellation_token.cancelled() => Err(UploadError::Cancelled),
                result = send_chunk(transport.as_ref(), &plan, file.as_ref(), &token, index) => result,
            };

            // 通知完成
            let _ = outcome_tx.send(TaskOutcome::Chunk { token, index, bytes, result });
        });
    }

    fn spawn_finalize(&mut self, token: &SessionToken) {
        let Some(entry) = self.sessions.get_mut(token) else {
            return;
        };
        entry.finalize_in_flight = true;

        let cancellation_token = entry.cancellation_token.clone();
        let transport = self.transport.clone();
        let outcome_tx = self.outcome_tx.clone();
        let token = token.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancellation_token.cancelled() => Err(UploadError::Cancelled),
                result = transport.finalize(&token) => result,
            };
            let _ = outcome_tx.send(TaskOutcome::Finalize { token, result });
        });
    }

    async fn handle_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Init { upload, result, reply } => {
                let result = match result {
                    Ok((plan, fingerprint)) => self.register_upload(upload, plan, fingerprint).await,
                    Err(err) => {
                        tracing::warn!(filename = %upload.filename, error = %err, "could not start upload");
                        Err(err)
                    }
                };
                let _ = reply.send(result);
            }
            TaskOutcome::Chunk { token, index, bytes, result } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let Some(entry) = self.sessions.get_mut(&token) else {
                    return;
                };
                entry.in_flight.remove(&index);

                match result {
                    Ok(ack) => {
                        entry.session.received.insert(index);
                        entry.session.consecutive_failures = 0;
                        entry.session.last_activity_at = Utc::now();
                        entry.backoff_until = None;
                        entry.speed.add_sample(bytes);
                        self.monitor.record(bytes);

                        tracing::debug!(
                            %token,
                            index,
                            received = ack.received_count,
                            total = ack.total_chunks,
                            "chunk acknowledged"
                        );
                        let _ = self.event_tx.send(UploadEvent::Progress(entry.progress()));
                        self.persist(&token).await;
                    }
                    Err(UploadError::Cancelled) => {}
                    Err(err) => self.handle_chunk_failure(&token, index, err).await,
                }
            }
            TaskOutcome::Finalize { token, result } => {
                let Some(entry) = self.sessions.get_mut(&token) else {
                    return;
                };
                entry.finalize_in_flight = false;
                if entry.session.status != SessionStatus::Finalizing {
                    return;
                }

                match result {
                    Ok(outcome) => {
                        entry.session.outcome = Some(outcome.clone());
                        entry.session.error = None;
                        entry.session.has_live_file_handle = false;
                        entry.file = None;
                        self.transition(&token, SessionStatus::Completed);

                        tracing::info!(%token, file_id = %outcome.file_id, "upload completed");
                        let _ = self.event_tx.send(UploadEvent::Completed {
                            token: token.clone(),
                            outcome,
                        });
                        if let Err(err) = self.persistence.delete(&token).await {
                            tracing::warn!(%token, error = %err, "failed to delete session record");
                        }
                        self.retire(&token);
                    }
                    Err(UploadError::Cancelled) => {}
                    Err(err) => self.fail_session(&token, format!("finalize failed: {err}")).await,
                }
            }
        }
    }

    async fn handle_chunk_failure(&mut self, token: &SessionToken, index: u32, err: UploadError) {
        let Some(entry) = self.sessions.get_mut(token) else {
            return;
        };

        if err.is_retryable() {
            entry.session.consecutive_failures += 1;
            let failures = entry.session.consecutive_failures;
            if failures < self.config.max_consecutive_failures {
                let delay = self.config.backoff.get_delay(failures - 1);
                entry.backoff_until = Some(Instant::now() + delay);
                entry.session.error = Some(err.to_string());
                tracing::warn!(
                    %token,
                    index,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "chunk send failed, backing off"
                );
                self.persist(token).await;
                return;
            }
        }

        self.fail_session(token, err.to_string()).await;
    }

    async fn fail_session(&mut self, token: &SessionToken, error: String) {
        let Some(entry) = self.sessions.get_mut(token) else {
            return;
        };
        if entry.session.status.is_terminal() || entry.session.status == SessionStatus::Error {
            return;
        }

        entry.session.error = Some(error.clone());
        entry.backoff_until = None;
        self.transition(token, SessionStatus::Error);

        tracing::error!(%token, %error, "upload failed");
        let _ = self.event_tx.send(UploadEvent::Failed {
            token: token.clone(),
            error,
        });
        self.persist(token).await;
    }

    /// Back to `active` with a clean failure count.
    fn reactivate(&mut self, token: &SessionToken) {
        if let Some(entry) = self.sessions.get_mut(token) {
            entry.session.consecutive_failures = 0;
            entry.session.error = None;
            entry.session.scheduled_retry_at = None;
            entry.backoff_until = None;
            entry.speed.reset();
        }
        self.transition(token, SessionStatus::Active);
    }

    async fn shutdown(&mut self) {
        for token in self.order.clone() {
            if let Some(entry) = self.sessions.get(&token) {
                entry.cancellation_token.cancel();
            }
            self.persist(&token).await;
        }
        tracing::info!(sessions = self.sessions.len(), "scheduler stopped");
    }

    fn entry(&self, token: &SessionToken) -> Result<&SessionEntry> {
        self.sessions.get(token).ok_or_else(|| self.not_live(token))
    }

    fn recent_session(&self, token: &SessionToken) -> Option<&ClientSession> {
        self.recent.iter().find(|session| &session.token == token)
    }

    /// Error for a token without a live session.
    fn not_live(&self, token: &SessionToken) -> UploadError {
        match self.recent_session(token) {
            Some(session) => UploadError::InvalidState(format!("session {token} is {}", session.status)),
            None => UploadError::SessionNotFound(token.to_string()),
        }
    }

    /// Moves a completed or cancelled session out of the queue into the bounded recent list.
    fn retire(&mut self, token: &SessionToken) {
        let Some(entry) = self.sessions.remove(token) else {
            return;
        };
        self.order.retain(|queued| queued != token);
        self.recent.push_back(entry.session);
        while self.recent.len() > self.config.recent_capacity {
            self.recent.pop_front();
        }
    }

    fn transition(&mut self, token: &SessionToken, new_status: SessionStatus) {
        let Some(entry) = self.sessions.get_mut(token) else {
            return;
        };
        let old_status = entry.session.status;
        if old_status == new_status {
            return;
        }

        entry.session.status = new_status;
        let _ = self.event_tx.send(UploadEvent::StateChanged {
            token: token.clone(),
            old_status,
            new_status,
        });
    }

    fn emit_needs_file(&self, token: &SessionToken) {
        if let Some(entry) = self.sessions.get(token) {
            let _ = self.event_tx.send(UploadEvent::NeedsFile {
                token: token.clone(),
                filename: entry.session.filename.clone(),
            });
        }
    }

    /// Saves the record of a live session. Terminal sessions have no record.
    async fn persist(&self, token: &SessionToken) {
        let Some(entry) = self.sessions.get(token) else {
            return;
        };
        if entry.session.status.is_terminal() {
            return;
        }
        if let Err(err) = self.persistence.save(&entry.session).await {
            tracing::warn!(%token, error = %err, "failed to persist session");
        }
    }
}

/// Creates the server session, then fingerprints the file with the chunk size the server chose.
async fn prepare_upload(
    transport: &dyn UploadTransport,
    file: &dyn FileSource,
    request: InitSessionRequest,
) -> Result<(ChunkPlan, String)> {
    let size = request.total_size_bytes;
    let response = transport.init_session(request).await?;

    // 以服务端返回的分片大小为准
    let plan = ChunkPlan::new(size, response.chunk_size_bytes)?;
    if plan.total_chunks() != response.total_chunks {
        return Err(UploadError::internal_error(format!(
            "server planned {} chunks, expected {}",
            response.total_chunks,
            plan.total_chunks()
        )));
    }
    let fingerprint = fingerprint(file, plan.chunk_size()).await?;
    Ok((plan, fingerprint))
}

async fn send_chunk(
    transport: &dyn UploadTransport,
    plan: &ChunkPlan,
    file: &dyn FileSource,
    token: &SessionToken,
    index: u32,
) -> Result<ChunkAck> {
    let data = plan.read_chunk(file, index).await?;
    let checksum = checksum_bytes(&data);
    transport.upload_chunk(token, index, data, checksum).await
}

/// A re-selected file must have the recorded size and, when known, fingerprint.
async fn validate_file(session: &ClientSession, file: &dyn FileSource) -> Result<()> {
    if file.size() != session.total_size {
        return Err(UploadError::FileMismatch(format!(
            "selected file has {} bytes, session {} expects {}",
            file.size(),
            session.token,
            session.total_size
        )));
    }

    if let Some(expected) = &session.fingerprint {
        let actual = fingerprint(file, session.chunk_size).await?;
        if &actual != expected {
            return Err(UploadError::FileMismatch(format!(
                "selected file content differs from the original of session {}",
                session.token
            )));
        }
    }

    if file.name() != session.filename {
        tracing::warn!(
            token = %session.token,
            expected = %session.filename,
            actual = %file.name(),
            "resuming with a differently named file"
        );
    }
    Ok(())
}
