use std::collections::{hash_map, HashMap};
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::codec::{verify_checksum, ChunkPlan};
use crate::errors::{Result, UploadError};
use crate::protocol::{ChunkAck, FinalizeResponse, InitSessionRequest, InitSessionResponse, ProgressResponse};
use crate::types::{OwnerId, SessionStatus, SessionToken};
use super::assembler::Assembler;
use super::external::FileCreated;
use super::session::ServerSession;
use super::temp::TempStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Idle timeout for ordinary sessions.
    #[serde(with = "crate::config::duration_secs")]
    pub idle_timeout: Duration,
    /// Idle timeout for sessions of at least `large_file_threshold` bytes.
    #[serde(with = "crate::config::duration_secs")]
    pub large_file_idle_timeout: Duration,
    pub large_file_threshold: u64,
    #[serde(with = "crate::config::duration_secs")]
    pub sweep_interval: Duration,
    /// How long a completed session still answers finalize and progress.
    #[serde(with = "crate::config::duration_secs")]
    pub finished_retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 5 * 1024 * 1024,
            min_chunk_size: 64 * 1024,
            max_chunk_size: 64 * 1024 * 1024,
            idle_timeout: Duration::from_secs(6 * 60 * 60),
            large_file_idle_timeout: Duration::from_secs(24 * 60 * 60),
            large_file_threshold: 500 * 1024 * 1024,
            sweep_interval: Duration::from_secs(15 * 60),
            finished_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl StoreConfig {
    pub fn idle_timeout_for(&self, total_size: u64) -> Duration {
        if total_size >= self.large_file_threshold {
            self.large_file_idle_timeout
        } else {
            self.idle_timeout
        }
    }
}

type SessionEntry = Arc<Mutex<ServerSession>>;

#[derive(Debug, Clone)]
struct FinishedSession {
    owner_id: OwnerId,
    total_chunks: u32,
    outcome: FinalizeResponse,
    finished_at: DateTime<Utc>,
}

/// Durable, idempotent chunk intake keyed by `(token, index)`.
///
/// Lock order is always session lock before the session map; the map lock is
/// never held while waiting on a session.
pub struct SessionStore {
    config: StoreConfig,
    temp: TempStore,
    assembler: Assembler,
    sessions: RwLock<HashMap<SessionToken, SessionEntry>>,
    finished: RwLock<HashMap<SessionToken, FinishedSession>>,
    event_tx: broadcast::Sender<FileCreated>,
}

impl SessionStore {
    /// Opens the store and reloads every session persisted under the temp root.
    pub async fn open(config: StoreConfig, temp: TempStore, assembler: Assembler) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let store = Self {
            config,
            temp,
            assembler,
            sessions: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
            event_tx,
        };

        let mut restored = 0usize;
        for session in store.temp.load_sessions().await? {
            match (session.status, session.outcome.clone()) {
                // Died between persisting the outcome and releasing the chunks.
                (SessionStatus::Completed, Some(outcome)) => {
                    store.temp.remove_session(&session.token).await?;
                    store.finished.write().await.insert(session.token.clone(), FinishedSession {
                        owner_id: session.owner_id.clone(),
                        total_chunks: session.total_chunks,
                        outcome,
                        finished_at: Utc::now(),
                    });
                }
                (SessionStatus::Cancelled, _) => {
                    store.temp.remove_session(&session.token).await?;
                }
                _ => {
                    restored += 1;
                    store
                        .sessions
                        .write()
                        .await
                        .insert(session.token.clone(), Arc::new(Mutex::new(session)));
                }
            }
        }

        tracing::info!(restored, root = %store.temp.root().display(), "session store opened");
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// 订阅 "file created" 事件
    pub fn subscribe(&self) -> broadcast::Receiver<FileCreated> {
        self.event_tx.subscribe()
    }

    pub async fn init_session(&self, owner: &OwnerId, request: InitSessionRequest) -> Result<InitSessionResponse> {
        if request.filename.trim().is_empty() {
            return Err(UploadError::InvalidRequest("filename is empty".to_string()));
        }
        let mime_type = if request.mime_type.trim().is_empty() {
            "application/octet-stream".to_string()
        } else {
            request.mime_type.clone()
        };
        let chunk_size = request
            .chunk_size_bytes
            .unwrap_or(self.config.default_chunk_size)
            .clamp(self.config.min_chunk_size, self.config.max_chunk_size);
        let plan = ChunkPlan::new(request.total_size_bytes, chunk_size)?;
        let token = request.session_token.clone();

        if self.finished.read().await.contains_key(&token) {
            return Err(UploadError::InvalidRequest(format!("session {token} already completed")));
        }

        let entry: SessionEntry = Arc::new(Mutex::new(ServerSession::new(
            token.clone(),
            owner.clone(),
            request.filename.clone(),
            mime_type,
            plan,
        )));
        // 先锁住新会话再放进 map, 目录写好之前其他请求只能等待
        let mut session = entry.lock().await;
        let existing = {
            let mut sessions = self.sessions.write().await;
            match sessions.entry(token.clone()) {
                hash_map::Entry::Occupied(existing) => Some(existing.get().clone()),
                hash_map::Entry::Vacant(slot) => {
                    slot.insert(entry.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            drop(session);
            return reinit(owner, &request, existing).await;
        }

        let created = match self.temp.create_session_dir(&token).await {
            Ok(()) => self.temp.save_session(&session).await,
            Err(err) => Err(err),
        };
        if let Err(err) = created {
            session.status = SessionStatus::Cancelled;
            self.sessions.write().await.remove(&token);
            if let Err(cleanup) = self.temp.remove_session(&token).await {
                tracing::warn!(%token, error = %cleanup, "could not clean up failed session");
            }
            return Err(err);
        }

        tracing::info!(%token, %owner, total_chunks = plan.total_chunks(), chunk_size, "session initialized");

        Ok(InitSessionResponse {
            session_token: token,
            total_chunks: plan.total_chunks(),
            chunk_size_bytes: chunk_size,
        })
    }

    pub async fn put_chunk(
        &self,
        owner: &OwnerId,
        token: &SessionToken,
        index: u32,
        data: Bytes,
        checksum: Option<&str>,
    ) -> Result<ChunkAck> {
        let entry = self.entry(token).await?;
        let mut session = entry.lock().await;
        ensure_live(&session)?;
        session.authorize(owner)?;

        if !matches!(session.status, SessionStatus::Pending | SessionStatus::Active) {
            return Err(UploadError::InvalidState(format!(
                "session {token} is {} and accepts no chunks",
                session.status
            )));
        }

        let expected_len = session
            .plan()?
            .chunk_len(index)
            .ok_or(UploadError::InvalidChunkIndex {
                index,
                total_chunks: session.total_chunks,
            })?;
        if data.len() as u64 != expected_len {
            return Err(UploadError::InvalidRequest(format!(
                "chunk {index} has {} bytes, expected {expected_len}",
                data.len()
            )));
        }
        verify_checksum(index, &data, checksum)?;

        // Same index again simply overwrites the file, the set does not grow.
        self.temp.write_chunk(token, index, &data).await?;

        let newly_received = session.received.insert(index);
        let previous_activity = session.last_activity_at;
        let previous_status = session.status;
        session.last_activity_at = Utc::now();
        session.status = SessionStatus::Active;

        if let Err(err) = self.temp.save_session(&session).await {
            if newly_received {
                session.received.remove(&index);
            }
            session.last_activity_at = previous_activity;
            session.status = previous_status;
            return Err(err);
        }

        tracing::debug!(%token, index, received = session.received_count(), total = session.total_chunks, "chunk stored");

        Ok(ChunkAck::new(session.received_count(), session.total_chunks))
    }

    pub async fn get_progress(&self, owner: &OwnerId, token: &SessionToken) -> Result<ProgressResponse> {
        if let Some(finished) = self.finished_for(owner, token).await? {
            return Ok(ProgressResponse {
                received_count: finished.total_chunks,
                total_chunks: finished.total_chunks,
            });
        }

        let entry = self.entry(token).await?;
        let session = entry.lock().await;
        ensure_live(&session)?;
        session.authorize(owner)?;

        Ok(ProgressResponse {
            received_count: session.received_count(),
            total_chunks: session.total_chunks,
        })
    }

    /// Assembles a complete session. Finalizing a completed session returns its stored outcome.
    pub async fn finalize(&self, owner: &OwnerId, token: &SessionToken) -> Result<FinalizeResponse> {
        if let Some(finished) = self.finished_for(owner, token).await? {
            return Ok(finished.outcome);
        }

        let entry = self.entry(token).await?;
        let mut session = entry.lock().await;
        if session.status == SessionStatus::Completed {
            // Raced with another finalize that already released the session.
            drop(session);
            return self
                .finished_for(owner, token)
                .await?
                .map(|finished| finished.outcome)
                .ok_or_else(|| UploadError::SessionNotFound(token.to_string()));
        }
        ensure_live(&session)?;
        session.authorize(owner)?;

        self.finalize_locked(&mut session).await
    }

    /// Deletes temporary storage and metadata. Unknown tokens report `false`.
    pub async fn cancel_session(&self, owner: &OwnerId, token: &SessionToken) -> Result<bool> {
        let Some(entry) = self.sessions.read().await.get(token).cloned() else {
            return Ok(false);
        };

        let mut session = entry.lock().await;
        if session.status.is_terminal() {
            return Ok(false);
        }
        session.authorize(owner)?;

        session.status = SessionStatus::Cancelled;
        self.release(&session).await?;
        tracing::info!(%token, %owner, "session cancelled");
        Ok(true)
    }

    /// Reclaims idle, incomplete sessions and forgets completed ones past
    /// `finished_retention`. Complete sessions are left for the recovery sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<SessionToken> {
        let retention = self.config.finished_retention;
        self.finished.write().await.retain(|_, done| {
            now.signed_duration_since(done.finished_at)
                .to_std()
                .map(|age| age <= retention)
                .unwrap_or(true)
        });

        let mut reclaimed = Vec::new();
        for (token, entry) in self.entries().await {
            let mut session = entry.lock().await;
            if session.status.is_terminal() || session.is_complete() || !self.is_expired(&session, now) {
                continue;
            }

            match self.reclaim_locked(&mut session).await {
                Ok(()) => reclaimed.push(token),
                Err(err) => tracing::error!(%token, error = %err, "failed to reclaim expired session"),
            }
        }

        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "reclaimed expired sessions");
        }
        reclaimed
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `sweep_interval` until `shutdown` fires.
    pub fn spawn_expiry_task(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 第一次 tick 立即返回, 启动时的清理交给 recovery
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_expired(Utc::now()).await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    pub(crate) async fn entries(&self) -> Vec<(SessionToken, SessionEntry)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(token, entry)| (token.clone(), entry.clone()))
            .collect()
    }

    pub(crate) fn is_expired(&self, session: &ServerSession, now: DateTime<Utc>) -> bool {
        let timeout = self.config.idle_timeout_for(session.total_size);
        let idle = now.signed_duration_since(session.last_activity_at);
        idle.to_std().map(|idle| idle > timeout).unwrap_or(false)
    }

    pub(crate) async fn reclaim_locked(&self, session: &mut ServerSession) -> Result<()> {
        tracing::info!(token = %session.token, last_activity = %session.last_activity_at, "reclaiming expired session");
        session.status = SessionStatus::Cancelled;
        self.release(session).await
    }

    /// Persist `finalizing`, assemble, persist the outcome, then release the chunks.
    pub(crate) async fn finalize_locked(&self, session: &mut ServerSession) -> Result<FinalizeResponse> {
        if !session.is_complete() {
            return Err(UploadError::incomplete(session.missing()));
        }

        if session.status != SessionStatus::Finalizing {
            session.status = SessionStatus::Finalizing;
            self.temp.save_session(session).await?;
        }

        let outcome = match &session.outcome {
            Some(outcome) => outcome.clone(),
            None => match self.assembler.assemble(session).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(token = %session.token, error = %err, "assembly failed, session stays finalizing");
                    return Err(err);
                }
            },
        };

        session.outcome = Some(outcome.clone());
        session.status = SessionStatus::Completed;
        if let Err(err) = self.temp.save_session(session).await {
            // The file record exists and assembly is idempotent, so a rerun converges.
            tracing::warn!(token = %session.token, error = %err, "could not persist completed outcome");
        }

        self.finished.write().await.insert(session.token.clone(), FinishedSession {
            owner_id: session.owner_id.clone(),
            total_chunks: session.total_chunks,
            outcome: outcome.clone(),
            finished_at: Utc::now(),
        });
        self.release(session).await?;

        let _ = self.event_tx.send(FileCreated {
            owner_id: session.owner_id.clone(),
            upload_token: session.token.clone(),
            file_id: outcome.file_id.clone(),
            video_id: outcome.video_id.clone(),
            key: outcome.file_key.clone(),
            url: outcome.url.clone(),
            filename: session.filename.clone(),
            mime_type: session.mime_type.clone(),
            size: session.total_size,
        });

        Ok(outcome)
    }

    /// The single place temporary storage is freed. Callers hold the session lock
    /// and have already moved the session to a terminal status.
    async fn release(&self, session: &ServerSession) -> Result<()> {
        self.sessions.write().await.remove(&session.token);
        self.temp.remove_session(&session.token).await
    }

    async fn entry(&self, token: &SessionToken) -> Result<SessionEntry> {
        self.sessions
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(token.to_string()))
    }

    async fn finished_for(&self, owner: &OwnerId, token: &SessionToken) -> Result<Option<FinishedSession>> {
        let finished = self.finished.read().await;
        match finished.get(token) {
            Some(done) if &done.owner_id != owner => Err(UploadError::Unauthorized {
                token: token.to_string(),
            }),
            Some(done) => Ok(Some(done.clone())),
            None => Ok(None),
        }
    }
}

/// Init for a token that already has a session: same owner and parameters get the same answer.
async fn reinit(owner: &OwnerId, request: &InitSessionRequest, entry: SessionEntry) -> Result<InitSessionResponse> {
    let session = entry.lock().await;
    ensure_live(&session)?;
    session.authorize(owner)?;
    if session.filename != request.filename || session.total_size != request.total_size_bytes {
        return Err(UploadError::InvalidRequest(format!(
            "session {} already exists with different parameters",
            session.token
        )));
    }
    Ok(InitSessionResponse {
        session_token: session.token.clone(),
        total_chunks: session.total_chunks,
        chunk_size_bytes: session.chunk_size,
    })
}

/// A session whose storage was released may still be reachable through an
/// entry cloned before the release.
fn ensure_live(session: &ServerSession) -> Result<()> {
    if session.status.is_terminal() {
        return Err(UploadError::SessionNotFound(session.token.to_string()));
    }
    Ok(())
}
