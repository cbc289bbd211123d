use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use super::store::SessionStore;

/// Sessions finalized in parallel during a sweep.
const RECOVERY_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub finalized: usize,
    pub reclaimed: usize,
    pub failed: usize,
}

enum Recovered {
    Finalized,
    Reclaimed,
    Failed,
    Untouched,
}

/// Finalizes complete sessions that never reached `completed` and reclaims
/// expired incomplete ones. Running it twice is harmless.
pub async fn run_recovery(store: &SessionStore) -> RecoveryReport {
    let now = Utc::now();
    let entries = store.entries().await;
    tracing::info!(sessions = entries.len(), "starting recovery sweep");

    let outcomes: Vec<Recovered> = futures::stream::iter(entries)
        .map(|(token, entry)| async move {
            let mut session = entry.lock().await;
            if session.status.is_terminal() {
                return Recovered::Untouched;
            }

            if session.is_complete() {
                return match store.finalize_locked(&mut session).await {
                    Ok(outcome) => {
                        tracing::info!(%token, file_id = %outcome.file_id, "recovered complete session");
                        Recovered::Finalized
                    }
                    Err(err) => {
                        tracing::error!(%token, error = %err, "recovery could not finalize session");
                        Recovered::Failed
                    }
                };
            }

            if store.is_expired(&session, now) {
                return match store.reclaim_locked(&mut session).await {
                    Ok(()) => Recovered::Reclaimed,
                    Err(err) => {
                        tracing::error!(%token, error = %err, "recovery could not reclaim session");
                        Recovered::Failed
                    }
                };
            }

            Recovered::Untouched
        })
        .buffer_unordered(RECOVERY_CONCURRENCY)
        .collect()
        .await;

    let mut report = RecoveryReport::default();
    for outcome in outcomes {
        match outcome {
            Recovered::Finalized => report.finalized += 1,
            Recovered::Reclaimed => report.reclaimed += 1,
            Recovered::Failed => report.failed += 1,
            Recovered::Untouched => {}
        }
    }

    tracing::info!(
        finalized = report.finalized,
        reclaimed = report.reclaimed,
        failed = report.failed,
        "recovery sweep finished"
    );
    report
}

/// Runs [`run_recovery`] once, `warmup` after startup.
pub fn spawn_recovery(store: Arc<SessionStore>, warmup: Duration) -> JoinHandle<RecoveryReport> {
    tokio::spawn(async move {
        tokio::time::sleep(warmup).await;
        run_recovery(&store).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::protocol::InitSessionRequest;
    use crate::server::assembler::Assembler;
    use crate::server::external::{MemoryBlobStore, MemoryMetadataStore};
    use crate::server::store::StoreConfig;
    use crate::server::temp::TempStore;
    use crate::types::{OwnerId, SessionStatus, SessionToken};
    use tempfile::TempDir;

    struct Deployment {
        temp: TempStore,
        blobs: Arc<MemoryBlobStore>,
        metadata: Arc<MemoryMetadataStore>,
    }

    impl Deployment {
        async fn new(dir: &TempDir) -> Self {
            Self {
                temp: TempStore::open(dir.path()).await.unwrap(),
                blobs: Arc::new(MemoryBlobStore::new()),
                metadata: Arc::new(MemoryMetadataStore::new()),
            }
        }

        fn assembler(&self) -> Assembler {
            Assembler::new(self.temp.clone(), self.blobs.clone(), self.metadata.clone())
        }

        /// A fresh process over the same disk and collaborators.
        async fn boot(&self) -> SessionStore {
            let config = StoreConfig {
                min_chunk_size: 1,
                ..StoreConfig::default()
            };
            SessionStore::open(config, self.temp.clone(), self.assembler()).await.unwrap()
        }
    }

    async fn upload_all_chunks(store: &SessionStore, owner: &OwnerId, mime: &str) -> SessionToken {
        let token = SessionToken::new();
        store
            .init_session(owner, InitSessionRequest {
                session_token: token.clone(),
                filename: "clip.mp4".into(),
                mime_type: mime.into(),
                total_size_bytes: 30,
                chunk_size_bytes: Some(10),
            })
            .await
            .unwrap();
        for index in 0..3u32 {
            store
                .put_chunk(owner, &token, index, Bytes::from(vec![index as u8; 10]), None)
                .await
                .unwrap();
        }
        token
    }

    #[tokio::test]
    async fn restart_finalizes_complete_session_once() {
        let dir = TempDir::new().unwrap();
        let deployment = Deployment::new(&dir).await;
        let owner = OwnerId::new("alice");

        let token = {
            let store = deployment.boot().await;
            upload_all_chunks(&store, &owner, "video/mp4").await
            // process dies before finalize
        };

        let store = deployment.boot().await;
        let report = run_recovery(&store).await;
        assert_eq!(report, RecoveryReport { finalized: 1, reclaimed: 0, failed: 0 });
        assert_eq!(deployment.metadata.file_count().await, 1);
        assert_eq!(deployment.metadata.video_count().await, 1);
        assert!(!deployment.temp.session_exists(&token).await);

        // the client finalizing afterwards sees the same outcome
        let outcome = store.finalize(&owner, &token).await.unwrap();
        assert_eq!(deployment.metadata.files().await[0].key, outcome.file_key);

        assert_eq!(run_recovery(&store).await, RecoveryReport::default());
        assert_eq!(deployment.metadata.file_count().await, 1);
    }

    #[tokio::test]
    async fn crash_after_record_creation_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let deployment = Deployment::new(&dir).await;
        let owner = OwnerId::new("alice");

        {
            let store = deployment.boot().await;
            let token = upload_all_chunks(&store, &owner, "application/pdf").await;

            // Simulate dying right after the metadata record was written.
            let mut session = deployment.temp.load_sessions().await.unwrap().remove(0);
            assert_eq!(session.token, token);
            session.status = SessionStatus::Finalizing;
            deployment.temp.save_session(&session).await.unwrap();
            deployment.assembler().assemble(&session).await.unwrap();
        }
        assert_eq!(deployment.metadata.file_count().await, 1);

        let store = deployment.boot().await;
        let report = run_recovery(&store).await;
        assert_eq!(report.finalized, 1);
        assert_eq!(deployment.metadata.file_count().await, 1);

        let store = deployment.boot().await;
        assert_eq!(run_recovery(&store).await, RecoveryReport::default());
        assert_eq!(deployment.metadata.file_count().await, 1);
    }

    #[tokio::test]
    async fn reclaims_expired_incomplete_sessions() {
        let dir = TempDir::new().unwrap();
        let deployment = Deployment::new(&dir).await;
        let owner = OwnerId::new("alice");

        let (stale, fresh) = {
            let store = deployment.boot().await;
            let stale = SessionToken::new();
            let fresh = SessionToken::new();
            for token in [&stale, &fresh] {
                store
                    .init_session(&owner, InitSessionRequest {
                        session_token: token.clone(),
                        filename: "big.bin".into(),
                        mime_type: "application/octet-stream".into(),
                        total_size_bytes: 20,
                        chunk_size_bytes: Some(10),
                    })
                    .await
                    .unwrap();
            }
            (stale, fresh)
        };

        for mut session in deployment.temp.load_sessions().await.unwrap() {
            if session.token == stale {
                session.last_activity_at = Utc::now() - chrono::Duration::days(2);
                deployment.temp.save_session(&session).await.unwrap();
            }
        }

        let store = deployment.boot().await;
        let report = run_recovery(&store).await;
        assert_eq!(report, RecoveryReport { finalized: 0, reclaimed: 1, failed: 0 });
        assert!(!deployment.temp.session_exists(&stale).await);
        assert!(deployment.temp.session_exists(&fresh).await);
        assert_eq!(deployment.metadata.file_count().await, 0);
    }

    #[tokio::test]
    async fn spawned_recovery_waits_for_warmup() {
        let dir = TempDir::new().unwrap();
        let deployment = Deployment::new(&dir).await;
        let store = Arc::new(deployment.boot().await);
        upload_all_chunks(&store, &OwnerId::new("bob"), "image/png").await;

        let report = spawn_recovery(store, Duration::from_millis(10)).await.unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(deployment.blobs.len().await, 1);
    }
}
