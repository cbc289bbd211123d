use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use async_trait::async_trait;
use tokio::sync::RwLock;
use crate::errors::Result;
use crate::types::SessionToken;
use super::types::ClientSession;

/// 存储适配器 - 用于保存和恢复上传会话
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn save(&self, session: &ClientSession) -> Result<()>;

    async fn load(&self, token: &SessionToken) -> Result<Option<ClientSession>>;

    /// Deleting an unknown token is not an error.
    async fn delete(&self, token: &SessionToken) -> Result<()>;

    async fn list(&self) -> Result<Vec<ClientSession>>;
}

/// One `<token>.json` per session under a directory.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, token: &SessionToken) -> PathBuf {
        self.dir.join(format!("{}.json", token.as_str()))
    }
}

#[async_trait]
impl SessionPersistence for JsonFilePersistence {
    async fn save(&self, session: &ClientSession) -> Result<()> {
        let path = self.path(&session.token);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, token: &SessionToken) -> Result<Option<ClientSession>> {
        match tokio::fs::read(self.path(token)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, token: &SessionToken) -> Result<()> {
        match tokio::fs::remove_file(self.path(token)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<ClientSession>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ClientSession>(&data) {
                Ok(session) => sessions.push(session),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping corrupt session record"),
            }
        }

        sessions.sort_by_key(|session| session.order);
        Ok(sessions)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    sessions: RwLock<HashMap<SessionToken, ClientSession>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionPersistence for MemoryPersistence {
    async fn save(&self, session: &ClientSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, token: &SessionToken) -> Result<Option<ClientSession>> {
        Ok(self.sessions.read().await.get(token).cloned())
    }

    async fn delete(&self, token: &SessionToken) -> Result<()> {
        self.sessions.write().await.remove(token);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientSession>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|session| session.order);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use chrono::Utc;
    use crate::types::{Priority, SessionStatus, UploadKind};
    use tempfile::TempDir;

    fn record(order: u64) -> ClientSession {
        let now = Utc::now();
        ClientSession {
            token: SessionToken::new(),
            filename: "movie.mp4".into(),
            mime_type: "video/mp4".into(),
            total_size: 100,
            chunk_size: 10,
            total_chunks: 10,
            received: BTreeSet::from([0, 1, 2]),
            status: SessionStatus::Active,
            priority: Priority::High,
            kind: UploadKind::Video,
            metadata: HashMap::from([("album".to_string(), "summer".to_string())]),
            fingerprint: Some("abc".into()),
            device_info: Some("laptop".into()),
            created_at: now,
            last_activity_at: now,
            scheduled_retry_at: None,
            error: None,
            consecutive_failures: 0,
            order,
            outcome: None,
            has_live_file_handle: true,
        }
    }

    #[tokio::test]
    async fn json_files_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let first = record(2);
        let second = record(1);
        {
            let store = JsonFilePersistence::open(dir.path()).await.unwrap();
            store.save(&first).await.unwrap();
            store.save(&second).await.unwrap();
        }

        let store = JsonFilePersistence::open(dir.path()).await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].token, second.token);
        assert_eq!(listed[1].received, first.received);
        assert!(!listed[1].has_live_file_handle);

        store.delete(&first.token).await.unwrap();
        store.delete(&first.token).await.unwrap();
        assert!(store.load(&first.token).await.unwrap().is_none());
        assert!(store.load(&second.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_persistence_replaces_records() {
        let store = MemoryPersistence::new();
        let mut session = record(0);
        store.save(&session).await.unwrap();
        session.received.insert(3);
        store.save(&session).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].received.len(), 4);
    }
}
