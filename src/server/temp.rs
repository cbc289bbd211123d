use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use futures::{stream, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;
use crate::errors::{Result, UploadError};
use crate::types::SessionToken;
use super::external::ByteStream;
use super::session::ServerSession;

const SESSION_FILE: &str = "session.json";

fn storage_err(context: impl std::fmt::Display, err: std::io::Error) -> UploadError {
    UploadError::storage(format!("{context}: {err}"))
}

/// Temporary chunk storage on the local filesystem.
///
/// Layout: `<root>/<token>/session.json` plus one `<index>.chunk` per received chunk.
/// Every write goes to a temp file first and is renamed into place.
#[derive(Debug, Clone)]
pub struct TempStore {
    root: PathBuf,
}

impl TempStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| storage_err(format!("create temp root {}", root.display()), err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, token: &SessionToken) -> PathBuf {
        self.root.join(token.as_str())
    }

    fn chunk_path(&self, token: &SessionToken, index: u32) -> PathBuf {
        self.session_dir(token).join(format!("{index:06}.chunk"))
    }

    pub async fn create_session_dir(&self, token: &SessionToken) -> Result<()> {
        let dir = self.session_dir(token);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| storage_err(format!("create session dir {}", dir.display()), err))
    }

    pub async fn write_chunk(&self, token: &SessionToken, index: u32, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(token, index);
        write_atomic(&path, data).await
    }

    /// Size of a stored chunk in bytes.
    pub async fn chunk_len(&self, token: &SessionToken, index: u32) -> Result<u64> {
        let path = self.chunk_path(token, index);
        tokio::fs::metadata(&path)
            .await
            .map(|metadata| metadata.len())
            .map_err(|err| storage_err(format!("stat chunk {}", path.display()), err))
    }

    /// Chunks `0..total_chunks` in index order, read file by file.
    pub fn chunk_stream(&self, token: &SessionToken, total_chunks: u32) -> ByteStream {
        let paths: Vec<PathBuf> = (0..total_chunks).map(|index| self.chunk_path(token, index)).collect();
        stream::iter(paths)
            .then(|path| async move { tokio::fs::File::open(path).await })
            .map_ok(ReaderStream::new)
            .try_flatten()
            .boxed()
    }

    pub async fn save_session(&self, session: &ServerSession) -> Result<()> {
        let path = self.session_dir(&session.token).join(SESSION_FILE);
        let data = serde_json::to_vec_pretty(session)?;
        write_atomic(&path, &data).await
    }

    /// Loads every persisted session, skipping directories without a readable `session.json`.
    pub async fn load_sessions(&self) -> Result<Vec<ServerSession>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| storage_err(format!("list {}", self.root.display()), err))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| storage_err(format!("list {}", self.root.display()), err))?
        {
            let path = entry.path().join(SESSION_FILE);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable session");
                    continue;
                }
            };

            match serde_json::from_slice::<ServerSession>(&data) {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping corrupt session");
                }
            }
        }

        Ok(sessions)
    }

    /// Deletes the session directory with everything in it. Missing directories are fine.
    pub async fn remove_session(&self, token: &SessionToken) -> Result<()> {
        let dir = self.session_dir(token);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err(format!("remove {}", dir.display()), err)),
        }
    }

    pub async fn session_exists(&self, token: &SessionToken) -> bool {
        tokio::fs::try_exists(self.session_dir(token)).await.unwrap_or(false)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|err| storage_err(format!("write {}", tmp.display()), err))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| storage_err(format!("rename into {}", path.display()), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChunkPlan;
    use crate::types::OwnerId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn chunks_and_sessions_roundtrip_through_disk() {
        let dir = TempDir::new().unwrap();
        let store = TempStore::open(dir.path()).await.unwrap();
        let token = SessionToken::parse("s1").unwrap();

        store.create_session_dir(&token).await.unwrap();
        store.write_chunk(&token, 0, b"first").await.unwrap();
        store.write_chunk(&token, 0, b"again").await.unwrap();
        store.write_chunk(&token, 1, b"-tail").await.unwrap();
        assert_eq!(store.chunk_len(&token, 0).await.unwrap(), 5);

        let parts: Vec<bytes::Bytes> = store.chunk_stream(&token, 2).try_collect().await.unwrap();
        assert_eq!(parts.concat(), b"again-tail");
        assert!(store.chunk_stream(&token, 3).try_collect::<Vec<_>>().await.is_err());

        let mut session = ServerSession::new(
            token.clone(),
            OwnerId::new("alice"),
            "a.bin".into(),
            "application/octet-stream".into(),
            ChunkPlan::new(10, 5).unwrap(),
        );
        session.received.insert(0);
        store.save_session(&session).await.unwrap();

        let loaded = store.load_sessions().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].received.len(), 1);

        store.remove_session(&token).await.unwrap();
        assert!(!store.session_exists(&token).await);
        // second removal is a no-op
        store.remove_session(&token).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_session_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = TempStore::open(dir.path()).await.unwrap();
        let token = SessionToken::parse("broken").unwrap();
        store.create_session_dir(&token).await.unwrap();
        tokio::fs::write(store.session_dir(&token).join(SESSION_FILE), b"{not json")
            .await
            .unwrap();

        assert!(store.load_sessions().await.unwrap().is_empty());
    }
}
