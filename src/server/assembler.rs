use std::sync::Arc;
use uuid::Uuid;
use crate::errors::{Result, UploadError};
use crate::protocol::FinalizeResponse;
use super::external::{BlobStore, MetadataStore, NewFile, NewVideo};
use super::session::ServerSession;
use super::temp::TempStore;

/// Turns a complete set of chunks into a blob plus its file (and video) record.
///
/// It never releases temporary storage itself; the session store does that
/// after the outcome has been persisted.
#[derive(Clone)]
pub struct Assembler {
    temp: TempStore,
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
}

impl Assembler {
    pub fn new(temp: TempStore, blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self { temp, blobs, metadata }
    }

    pub async fn assemble(&self, session: &ServerSession) -> Result<FinalizeResponse> {
        if !session.is_complete() {
            return Err(UploadError::incomplete(session.missing()));
        }

        // A previous attempt got as far as the metadata store before dying.
        if let Some(existing) = self.metadata.find_file_by_upload(&session.token).await? {
            tracing::info!(token = %session.token, file_id = %existing.file_id, "reusing file record from earlier attempt");
            let video_id = match existing.video_id {
                Some(id) => Some(id),
                None if session.is_video() => Some(self.create_video(session, &existing.file_id).await?),
                None => None,
            };
            return Ok(FinalizeResponse {
                file_id: existing.file_id,
                video_id,
                url: existing.url,
                file_key: existing.key,
            });
        }

        tracing::info!(
            token = %session.token,
            total_chunks = session.total_chunks,
            total_size = session.total_size,
            "assembling chunks"
        );

        // 写 blob 之前先核对分片大小
        let mut stored = 0u64;
        for index in 0..session.total_chunks {
            stored += self.temp.chunk_len(&session.token, index).await?;
        }
        if stored != session.total_size {
            return Err(UploadError::storage(format!(
                "chunks hold {stored} bytes, expected {}",
                session.total_size
            )));
        }

        let key = blob_key(session);
        let chunks = self.temp.chunk_stream(&session.token, session.total_chunks);
        let url = self
            .blobs
            .put(&key, chunks, session.total_size, &session.mime_type)
            .await?;

        let file_id = self
            .metadata
            .create_file(NewFile {
                owner_id: session.owner_id.clone(),
                upload_token: session.token.clone(),
                key: key.clone(),
                url: url.clone(),
                filename: session.filename.clone(),
                mime_type: session.mime_type.clone(),
                size: session.total_size,
            })
            .await?;

        let video_id = if session.is_video() {
            Some(self.create_video(session, &file_id).await?)
        } else {
            None
        };

        tracing::info!(token = %session.token, %file_id, %key, "assembly complete");

        Ok(FinalizeResponse {
            file_id,
            video_id,
            url,
            file_key: key,
        })
    }

    async fn create_video(&self, session: &ServerSession, file_id: &str) -> Result<String> {
        self.metadata
            .create_video(NewVideo {
                owner_id: session.owner_id.clone(),
                file_id: file_id.to_string(),
                title: session.filename.clone(),
            })
            .await
    }
}

/// Fresh content key: `uploads/<owner>/<uuid>/<filename>`.
fn blob_key(session: &ServerSession) -> String {
    let owner = sanitize_filename::sanitize(session.owner_id.as_str());
    let mut filename = sanitize_filename::sanitize(&session.filename);
    if filename.is_empty() {
        filename = "upload".to_string();
    }
    format!("uploads/{owner}/{}/{filename}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ChunkPlan, MemoryFile};
    use crate::server::external::{FsBlobStore, MemoryBlobStore, MemoryMetadataStore};
    use crate::types::{OwnerId, SessionToken};
    use tempfile::TempDir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn stored_session(temp: &TempStore, data: &[u8], chunk_size: u64, mime: &str) -> ServerSession {
        let plan = ChunkPlan::new(data.len() as u64, chunk_size).unwrap();
        let mut session = ServerSession::new(
            SessionToken::new(),
            OwnerId::new("alice"),
            "holiday.mov".into(),
            mime.into(),
            plan,
        );
        temp.create_session_dir(&session.token).await.unwrap();

        let file = MemoryFile::new("holiday.mov", data.to_vec());
        // write in reverse to show arrival order does not matter
        for index in (0..plan.total_chunks()).rev() {
            let chunk = plan.read_chunk(&file, index).await.unwrap();
            temp.write_chunk(&session.token, index, &chunk).await.unwrap();
            session.received.insert(index);
        }
        session
    }

    #[tokio::test]
    async fn reproduces_original_bytes() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::open(dir.path()).await.unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let assembler = Assembler::new(temp.clone(), blobs.clone(), metadata.clone());

        let data = pattern(10_500_000);
        let session = stored_session(&temp, &data, 1_000_000, "application/octet-stream").await;
        assert_eq!(session.total_chunks, 11);

        let outcome = assembler.assemble(&session).await.unwrap();
        let stored = blobs.get(&outcome.file_key).await.unwrap();
        assert_eq!(stored.len(), 10_500_000);
        assert!(stored.as_ref() == data.as_slice());
        assert!(outcome.video_id.is_none());
        assert_eq!(metadata.file_count().await, 1);
    }

    #[tokio::test]
    async fn streams_chunks_into_files_on_disk() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::open(dir.path().join("tmp")).await.unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs"), "http://cdn.local"));
        let assembler = Assembler::new(temp.clone(), blobs, Arc::new(MemoryMetadataStore::new()));

        let data = pattern(2_500_000);
        let session = stored_session(&temp, &data, 1_000_000, "video/mp4").await;
        let outcome = assembler.assemble(&session).await.unwrap();

        let stored = tokio::fs::read(dir.path().join("blobs").join(&outcome.file_key)).await.unwrap();
        assert!(stored == data);
        assert_eq!(outcome.url, format!("http://cdn.local/{}", outcome.file_key));
    }

    #[tokio::test]
    async fn truncated_chunk_is_caught_before_any_write() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::open(dir.path()).await.unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let assembler = Assembler::new(temp.clone(), blobs.clone(), metadata.clone());

        let session = stored_session(&temp, &pattern(3000), 1000, "image/png").await;
        temp.write_chunk(&session.token, 1, &[0u8; 10]).await.unwrap();

        assert!(matches!(assembler.assemble(&session).await, Err(UploadError::Storage(_))));
        assert_eq!(blobs.len().await, 0);
        assert_eq!(metadata.file_count().await, 0);
    }

    #[tokio::test]
    async fn rerun_reuses_existing_record() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::open(dir.path()).await.unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        let metadata = Arc::new(MemoryMetadataStore::new());
        let assembler = Assembler::new(temp.clone(), blobs, metadata.clone());

        let session = stored_session(&temp, &pattern(3000), 1000, "video/quicktime").await;
        let first = assembler.assemble(&session).await.unwrap();
        let second = assembler.assemble(&session).await.unwrap();

        assert_eq!(first, second);
        assert!(first.video_id.is_some());
        assert_eq!(metadata.file_count().await, 1);
        assert_eq!(metadata.video_count().await, 1);
    }

    #[tokio::test]
    async fn refuses_incomplete_sessions() {
        let dir = TempDir::new().unwrap();
        let temp = TempStore::open(dir.path()).await.unwrap();
        let assembler = Assembler::new(
            temp.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        );

        let mut session = stored_session(&temp, &pattern(3000), 1000, "image/png").await;
        session.received.remove(&1);
        match assembler.assemble(&session).await {
            Err(UploadError::IncompleteUpload { missing, missing_count }) => {
                assert_eq!(missing, vec![1]);
                assert_eq!(missing_count, 1);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn blob_key_is_sanitized() {
        let mut session = ServerSession::new(
            SessionToken::new(),
            OwnerId::new("../evil"),
            "../../etc/passwd".into(),
            "text/plain".into(),
            ChunkPlan::new(1, 1).unwrap(),
        );
        let key = blob_key(&session);
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "uploads");
        assert!(parts.iter().all(|part| *part != ".." && *part != "." && !part.is_empty()));

        session.filename = "/".into();
        assert!(blob_key(&session).ends_with("/upload"));
    }
}
