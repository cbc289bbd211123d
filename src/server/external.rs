//! Collaborators outside the upload engine: blob storage and the metadata store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;
use crate::errors::{Result, UploadError};
use crate::types::{OwnerId, SessionToken};

/// Blob content, produced piece by piece.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Object storage addressed by key. `put` is assumed atomic: a stream that fails or
/// does not add up to `size` bytes leaves nothing behind.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: ByteStream, size: u64, mime_type: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub owner_id: OwnerId,
    pub upload_token: SessionToken,
    pub key: String,
    pub url: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVideo {
    pub owner_id: OwnerId,
    pub file_id: String,
    pub title: String,
}

/// A file record already created for an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub video_id: Option<String>,
    pub key: String,
    pub url: String,
}

/// Relational store for file and video metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_file(&self, file: NewFile) -> Result<String>;

    async fn create_video(&self, video: NewVideo) -> Result<String>;

    /// Record previously created for `upload_token`, used to keep assembly re-runs idempotent.
    async fn find_file_by_upload(&self, upload_token: &SessionToken) -> Result<Option<FileRecord>>;
}

/// Published once per completed upload; the enrichment pipeline consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreated {
    pub owner_id: OwnerId,
    pub upload_token: SessionToken,
    pub file_id: String,
    pub video_id: Option<String>,
    pub key: String,
    pub url: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Blob store writing objects under a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, mut data: ByteStream, size: u64, _mime_type: &str) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| UploadError::storage(format!("create {}: {err}", parent.display())))?;
        }

        let tmp = path.with_extension("part");
        let written = match copy_to_file(&tmp, &mut data).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(UploadError::storage(format!("write blob {key}: {err}")));
            }
        };
        if written != size {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(UploadError::storage(format!("blob {key}: got {written} bytes, expected {size}")));
        }

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| UploadError::storage(format!("commit blob {key}: {err}")))?;

        Ok(format!("{}/{}", self.public_base_url, key))
    }
}

async fn copy_to_file(path: &Path, data: &mut ByteStream) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(bytes) = data.try_next().await? {
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;
    }
    file.sync_all().await?;
    Ok(written)
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, (Bytes, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).map(|(data, _)| data.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: ByteStream, size: u64, mime_type: &str) -> Result<String> {
        let buffer = data
            .try_fold(BytesMut::new(), |mut buffer, bytes| async move {
                buffer.extend_from_slice(&bytes);
                Ok(buffer)
            })
            .await
            .map_err(|err| UploadError::storage(format!("read blob {key}: {err}")))?;
        if buffer.len() as u64 != size {
            return Err(UploadError::storage(format!(
                "blob {key}: got {} bytes, expected {size}",
                buffer.len()
            )));
        }

        self.objects
            .write()
            .await
            .insert(key.to_string(), (buffer.freeze(), mime_type.to_string()));
        Ok(format!("memory://{key}"))
    }
}

#[derive(Debug, Default)]
struct MetadataTables {
    files: Vec<(String, NewFile)>,
    videos: Vec<(String, NewVideo)>,
}

/// In-process metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<MetadataTables>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn file_count(&self) -> usize {
        self.tables.read().await.files.len()
    }

    pub async fn video_count(&self) -> usize {
        self.tables.read().await.videos.len()
    }

    pub async fn files(&self) -> Vec<NewFile> {
        self.tables.read().await.files.iter().map(|(_, file)| file.clone()).collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_file(&self, file: NewFile) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.tables.write().await.files.push((id.clone(), file));
        Ok(id)
    }

    async fn create_video(&self, video: NewVideo) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.tables.write().await.videos.push((id.clone(), video));
        Ok(id)
    }

    async fn find_file_by_upload(&self, upload_token: &SessionToken) -> Result<Option<FileRecord>> {
        let tables = self.tables.read().await;
        let Some((file_id, file)) = tables
            .files
            .iter()
            .find(|(_, file)| &file.upload_token == upload_token)
        else {
            return Ok(None);
        };

        let video_id = tables
            .videos
            .iter()
            .find(|(_, video)| &video.file_id == file_id)
            .map(|(id, _)| id.clone());

        Ok(Some(FileRecord {
            file_id: file_id.clone(),
            video_id,
            key: file.key.clone(),
            url: file.url.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use tempfile::TempDir;

    fn parts(pieces: &[&'static [u8]]) -> ByteStream {
        let pieces: Vec<std::io::Result<Bytes>> = pieces.iter().map(|piece| Ok(Bytes::from_static(piece))).collect();
        stream::iter(pieces).boxed()
    }

    #[tokio::test]
    async fn fs_blob_store_writes_under_key() {
        let dir = TempDir::new().unwrap();
        let blobs = FsBlobStore::new(dir.path(), "http://cdn.local/");
        let url = blobs
            .put("uploads/alice/x/photo.jpg", parts(&[b"jp", b"eg"]), 4, "image/jpeg")
            .await
            .unwrap();

        assert_eq!(url, "http://cdn.local/uploads/alice/x/photo.jpg");
        let stored = tokio::fs::read(dir.path().join("uploads/alice/x/photo.jpg")).await.unwrap();
        assert_eq!(stored, b"jpeg");
    }

    #[tokio::test]
    async fn short_or_broken_streams_leave_nothing() {
        let dir = TempDir::new().unwrap();
        let blobs = FsBlobStore::new(dir.path(), "http://cdn.local");
        assert!(matches!(
            blobs.put("uploads/a/short.bin", parts(&[b"abc"]), 4, "application/octet-stream").await,
            Err(UploadError::Storage(_))
        ));

        let broken: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(std::io::Error::other("disk went away")),
        ])
        .boxed();
        assert!(blobs.put("uploads/a/broken.bin", broken, 4, "application/octet-stream").await.is_err());

        let mut left = tokio::fs::read_dir(dir.path().join("uploads/a")).await.unwrap();
        assert!(left.next_entry().await.unwrap().is_none());

        let memory = MemoryBlobStore::new();
        assert!(memory.put("k", parts(&[b"abc"]), 4, "text/plain").await.is_err());
        assert_eq!(memory.len().await, 0);
    }

    #[tokio::test]
    async fn metadata_lookup_links_videos() {
        let store = MemoryMetadataStore::new();
        let token = SessionToken::parse("up1").unwrap();
        let file_id = store
            .create_file(NewFile {
                owner_id: OwnerId::new("alice"),
                upload_token: token.clone(),
                key: "k".into(),
                url: "u".into(),
                filename: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                size: 3,
            })
            .await
            .unwrap();

        let record = store.find_file_by_upload(&token).await.unwrap().unwrap();
        assert_eq!(record.file_id, file_id);
        assert!(record.video_id.is_none());

        let video_id = store
            .create_video(NewVideo {
                owner_id: OwnerId::new("alice"),
                file_id: file_id.clone(),
                title: "clip.mp4".into(),
            })
            .await
            .unwrap();
        let record = store.find_file_by_upload(&token).await.unwrap().unwrap();
        assert_eq!(record.video_id, Some(video_id));
    }
}
