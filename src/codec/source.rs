use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use crate::errors::{Result, UploadError};

/// A readable file the client is uploading.
///
/// A session only holds one of these while the file is "live"; after a
/// reload the caller has to supply it again.
#[async_trait]
pub trait FileSource: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Reads up to `len` bytes starting at `offset`.
    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes>;
}

/// File on the local filesystem, reopened for every read.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    size: u64,
}

impl LocalFile {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::InvalidRequest(format!("not a file: {}", path.display())));
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::InvalidRequest(format!("unreadable file name: {}", path.display())))?
            .to_string();

        Ok(Self {
            name,
            size: metadata.len(),
            path,
        })
    }
}

#[async_trait]
impl FileSource for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

/// In-memory file, handy for tests and for callers that already hold the bytes.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_file_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let file = LocalFile::open(&path).await.unwrap();
        assert_eq!(file.name(), "clip.mp4");
        assert_eq!(file.size(), 10);
        assert_eq!(file.read_range(6, 4).await.unwrap().as_ref(), b"6789");
        assert_eq!(file.read_range(8, 4).await.unwrap().as_ref(), b"89");
    }

    #[tokio::test]
    async fn local_file_rejects_directories() {
        let dir = TempDir::new().unwrap();
        assert!(LocalFile::open(dir.path()).await.is_err());
    }
}
