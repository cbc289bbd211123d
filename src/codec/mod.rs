//! Chunk planning, integrity checksums and the transport encoding of chunk bytes.

mod source;

pub use source::{FileSource, LocalFile, MemoryFile};

use std::ops::Range;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use crate::errors::{Result, UploadError};
use crate::types::total_chunks;

/// Fixed-size, index-ordered split of a file. Only the last chunk may be short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidRequest("chunk size must be positive".to_string()));
        }
        if total_size == 0 {
            return Err(UploadError::InvalidRequest("file is empty".to_string()));
        }
        if total_size.div_ceil(chunk_size) > u32::MAX as u64 {
            return Err(UploadError::InvalidRequest(format!(
                "chunk size {chunk_size} is too small for {total_size} bytes"
            )));
        }

        Ok(Self {
            total_size,
            chunk_size,
            total_chunks: total_chunks(total_size, chunk_size),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Byte range of chunk `index` within the file.
    pub fn chunk_range(&self, index: u32) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as u64 * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(start..end)
    }

    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        self.chunk_range(index).map(|range| range.end - range.start)
    }

    /// Reads chunk `index` from `source`, failing if the source is shorter than planned.
    pub async fn read_chunk(&self, source: &dyn FileSource, index: u32) -> Result<Bytes> {
        let range = self.chunk_range(index).ok_or(UploadError::InvalidChunkIndex {
            index,
            total_chunks: self.total_chunks,
        })?;
        let len = (range.end - range.start) as usize;
        let data = source.read_range(range.start, len).await?;
        if data.len() != len {
            return Err(UploadError::FileMismatch(format!(
                "expected {len} bytes for chunk {index}, read {}",
                data.len()
            )));
        }
        Ok(data)
    }
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verifies `data` against an optional hex checksum. An absent checksum always passes.
pub fn verify_checksum(index: u32, data: &[u8], expected: Option<&str>) -> Result<()> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(&checksum_bytes(data)) => {
            Err(UploadError::ChecksumMismatch { index })
        }
        _ => Ok(()),
    }
}

/// Content fingerprint: SHA-256 over the file size and its first chunk.
///
/// Cheap enough to compute on every re-selection while still catching a
/// different file of identical size.
pub async fn fingerprint(source: &dyn FileSource, chunk_size: u64) -> Result<String> {
    let size = source.size();
    let head_len = size.min(chunk_size) as usize;
    let head = source.read_range(0, head_len).await?;

    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(&head);
    Ok(hex::encode(hasher.finalize()))
}

pub fn encode_chunk(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

pub fn decode_chunk(encoded: &str) -> Result<Bytes> {
    BASE64_STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(|err| UploadError::InvalidRequest(format!("chunk payload is not base64: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_for_eleven_chunks() {
        let plan = ChunkPlan::new(10_500_000, 1_000_000).unwrap();
        assert_eq!(plan.total_chunks(), 11);
        assert_eq!(plan.chunk_len(0), Some(1_000_000));
        assert_eq!(plan.chunk_len(10), Some(500_000));
        assert_eq!(plan.chunk_range(10), Some(10_000_000..10_500_000));
        assert_eq!(plan.chunk_range(11), None);
    }

    #[test]
    fn plan_rejects_zero_sizes() {
        assert!(ChunkPlan::new(0, 1024).is_err());
        assert!(ChunkPlan::new(1024, 0).is_err());
    }

    #[test]
    fn checksum_verification() {
        let data = b"hello chunk";
        let sum = checksum_bytes(data);
        assert_eq!(sum.len(), 64);
        assert!(verify_checksum(0, data, Some(&sum)).is_ok());
        assert!(verify_checksum(0, data, Some(&sum.to_uppercase())).is_ok());
        assert!(verify_checksum(0, data, None).is_ok());
        assert!(matches!(
            verify_checksum(3, b"other", Some(&sum)),
            Err(UploadError::ChecksumMismatch { index: 3 })
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_chunk("not base64 !!").is_err());
        assert_eq!(decode_chunk(&encode_chunk(b"abc")).unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn read_chunk_slices_source() {
        let file = MemoryFile::new("a.bin", (0u8..10).collect::<Vec<_>>());
        let plan = ChunkPlan::new(10, 4).unwrap();
        assert_eq!(plan.read_chunk(&file, 1).await.unwrap().as_ref(), &[4, 5, 6, 7]);
        assert_eq!(plan.read_chunk(&file, 2).await.unwrap().as_ref(), &[8, 9]);
        assert!(plan.read_chunk(&file, 3).await.is_err());
    }

    #[tokio::test]
    async fn fingerprint_distinguishes_content() {
        let a = MemoryFile::new("a.bin", vec![1u8; 64]);
        let b = MemoryFile::new("a.bin", vec![2u8; 64]);
        let fa = fingerprint(&a, 16).await.unwrap();
        assert_eq!(fa, fingerprint(&a, 16).await.unwrap());
        assert_ne!(fa, fingerprint(&b, 16).await.unwrap());
    }
}
