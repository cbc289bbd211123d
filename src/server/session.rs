use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::codec::ChunkPlan;
use crate::errors::{Result, UploadError};
use crate::protocol::FinalizeResponse;
use crate::types::{OwnerId, SessionStatus, SessionToken};

/// Server-side view of an upload session, persisted as `session.json` next to its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSession {
    pub token: SessionToken,
    pub owner_id: OwnerId,
    pub filename: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Set once assembly succeeded, before the chunks are released.
    #[serde(default)]
    pub outcome: Option<FinalizeResponse>,
}

impl ServerSession {
    pub fn new(
        token: SessionToken,
        owner_id: OwnerId,
        filename: String,
        mime_type: String,
        plan: ChunkPlan,
    ) -> Self {
        let now = Utc::now();
        Self {
            token,
            owner_id,
            filename,
            mime_type,
            total_size: plan.total_size(),
            chunk_size: plan.chunk_size(),
            total_chunks: plan.total_chunks(),
            received: BTreeSet::new(),
            status: SessionStatus::Pending,
            created_at: now,
            last_activity_at: now,
            outcome: None,
        }
    }

    pub fn plan(&self) -> Result<ChunkPlan> {
        ChunkPlan::new(self.total_size, self.chunk_size)
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u64 == self.total_chunks as u64
    }

    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_chunks).filter(|index| !self.received.contains(index))
    }

    pub fn authorize(&self, owner: &OwnerId) -> Result<()> {
        if &self.owner_id != owner {
            return Err(UploadError::Unauthorized {
                token: self.token.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }
}
