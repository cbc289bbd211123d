use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::errors::{Result, UploadError};

/// Opaque session identifier, generated by the client.
///
/// The server uses it as a directory name, so only `[A-Za-z0-9_-]` is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionToken(String);

impl SessionToken {
    pub const MAX_LEN: usize = 128;

    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() || value.len() > Self::MAX_LEN {
            return Err(UploadError::InvalidRequest(format!(
                "session token must be 1..={} characters",
                Self::MAX_LEN
            )));
        }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(UploadError::InvalidRequest(format!(
                "session token contains invalid characters: {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for SessionToken {
    type Error = UploadError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SessionToken> for String {
    fn from(token: SessionToken) -> Self {
        token.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the user who owns a session. Supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// 已创建，尚未开始传输
    Pending,
    /// 上传中
    Active,
    /// 已暂停
    Paused,
    /// 所有分片已到达，正在组装
    Finalizing,
    /// 已完成
    Completed,
    /// 失败，可手动或定时重试
    Error,
    /// 已取消
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Scheduling hint, never affects correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    /// Pinned
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    #[default]
    File,
    Video,
}

/// `ceil(total_size / chunk_size)`; an empty file still has no chunks.
pub fn total_chunks(total_size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_rejects_path_characters() {
        assert!(SessionToken::parse("../etc").is_err());
        assert!(SessionToken::parse("a/b").is_err());
        assert!(SessionToken::parse("").is_err());
        assert!(SessionToken::parse("abc-DEF_123").is_ok());
    }

    #[test]
    fn generated_tokens_are_valid() {
        let token = SessionToken::new();
        assert!(SessionToken::parse(token.as_str()).is_ok());
    }

    #[test]
    fn token_deserialization_validates() {
        let parsed: std::result::Result<SessionToken, _> = serde_json::from_str("\"a/b\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks(10_500_000, 1_000_000), 11);
        assert_eq!(total_chunks(10_000_000, 1_000_000), 10);
        assert_eq!(total_chunks(1, 1_000_000), 1);
    }
}
