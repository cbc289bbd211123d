//! Resumable chunked upload engine: a client scheduler that survives restarts and
//! network loss, and a server store that assembles chunks durably.

pub mod client;
pub mod codec;
pub mod config;
pub mod errors;
pub mod network;
pub mod protocol;
pub mod server;
pub mod types;
pub mod utils;

// 重新导出核心类型
pub use client::{
    ClientSession, HttpTransport, JsonFilePersistence, LocalTransport, MemoryPersistence, SchedulerConfig,
    SessionPersistence, UploadEvent, UploadScheduler, UploadSchedulerHandle, UploadTransport,
};
pub use codec::{ChunkPlan, FileSource, LocalFile, MemoryFile};
pub use config::Config;
pub use errors::{Result, UploadError};
pub use server::{Assembler, SessionStore, StoreConfig, TempStore};
pub use types::{OwnerId, Priority, SessionStatus, SessionToken, UploadKind};
