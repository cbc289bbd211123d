//! Client half of the engine: the upload scheduler, its persistence and transports.

pub mod persistence;
pub mod scheduler;
mod scheduler_worker;
pub mod transport;
pub mod types;

pub use persistence::{JsonFilePersistence, MemoryPersistence, SessionPersistence};
pub use scheduler::{UploadScheduler, UploadSchedulerHandle};
pub use transport::{HttpTransport, LocalTransport, UploadTransport};
pub use types::{ClientSession, ResumeAllReport, SchedulerConfig, SessionProgress, UploadEvent};
