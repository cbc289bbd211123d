//! Server half of the engine: chunk intake, assembly and crash recovery.

pub mod assembler;
pub mod external;
pub mod http;
pub mod recovery;
pub mod session;
pub mod store;
pub mod temp;

pub use assembler::Assembler;
pub use external::{
    BlobStore, ByteStream, FileCreated, FileRecord, FsBlobStore, MemoryBlobStore, MemoryMetadataStore, MetadataStore,
    NewFile, NewVideo,
};
pub use http::router;
pub use recovery::{run_recovery, spawn_recovery, RecoveryReport};
pub use session::ServerSession;
pub use store::{SessionStore, StoreConfig};
pub use temp::TempStore;
