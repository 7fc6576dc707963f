//! ferry-transfer: resumable chunked file transfer
//!
//! A transfer copies one source store to one destination store in fixed-size
//! chunks. Each chunk runs read → (compress → encrypt) → verify → write; the
//! whole session is persisted after every change so a restarted process can
//! pick up where the previous one stopped.
//!
//! Entry point is [`TransferManager`].

pub mod handler;
pub mod keying;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod store;
pub mod unpack;

mod handle;

pub use handler::{ChunkOutcome, ChunkTransferHandler, FailureKind};
pub use keying::KeySource;
pub use manager::{ManagerSettings, TransferManager, TransferManagerBuilder};
pub use model::{DestinationLayout, TransferChunk, TransferSession};
pub use pipeline::ChunkPipeline;
pub use progress::{ProgressObserver, TransferProgress};
pub use state::{JsonSessionStore, SessionLease, SessionStateStore};
pub use store::{ByteStore, LocalFileStore, LocalStoreProvider, StoreProvider};
