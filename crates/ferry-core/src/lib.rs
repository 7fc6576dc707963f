pub mod config;
pub mod error;
pub mod types;

pub use error::{FerryError, FerryResult};
pub use types::{ChunkStatus, TransferOptions, TransferStatus};
