pub mod locking;
pub mod store;

pub use locking::LockGuard;
pub use store::SharedDocument;

use std::path::PathBuf;
use thiserror::Error;

/// Failures of a locked read-modify-write cycle on a shared document
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Document {0:?} does not exist")]
    DocumentNotFound(PathBuf),
    #[error("Failed to acquire lock {path:?}")]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("I/O error on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to (de)serialize {path:?}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
