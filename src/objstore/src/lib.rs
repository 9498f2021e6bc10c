//! Contract between the cache engine and a remote object storage driver.
//!
//! Drivers implement [`ObjectStorage`]; the engine only ever talks to a
//! `dyn ObjectStorage`. Errors carry an errno-shaped tag ([`ObjError`]);
//! `NotFound` is the only variant callers are expected to branch on.

use std::pin::Pin;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

mod mem_store;
mod readonly;
mod trace;

pub use mem_store::MemStorage;
pub use readonly::ReadOnlyStorage;
pub use trace::TraceStorage;

#[derive(Debug, Clone, Error)]
pub enum ObjError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("operation not permitted: {0}")]
    NotPermitted(String),
    #[error("invalid argument: {0}")]
    InvalidParam(String),
    #[error("bad handle: {0}")]
    BadHandle(String),
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("is a directory: {0}")]
    IsDir(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("read-only storage: {0}")]
    ReadOnly(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
}

pub type ObjResult<T> = Result<T, ObjError>;

impl ObjError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjError::NotFound(_))
    }
}

impl From<std::io::Error> for ObjError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ObjError::NotFound(err.to_string())
        } else {
            ObjError::IoError(err.to_string())
        }
    }
}

/// Information about the storage as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub is_case_insensitive: bool,
    pub is_read_only: bool,
    pub max_component_length: u32,
    pub total_size: u64,
    pub free_size: u64,
}

/// Information about a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object name, without any path.
    pub name: String,
    pub size: u64,
    pub btime: SystemTime,
    pub mtime: SystemTime,
    pub is_dir: bool,
    /// Opaque version identifier (etag-like). Empty if the driver has none.
    pub sig: String,
}

pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Writer returned by [`ObjectStorage::open_write`].
///
/// Write the object bytes, then call `wait` to finish the transfer and
/// obtain the resulting object info. Dropping the writer without calling
/// `wait` cancels any pending transfer.
#[async_trait]
pub trait WriteWaiter: AsyncWrite + Send + Unpin {
    async fn wait(&mut self) -> ObjResult<ObjectInfo>;
}

/// The interface an object storage driver must implement.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Get storage information. `get_size` instructs the driver to also
    /// contact the storage for size information.
    async fn info(&self, get_size: bool) -> ObjResult<StorageInfo>;

    /// List objects directly under `prefix`. A non-empty `marker` continues
    /// a paginated listing; pagination ends when the returned marker is
    /// empty. `max_count == 0` means no limit (the driver may still page).
    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        max_count: usize,
    ) -> ObjResult<(String, Vec<ObjectInfo>)>;

    async fn stat(&self, name: &str) -> ObjResult<ObjectInfo>;

    async fn mkdir(&self, prefix: &str) -> ObjResult<ObjectInfo>;

    async fn rmdir(&self, prefix: &str) -> ObjResult<()>;

    async fn remove(&self, name: &str) -> ObjResult<()>;

    async fn rename(&self, oldname: &str, newname: &str) -> ObjResult<()>;

    /// Open an object for reading. If `sig` is non-empty and matches the
    /// object's current signature, no reader is returned: the caller's
    /// copy is still current.
    async fn open_read(
        &self,
        name: &str,
        sig: &str,
    ) -> ObjResult<(ObjectInfo, Option<ObjectReader>)>;

    /// Open an object for writing. `size` is the size the written object
    /// will have.
    async fn open_write(&self, name: &str, size: u64) -> ObjResult<Box<dyn WriteWaiter>>;
}
