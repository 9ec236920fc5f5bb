//! Storage adapter seam: the capability set this remote needs from an
//! object store, with one production implementation (Backblaze B2) and one
//! in-memory implementation for tests.

pub mod b2;
pub mod memory;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::config::RemoteConfig;

/// A streaming object body, for uploads and downloads.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// One listed object: the store's name for it plus its version id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub file_name: String,
    pub file_id: String,
}

/// Per-object metadata relevant to dedup decisions.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Hex-encoded SHA-1 of the stored content.
    pub content_sha1: String,
}

/// Errors at the object-store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("couldn't authorize: {0}")]
    Auth(String),

    #[error("bucket {0:?} no longer exists")]
    BucketMissing(String),

    #[error("remote returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("file {0:?} not found in bucket")]
    NotFound(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Object-store operations on one open bucket.
///
/// Implementations handle raw I/O only. Dedup decisions, presence caching
/// and progress reporting all live above this seam.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List at most one file at or after `name`. The store may return the
    /// lexicographically next name, so callers must check for an exact match.
    async fn list_by_exact_name(&self, name: &str) -> Result<Option<RemoteObject>, StoreError>;

    /// Fetch metadata for a specific file version.
    async fn get_info(&self, file_id: &str) -> Result<ObjectInfo, StoreError>;

    /// Upload `length` bytes from `content` under `name`. The SHA-1 is
    /// precomputed by the caller so the store can verify integrity without
    /// re-reading the content.
    async fn upload(
        &self,
        name: &str,
        content: ByteStream,
        sha1_hex: &str,
        length: u64,
    ) -> Result<(), StoreError>;

    /// Download the named file as a byte stream.
    async fn download(&self, name: &str) -> Result<ByteStream, StoreError>;

    /// Delete one specific file version.
    async fn delete_version(&self, name: &str, file_id: &str) -> Result<(), StoreError>;
}

/// Authorizes against the store and opens (or creates) the configured
/// bucket, producing a bound [`RemoteStore`].
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Open the configured bucket. In may-create mode a missing bucket is
    /// created as a private bucket; otherwise it is an error.
    async fn connect(
        &self,
        config: &RemoteConfig,
        may_create: bool,
    ) -> Result<Box<dyn RemoteStore>, StoreError>;
}
