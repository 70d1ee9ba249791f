//! Object storage behind a narrow trait: read / write / write-if-absent /
//! exists / list. Two backends exist: the local filesystem (keys are path
//! fragments under a root directory) and any S3-compatible API (Cloudflare
//! R2 in production).

mod local;
mod s3;

pub use local::LocalBlobStore;
pub use s3::{R2Config, S3BlobStore};

use futures::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob I/O failure for key {key:?}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object store request failed for key {key:?}: {message}")]
    Api { key: String, message: String },
}

impl BlobError {
    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn api(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Api {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the object at `key`, or None if it does not exist.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Unconditional put. Implementations always send an explicit content
    /// length; strict S3-family backends reject unknown-length streams.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError>;

    /// Write `bytes` under `key` only if the key does not already exist.
    /// Returns true if this call created the object. Concurrent callers may
    /// both observe true; keys are content-addressed, so both wrote the
    /// same bytes and either outcome is acceptable.
    async fn write_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    /// Lazily yield every key under `prefix`, transparently following
    /// pagination. No ordering guarantee across pages.
    fn list(&self, prefix: &str) -> BoxStream<'static, Result<String, BlobError>>;
}
