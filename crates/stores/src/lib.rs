pub mod blob;
pub mod keys;
pub mod meta;

pub use blob::{BlobError, BlobStore, LocalBlobStore, R2Config, S3BlobStore};
pub use meta::{
    DocStatus, DocumentPatch, DocumentRow, ExtractionCounts, ExtractionStats, MetaStore,
};
