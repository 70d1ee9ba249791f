//! Access to archive containers: the adaptive rate limiter that paces all
//! outbound requests, the nested record format stored inside containers,
//! and the ranged-GET fetcher that ties both together.

pub mod fetch;
pub mod limiter;
pub mod record;

pub use fetch::{FetchError, FetchOptions, Fetched, Fetcher, DEFAULT_BASE_URL, USER_AGENT};
pub use limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use record::{encode_archive_record, parse_archive_record, ArchiveRecord, RecordError};
