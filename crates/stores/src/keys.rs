//! The blob keyspace. Every component addresses objects through these
//! helpers so the layout lives in exactly one place.

/// Prefix under which canonical document payloads are stored.
pub const DOCUMENTS_PREFIX: &str = "documents";
/// Prefix under which extracted text and metadata are stored.
pub const EXTRACTED_PREFIX: &str = "extracted";
/// Key of the uploaded-ids manifest mirror.
pub const MANIFEST: &str = "manifest.txt";

/// Canonical storage key of a payload: `documents/<hex-hash>.docx`.
pub fn document(prefix: &str, id: &str) -> String {
    format!("{}/{}.docx", prefix.trim_end_matches('/'), id)
}

/// Extracted plain text: `extracted/<hex-hash>.txt`.
pub fn extracted_text(prefix: &str, id: &str) -> String {
    format!("{}/{}.txt", prefix.trim_end_matches('/'), id)
}

/// Extractor structured output: `extracted/<hex-hash>.json`.
pub fn extracted_meta(prefix: &str, id: &str) -> String {
    format!("{}/{}.json", prefix.trim_end_matches('/'), id)
}

/// Filtered-index shard prefix for one crawl: `cdx-filtered/<crawl-id>/`.
pub fn cdx_shard_prefix(crawl_id: &str) -> String {
    format!("cdx-filtered/{}/", crawl_id)
}
