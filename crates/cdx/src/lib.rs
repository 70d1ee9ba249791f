//! Records of the per-crawl URL index (CDX): the parsed shape of one
//! candidate download, plus parsing of raw index lines and the filtered
//! JSONL shard stream.

mod stream;

pub use stream::{CdxStream, CdxStreamError};

use serde::{Deserialize, Serialize};

/// MIME type a record must carry to survive filtering.
pub const WORD_MIME: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// One candidate download out of the filtered index. `offset` and `length`
/// are decimal strings addressing a byte range inside the archive
/// container at `filename`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdxRecord {
    pub url: String,
    pub mime: String,
    pub status: String,
    pub digest: String,
    pub length: String,
    pub offset: String,
    pub filename: String,
}

impl CdxRecord {
    pub fn offset_bytes(&self) -> Option<u64> {
        self.offset.parse().ok()
    }

    pub fn length_bytes(&self) -> Option<u64> {
        self.length.parse().ok()
    }
}

/// Parse one raw upstream index line of the form `surt timestamp {json}`.
///
/// Anything that is not a well-formed 200-status Word-document record
/// yields None: blank lines, lines without a JSON object, malformed JSON,
/// other MIME types, redirects. The caller skips, never errors.
pub fn parse_cdx_line(line: &str) -> Option<CdxRecord> {
    let json_start = line.find('{')?;
    let record: CdxRecord = serde_json::from_str(&line[json_start..]).ok()?;
    if record.status != "200" || record.mime != WORD_MIME {
        return None;
    }
    Some(record)
}
