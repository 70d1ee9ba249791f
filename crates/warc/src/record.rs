//! The two-tier record format stored inside archive containers:
//!
//! ```text
//! <archive-headers>\r\n\r\n<http-response-headers>\r\n\r\n<body-bytes>
//! ```
//!
//! The format is not text. Separators are located by byte search and only
//! the header slices are ever decoded; the body is passed through as-is.

use lazy_static::lazy_static;
use memchr::memmem;
use regex::Regex;

const SEPARATOR: &[u8] = b"\r\n\r\n";

lazy_static! {
    static ref STATUS_LINE: Regex =
        Regex::new(r"HTTP/\d+(?:\.\d+)?\s+(\d+)").expect("static status-line pattern");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// Status code from the stored HTTP status line; 0 when absent.
    pub http_status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record has no archive-header separator")]
    MissingArchiveSeparator,
    #[error("record has no HTTP-header separator")]
    MissingHttpSeparator,
}

pub fn parse_archive_record(bytes: &[u8]) -> Result<ArchiveRecord, RecordError> {
    let archive_end =
        memmem::find(bytes, SEPARATOR).ok_or(RecordError::MissingArchiveSeparator)?;
    let http = &bytes[archive_end + SEPARATOR.len()..];
    let headers_end = memmem::find(http, SEPARATOR).ok_or(RecordError::MissingHttpSeparator)?;

    let headers = String::from_utf8_lossy(&http[..headers_end]);
    let body = http[headers_end + SEPARATOR.len()..].to_vec();

    let http_status = STATUS_LINE
        .captures(&headers)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);

    let content_type = headers.lines().find_map(|line| {
        let prefix = line.as_bytes().get(..13)?;
        if prefix.eq_ignore_ascii_case(b"content-type:") {
            Some(line[13..].trim().to_string())
        } else {
            None
        }
    });

    Ok(ArchiveRecord {
        http_status,
        content_type,
        body,
    })
}

/// Frame `body` as a stored archive record. The inverse of
/// [`parse_archive_record`] for well-formed inputs.
pub fn encode_archive_record(status: u16, content_type: Option<&str>, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 128);
    out.extend_from_slice(b"WARC/1.0\r\nWARC-Type: response\r\n\r\n");
    out.extend_from_slice(format!("HTTP/1.1 {status} OK\r\n").as_bytes());
    if let Some(ct) = content_type {
        out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}
