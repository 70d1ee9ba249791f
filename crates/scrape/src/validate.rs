//! Cheap structural sniffing of candidate payloads. This is deliberately
//! not a ZIP parse: the checks are a fast filter in front of the store,
//! and the extractor catches the rare false positive later.

use memchr::memmem;
use sha2::{Digest, Sha256};

/// Anything below this cannot be a useful Word document.
pub const MIN_PAYLOAD_LEN: usize = 100;

const ZIP_MAGIC: &[u8] = &[0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDocx {
    #[error("payload is {0} bytes, below the 100 byte minimum")]
    TooSmall(usize),
    #[error("payload does not start with the ZIP local-file-header magic")]
    WrongMagic,
    #[error("ZIP payload has no [Content_Types].xml entry")]
    MissingContentTypes,
    #[error("ZIP payload has no word/document entry")]
    MissingWordDocument,
}

/// Checks run in order; the first failure wins.
pub fn validate_docx(payload: &[u8]) -> Result<(), InvalidDocx> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(InvalidDocx::TooSmall(payload.len()));
    }
    if !payload.starts_with(ZIP_MAGIC) {
        return Err(InvalidDocx::WrongMagic);
    }
    if memmem::find(payload, b"[Content_Types].xml").is_none() {
        return Err(InvalidDocx::MissingContentTypes);
    }
    if memmem::find(payload, b"word/document.xml").is_none()
        && memmem::find(payload, b"word/document").is_none()
    {
        return Err(InvalidDocx::MissingWordDocument);
    }
    Ok(())
}

/// SHA-256 of a payload as 64 lowercase hex characters; document identity
/// everywhere in the system.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
pub mod test {
    use super::*;

    /// Smallest payload that passes every check; reused by the pipeline
    /// tests.
    pub fn minimal_docx() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(ZIP_MAGIC);
        payload.extend_from_slice(b"[Content_Types].xml");
        payload.extend_from_slice(b"word/document.xml");
        payload.resize(MIN_PAYLOAD_LEN, b'\0');
        payload
    }

    #[test]
    fn accepts_a_minimal_document() {
        assert_eq!(validate_docx(&minimal_docx()), Ok(()));
    }

    #[test]
    fn size_boundary_is_exactly_100_bytes() {
        let mut payload = minimal_docx();
        payload.truncate(99);
        assert_eq!(validate_docx(&payload), Err(InvalidDocx::TooSmall(99)));

        let payload = minimal_docx();
        assert_eq!(payload.len(), 100);
        assert_eq!(validate_docx(&payload), Ok(()));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut payload = minimal_docx();
        payload[0] = b'X';
        assert_eq!(validate_docx(&payload), Err(InvalidDocx::WrongMagic));
    }

    #[test]
    fn rejects_missing_content_types() {
        let mut payload = Vec::new();
        payload.extend_from_slice(ZIP_MAGIC);
        payload.extend_from_slice(b"word/document.xml");
        payload.resize(MIN_PAYLOAD_LEN, b'\0');
        assert_eq!(validate_docx(&payload), Err(InvalidDocx::MissingContentTypes));
    }

    #[test]
    fn rejects_missing_word_document() {
        let mut payload = Vec::new();
        payload.extend_from_slice(ZIP_MAGIC);
        payload.extend_from_slice(b"[Content_Types].xml");
        payload.resize(MIN_PAYLOAD_LEN, b'\0');
        let err = validate_docx(&payload).unwrap_err();
        assert_eq!(err, InvalidDocx::MissingWordDocument);
        assert!(err.to_string().contains("word/document"));
    }

    #[test]
    fn word_document_prefix_is_enough() {
        let mut payload = Vec::new();
        payload.extend_from_slice(ZIP_MAGIC);
        payload.extend_from_slice(b"[Content_Types].xml");
        payload.extend_from_slice(b"word/document2.xml");
        payload.resize(MIN_PAYLOAD_LEN, b'\0');
        assert_eq!(validate_docx(&payload), Ok(()));
    }

    #[test]
    fn hash_is_deterministic_lowercase_hex() {
        let digest = sha256_hex(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest, sha256_hex(b"abc"));
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
