//! Ranged fetch of a single archive record: one byte range out of a large
//! gzipped container, decompressed and unframed into the stored HTTP
//! response.

use crate::limiter::RateLimiter;
use crate::record::{parse_archive_record, ArchiveRecord, RecordError};
use cdx::CdxRecord;
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://data.commoncrawl.org";

/// Stable across the whole fleet so upstream sees one well-behaved client.
pub const USER_AGENT: &str = "docx-corpus/0.1 (+https://github.com/docx-corpus/docx-corpus)";

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub base_url: String,
    /// Hard deadline for one attempt, connection included.
    pub timeout: Duration,
    /// Total attempts for throttle/timeout/network failures.
    pub max_retries: u32,
    /// Ceiling for the exponential retry wait.
    pub max_backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(45),
            max_retries: 3,
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("rate limited by upstream (HTTP {status}) after {attempts} attempts")]
    RateLimited { status: u16, attempts: u32 },
    #[error("upstream returned HTTP {status}")]
    Http { status: u16 },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error talking to the archive")]
    Network(#[source] reqwest::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("index record carries an unusable byte range {offset:?}+{length:?}")]
    InvalidRange { offset: String, length: String },
    #[error("failed to construct HTTP client")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug)]
pub struct Fetched {
    /// The stored HTTP interaction; `record.body` is the candidate payload.
    pub record: ArchiveRecord,
    /// Size of the range as served, before decompression.
    pub fetched_bytes: usize,
}

pub struct Fetcher {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    opts: FetchOptions,
}

enum AttemptError {
    Status(u16),
    Timeout,
    Network(reqwest::Error),
}

impl Fetcher {
    pub fn new(limiter: Arc<RateLimiter>, opts: FetchOptions) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            http,
            limiter,
            opts,
        })
    }

    /// Fetch and unframe one record. Every attempt first clears the rate
    /// limiter; throttle statuses, timeouts, and network errors are retried
    /// on a `2^attempt`-seconds schedule, other HTTP errors fail fast.
    pub async fn fetch(&self, record: &CdxRecord) -> Result<Fetched, FetchError> {
        let offset = record
            .offset_bytes()
            .ok_or_else(|| invalid_range(record))?;
        let length = record
            .length_bytes()
            .filter(|l| *l > 0)
            .ok_or_else(|| invalid_range(record))?;

        let url = format!(
            "{}/{}",
            self.opts.base_url.trim_end_matches('/'),
            record.filename
        );
        let range = format!("bytes={}-{}", offset, offset + length - 1);

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;
            let outcome = self.attempt(&url, &range).await;
            attempt += 1;

            let err = match outcome {
                Ok(raw) => {
                    let decompressed = gunzip_or_passthrough(&raw);
                    let parsed = parse_archive_record(&decompressed)?;
                    self.limiter.report_success();
                    tracing::debug!(
                        url = %record.url,
                        stored_status = parsed.http_status,
                        bytes = raw.len(),
                        "fetched archive record"
                    );
                    return Ok(Fetched {
                        record: parsed,
                        fetched_bytes: raw.len(),
                    });
                }
                Err(err) => err,
            };

            match err {
                AttemptError::Status(status @ (403 | 429 | 503)) => {
                    self.limiter.report_error(status);
                    if attempt >= self.opts.max_retries {
                        return Err(FetchError::RateLimited { status, attempts: attempt });
                    }
                }
                AttemptError::Status(status) => {
                    self.limiter.report_error(status);
                    return Err(FetchError::Http { status });
                }
                AttemptError::Timeout => {
                    self.limiter.report_error(0);
                    if attempt >= self.opts.max_retries {
                        return Err(FetchError::Timeout(self.opts.timeout));
                    }
                }
                AttemptError::Network(source) => {
                    self.limiter.report_error(0);
                    if attempt >= self.opts.max_retries {
                        return Err(FetchError::Network(source));
                    }
                }
            }

            let backoff = Duration::from_secs(1u64 << attempt.min(16)).min(self.opts.max_backoff);
            tracing::debug!(url = %record.url, attempt, backoff = ?backoff, "retrying fetch");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn attempt(&self, url: &str, range: &str) -> Result<Vec<u8>, AttemptError> {
        let request = async {
            let resp = self
                .http
                .get(url)
                .header(reqwest::header::RANGE, range)
                .send()
                .await
                .map_err(AttemptError::Network)?;
            let status = resp.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(AttemptError::Status(status));
            }
            let body = resp.bytes().await.map_err(AttemptError::Network)?;
            Ok(body.to_vec())
        };
        match tokio::time::timeout(self.opts.timeout, request).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AttemptError::Timeout),
        }
    }
}

fn invalid_range(record: &CdxRecord) -> FetchError {
    FetchError::InvalidRange {
        offset: record.offset.clone(),
        length: record.length.clone(),
    }
}

/// Ranges are usually one gzip member; some upstream writers store them
/// raw. Decompression failure means the bytes were already decompressed.
fn gunzip_or_passthrough(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = GzDecoder::new(bytes);
    if decoder.header().is_none() {
        return bytes.to_vec();
    }
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => bytes.to_vec(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::limiter::RateLimiterConfig;
    use crate::record::encode_archive_record;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::VecDeque;
    use std::io::Write as _;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    /// Minimal scripted origin: pops one canned (status, body) response per
    /// request, across any number of connections.
    async fn scripted_origin(responses: Vec<(u16, Vec<u8>)>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queue = Arc::new(Mutex::new(VecDeque::from(responses)));
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let queue = queue.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = socket.split();
                    let mut reader = BufReader::new(read_half);
                    loop {
                        let mut line = String::new();
                        loop {
                            line.clear();
                            match reader.read_line(&mut line).await {
                                Ok(0) | Err(_) => return,
                                Ok(_) if line == "\r\n" => break,
                                Ok(_) => {}
                            }
                        }
                        let next = queue.lock().unwrap().pop_front();
                        let (status, body) = match next {
                            Some(resp) => resp,
                            None => return,
                        };
                        let head = format!(
                            "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
                            body.len()
                        );
                        if write_half.write_all(head.as_bytes()).await.is_err() {
                            return;
                        }
                        if write_half.write_all(&body).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn test_record(length: usize) -> CdxRecord {
        CdxRecord {
            url: "https://example.com/doc.docx".to_string(),
            mime: cdx::WORD_MIME.to_string(),
            status: "200".to_string(),
            digest: "D".to_string(),
            length: length.to_string(),
            offset: "0".to_string(),
            filename: "crawl-data/CC-TEST/part-00000.warc.gz".to_string(),
        }
    }

    fn fetcher(addr: std::net::SocketAddr, max_retries: u32) -> (Fetcher, Arc<RateLimiter>) {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            initial_rps: 1000.0,
            min_rps: 1.0,
            max_rps: 1000.0,
            ..Default::default()
        }));
        let opts = FetchOptions {
            base_url: format!("http://{addr}"),
            timeout: Duration::from_secs(5),
            max_retries,
            max_backoff: Duration::from_millis(10),
        };
        (Fetcher::new(limiter.clone(), opts).unwrap(), limiter)
    }

    #[tokio::test]
    async fn fetches_and_unframes_a_gzipped_record() {
        let payload = b"PK\x03\x04 fake docx".to_vec();
        let stored = encode_archive_record(200, Some("application/msword"), &payload);
        let addr = scripted_origin(vec![(206, gzip(&stored))]).await;
        let (fetcher, limiter) = fetcher(addr, 3);

        let fetched = fetcher.fetch(&test_record(stored.len())).await.unwrap();
        assert_eq!(fetched.record.http_status, 200);
        assert_eq!(
            fetched.record.content_type.as_deref(),
            Some("application/msword")
        );
        assert_eq!(fetched.record.body, payload);
        assert_eq!(limiter.stats().success_count, 1);
        assert_eq!(limiter.stats().error_count, 0);
    }

    #[tokio::test]
    async fn passes_through_uncompressed_ranges() {
        let stored = encode_archive_record(200, None, b"raw body");
        let addr = scripted_origin(vec![(206, stored.clone())]).await;
        let (fetcher, _limiter) = fetcher(addr, 3);

        let fetched = fetcher.fetch(&test_record(stored.len())).await.unwrap();
        assert_eq!(fetched.record.body, b"raw body");
    }

    #[tokio::test]
    async fn retries_503_then_succeeds() {
        let stored = encode_archive_record(200, None, b"eventually");
        let addr = scripted_origin(vec![
            (503, Vec::new()),
            (503, Vec::new()),
            (206, gzip(&stored)),
        ])
        .await;
        let (fetcher, limiter) = fetcher(addr, 3);

        let fetched = fetcher.fetch(&test_record(stored.len())).await.unwrap();
        assert_eq!(fetched.record.body, b"eventually");

        let stats = limiter.stats();
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.backoff_count, 2);
        assert_eq!(stats.success_count, 1);
        assert!(stats.current_rps < 1000.0);
    }

    #[tokio::test]
    async fn rate_limit_errors_exhaust_the_budget() {
        let addr = scripted_origin(vec![
            (429, Vec::new()),
            (429, Vec::new()),
            (429, Vec::new()),
        ])
        .await;
        let (fetcher, limiter) = fetcher(addr, 3);

        let err = fetcher.fetch(&test_record(64)).await.unwrap_err();
        match err {
            FetchError::RateLimited { status, attempts } => {
                assert_eq!(status, 429);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(limiter.stats().error_count, 3);
    }

    #[tokio::test]
    async fn other_http_errors_fail_fast() {
        let addr = scripted_origin(vec![(404, Vec::new()), (206, Vec::new())]).await;
        let (fetcher, limiter) = fetcher(addr, 3);

        let err = fetcher.fetch(&test_record(64)).await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status: 404 }));
        // Only one request went out; no retry consumed the second response.
        assert_eq!(limiter.stats().error_count, 1);
        assert_eq!(limiter.stats().backoff_count, 0);
    }

    #[tokio::test]
    async fn garbage_ranges_are_parse_errors() {
        let addr = scripted_origin(vec![(206, b"no separators here".to_vec())]).await;
        let (fetcher, _limiter) = fetcher(addr, 3);

        let err = fetcher.fetch(&test_record(18)).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Record(RecordError::MissingArchiveSeparator)
        ));
    }

    #[tokio::test]
    async fn unparsable_offsets_are_rejected_before_any_request() {
        let (fetcher, limiter) = fetcher("127.0.0.1:9".parse().unwrap(), 3);
        let mut record = test_record(10);
        record.offset = "not-a-number".to_string();

        let err = fetcher.fetch(&record).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRange { .. }));
        assert_eq!(limiter.stats().error_count, 0);
    }
}
