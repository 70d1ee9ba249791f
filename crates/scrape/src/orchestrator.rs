//! The bounded worker pool and per-record state machine at the heart of
//! the pipeline. A record either becomes an uploaded content-addressed
//! blob plus a metadata row, a failed row, or a skip; no failure of a
//! single record ever aborts the batch.

use crate::progress::{CounterSnapshot, Counters, ProgressSink};
use crate::validate::{sha256_hex, validate_docx};
use cdx::{CdxRecord, CdxStream};
use chrono::Utc;
use percent_encoding::percent_decode_str;
use std::collections::HashSet;
use std::sync::Arc;
use stores::{keys, BlobStore, DocStatus, DocumentPatch, MetaStore};
use warc::{FetchOptions, Fetcher, RateLimiter, RateLimiterConfig, RateLimiterStats};

pub const DEFAULT_FILENAME: &str = "unknown.docx";

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub crawl_id: String,
    pub concurrency: usize,
    /// Stop submitting new records once this many were saved.
    pub batch_size: u64,
    /// Start with an empty in-memory URL set and reprocess everything.
    pub force: bool,
    pub limiter: RateLimiterConfig,
    pub fetch: FetchOptions,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeOutcome {
    pub counters: CounterSnapshot,
    pub limiter: RateLimiterStats,
}

struct Ctx {
    cfg: ScrapeConfig,
    blob: Arc<dyn BlobStore>,
    meta: MetaStore,
    fetcher: Fetcher,
    limiter: Arc<RateLimiter>,
    uploaded_urls: HashSet<String>,
    counters: Counters,
    progress: Arc<dyn ProgressSink>,
    gate: tokio::sync::Semaphore,
}

/// Run one crawl to completion (or to `batch_size` saves). The rate
/// limiter lives for exactly this crawl.
pub async fn run_crawl(
    cfg: ScrapeConfig,
    blob: Arc<dyn BlobStore>,
    meta: MetaStore,
    progress: Arc<dyn ProgressSink>,
) -> anyhow::Result<ScrapeOutcome> {
    let limiter = Arc::new(RateLimiter::new(cfg.limiter.clone()));
    let fetcher = Fetcher::new(limiter.clone(), cfg.fetch.clone())?;

    let uploaded_urls = if cfg.force {
        HashSet::new()
    } else {
        meta.uploaded_url_set().await?
    };
    tracing::info!(
        crawl_id = %cfg.crawl_id,
        known_urls = uploaded_urls.len(),
        concurrency = cfg.concurrency,
        "starting crawl"
    );

    let mut stream = CdxStream::open(blob.clone(), &cfg.crawl_id).await?;

    let concurrency = cfg.concurrency.max(1);
    let ctx = Arc::new(Ctx {
        cfg,
        blob,
        meta,
        fetcher,
        limiter,
        uploaded_urls,
        counters: Counters::default(),
        progress,
        gate: tokio::sync::Semaphore::new(concurrency),
    });

    // In-flight tasks are capped at twice the worker count: enough to keep
    // the pool busy while the stream is pulled, small enough that no
    // record backlog builds up ahead of it.
    let inflight_cap = concurrency * 2;
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        if ctx.counters.saved() >= ctx.cfg.batch_size {
            break;
        }
        // The stream is pull-based: a record is only taken once there is
        // room to submit it, so nothing buffers ahead of the pool.
        while tasks.len() >= inflight_cap {
            reap(&ctx, tasks.join_next().await);
        }
        if ctx.counters.saved() >= ctx.cfg.batch_size {
            break;
        }

        let record = match stream.next().await? {
            Some(record) => record,
            None => break,
        };
        ctx.counters.incr_discovered();

        if ctx.uploaded_urls.contains(&record.url) {
            ctx.counters.incr_skipped();
            ctx.progress.update(ctx.counters.snapshot());
            continue;
        }

        let task_ctx = ctx.clone();
        tasks.spawn(async move {
            let _permit = match task_ctx.gate.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            process_record(&task_ctx, record).await;
            task_ctx.progress.update(task_ctx.counters.snapshot());
        });
    }

    while let Some(joined) = tasks.join_next().await {
        reap(&ctx, Some(joined));
    }

    let outcome = ScrapeOutcome {
        counters: ctx.counters.snapshot(),
        limiter: ctx.limiter.stats(),
    };
    ctx.progress.finish(outcome.counters);
    tracing::info!(
        crawl_id = %ctx.cfg.crawl_id,
        saved = outcome.counters.saved,
        skipped = outcome.counters.skipped,
        failed = outcome.counters.failed,
        discovered = outcome.counters.discovered,
        rps = outcome.limiter.current_rps,
        "crawl complete"
    );
    Ok(outcome)
}

fn reap(ctx: &Ctx, joined: Option<Result<(), tokio::task::JoinError>>) {
    if let Some(Err(err)) = joined {
        tracing::error!(error = %err, "scrape worker aborted");
        ctx.counters.incr_failed();
    }
}

/// One record through the state machine. Every failure ends in a row
/// update or a counter, never an escaping error.
async fn process_record(ctx: &Ctx, record: CdxRecord) {
    let now = Utc::now();

    let fetched = match ctx.fetcher.fetch(&record).await {
        Ok(fetched) => fetched,
        Err(err) => {
            tracing::debug!(url = %record.url, error = %err, "fetch failed");
            // No payload, so no content hash: key the row by the URL so a
            // later successful fetch of the same URL cannot collide.
            let id = format!("failed-{}", sha256_hex(record.url.as_bytes()));
            let patch = DocumentPatch {
                source_url: Some(record.url.clone()),
                crawl_id: Some(ctx.cfg.crawl_id.clone()),
                original_filename: Some(original_filename(&record.url)),
                status: Some(DocStatus::Failed),
                error_message: Some(err.to_string()),
                discovered_at: Some(now),
                ..Default::default()
            };
            record_failure(ctx, &id, patch).await;
            return;
        }
    };

    let payload = fetched.record.body;

    if let Err(reason) = validate_docx(&payload) {
        tracing::debug!(url = %record.url, reason = %reason, "payload rejected");
        let patch = DocumentPatch {
            source_url: Some(record.url.clone()),
            crawl_id: Some(ctx.cfg.crawl_id.clone()),
            original_filename: Some(original_filename(&record.url)),
            file_size_bytes: Some(payload.len() as i64),
            status: Some(DocStatus::Failed),
            error_message: Some(reason.to_string()),
            is_valid_docx: Some(false),
            discovered_at: Some(now),
            downloaded_at: Some(now),
            ..Default::default()
        };
        record_failure(ctx, &sha256_hex(&payload), patch).await;
        return;
    }

    let hash = sha256_hex(&payload);

    // Another worker of this crawl may have uploaded the same content
    // moments ago; the pre-loaded URL set cannot see that.
    match ctx.meta.get(&hash).await {
        Ok(Some(row)) if row.status == DocStatus::Uploaded => {
            ctx.counters.incr_skipped();
            return;
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(id = %hash, error = %err, "dedup lookup failed; continuing");
        }
    }

    let key = keys::document(keys::DOCUMENTS_PREFIX, &hash);
    let wrote = match ctx.blob.write_if_absent(&key, &payload).await {
        Ok(wrote) => wrote,
        Err(err) => {
            tracing::error!(key = %key, error = %err, "blob write failed");
            ctx.counters.incr_failed();
            return;
        }
    };

    if !wrote {
        match ctx.meta.get(&hash).await {
            Ok(Some(row)) if row.status == DocStatus::Uploaded => {
                ctx.counters.incr_skipped();
                return;
            }
            // The blob exists but its row is missing: another writer died
            // mid-sequence. The blob is authoritative, so upsert anyway.
            _ => {}
        }
    }

    let patch = DocumentPatch {
        source_url: Some(record.url.clone()),
        crawl_id: Some(ctx.cfg.crawl_id.clone()),
        original_filename: Some(original_filename(&record.url)),
        file_size_bytes: Some(payload.len() as i64),
        status: Some(DocStatus::Uploaded),
        is_valid_docx: Some(true),
        discovered_at: Some(now),
        downloaded_at: Some(now),
        uploaded_at: Some(Utc::now()),
        ..Default::default()
    };
    if let Err(err) = ctx.meta.upsert(&hash, patch).await {
        tracing::error!(id = %hash, error = %err, "row upsert failed");
        ctx.counters.incr_failed();
        return;
    }

    if wrote {
        ctx.counters.incr_saved();
    } else {
        ctx.counters.incr_skipped();
    }
}

async fn record_failure(ctx: &Ctx, id: &str, patch: DocumentPatch) {
    if let Err(err) = ctx.meta.upsert(id, patch).await {
        tracing::error!(id, error = %err, "failed-row upsert failed");
    }
    ctx.counters.incr_failed();
}

/// Last path segment of the source URL, percent-decoded; `unknown.docx`
/// when the URL has no usable name.
pub fn original_filename(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    let segment = path.rsplit('/').next().unwrap_or("");
    let decoded = percent_decode_str(segment).decode_utf8_lossy().to_string();
    if decoded.trim().is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        decoded
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filename_from_url_path() {
        assert_eq!(
            original_filename("https://example.com/files/Annual%20Report.docx?dl=1"),
            "Annual Report.docx"
        );
        assert_eq!(
            original_filename("https://example.com/files/plain.docx"),
            "plain.docx"
        );
    }

    #[test]
    fn filename_defaults_when_absent() {
        assert_eq!(original_filename("https://example.com/"), DEFAULT_FILENAME);
        assert_eq!(original_filename("https://example.com"), DEFAULT_FILENAME);
        assert_eq!(original_filename("not a url at all"), "not a url at all");
        assert_eq!(original_filename("https://example.com/%20%20"), DEFAULT_FILENAME);
    }
}
