//! Text extraction over the uploaded corpus, driven through a pool of
//! long-lived extractor subprocesses. Each worker owns one subprocess for
//! the pool's lifetime; a per-document deadline and a global stall
//! watchdog recover from hung extractions by killing and respawning.

mod process;
mod worker;

pub use process::KillHandle;
pub use worker::{ExtractError, ExtractResponse, ExtractorProcess};

use anyhow::Context as _;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stores::{keys, BlobStore, DocumentRow, ExtractionCounts, MetaStore};

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Extractor command line, program first.
    pub command: Vec<String>,
    pub workers: usize,
    /// Maximum number of documents claimed for this run.
    pub batch_size: i64,
    /// Blob prefix the payloads are read from.
    pub input_prefix: String,
    /// Blob prefix the extracted text/metadata is written to.
    pub output_prefix: String,
    /// Deadline for one whole document: download, extract, store, upsert.
    pub doc_timeout: Duration,
    /// Deadline for spawn plus the readiness handshake.
    pub startup_timeout: Duration,
    pub stall_check_interval: Duration,
    /// Restart every subprocess when the processed count has not moved for
    /// this long and work remains.
    pub stall_after: Duration,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            workers: 2,
            batch_size: 100,
            input_prefix: keys::DOCUMENTS_PREFIX.to_string(),
            output_prefix: keys::EXTRACTED_PREFIX.to_string(),
            doc_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(120),
            stall_check_interval: Duration::from_secs(10),
            stall_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub processed: u64,
    pub extracted: u64,
    pub failed: u64,
}

struct PoolCtx {
    cfg: ExtractConfig,
    blob: Arc<dyn BlobStore>,
    meta: MetaStore,
    queue: Mutex<VecDeque<DocumentRow>>,
    processed: AtomicU64,
    extracted: AtomicU64,
    failed: AtomicU64,
    total: u64,
    kill_slots: Vec<Mutex<Option<KillHandle>>>,
}

impl PoolCtx {
    fn set_kill_handle(&self, idx: usize, handle: KillHandle) {
        *self.kill_slots[idx].lock().unwrap() = Some(handle);
    }
}

/// Claim up to `batch_size` unextracted documents and run them through the
/// subprocess pool. Returns once the queue is drained; all subprocesses
/// and temp files are gone by then.
pub async fn run_extraction(
    cfg: ExtractConfig,
    blob: Arc<dyn BlobStore>,
    meta: MetaStore,
) -> anyhow::Result<ExtractOutcome> {
    let docs = meta.get_unextracted(cfg.batch_size).await?;
    let total = docs.len();
    if total == 0 {
        tracing::info!("nothing to extract");
        return Ok(ExtractOutcome::default());
    }
    let workers = cfg.workers.max(1).min(total);
    tracing::info!(total, workers, "starting extraction");

    let scratch = tempfile::tempdir().context("failed to create scratch directory")?;
    let ctx = Arc::new(PoolCtx {
        cfg,
        blob,
        meta,
        queue: Mutex::new(docs.into()),
        processed: AtomicU64::new(0),
        extracted: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        total: total as u64,
        kill_slots: (0..workers).map(|_| Mutex::new(None)).collect(),
    });

    let watchdog = tokio::spawn(stall_watchdog(ctx.clone()));

    let mut tasks = tokio::task::JoinSet::new();
    for idx in 0..workers {
        let ctx = ctx.clone();
        let dir = scratch.path().join(format!("worker-{idx}"));
        tasks.spawn(async move { run_worker(idx, ctx, dir).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "extract worker failed");
                first_error.get_or_insert(err);
            }
            Err(err) => tracing::error!(error = %err, "extract worker aborted"),
        }
    }
    watchdog.abort();

    if let Some(err) = first_error {
        return Err(err);
    }
    let outcome = ExtractOutcome {
        processed: ctx.processed.load(Ordering::Relaxed),
        extracted: ctx.extracted.load(Ordering::Relaxed),
        failed: ctx.failed.load(Ordering::Relaxed),
    };
    tracing::info!(
        processed = outcome.processed,
        extracted = outcome.extracted,
        failed = outcome.failed,
        "extraction complete"
    );
    Ok(outcome)
}

async fn run_worker(idx: usize, ctx: Arc<PoolCtx>, scratch: PathBuf) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&scratch)
        .await
        .with_context(|| format!("worker {idx}: failed to create scratch dir"))?;

    // Failing the very first spawn is a configuration problem and aborts
    // the run; respawn failures later on surface per document instead.
    let mut process = ExtractorProcess::spawn(&ctx.cfg.command, ctx.cfg.startup_timeout)
        .await
        .with_context(|| format!("worker {idx}: failed to start extractor"))?;
    ctx.set_kill_handle(idx, process.kill_handle());

    loop {
        let doc = ctx.queue.lock().unwrap().pop_front();
        let doc = match doc {
            Some(doc) => doc,
            None => break,
        };
        let temp = scratch.join(format!("{}.docx", doc.id));

        let outcome =
            tokio::time::timeout(ctx.cfg.doc_timeout, process_doc(&ctx, &mut process, &doc, &temp))
                .await;
        ctx.processed.fetch_add(1, Ordering::Relaxed);

        let respawn = match outcome {
            Ok(Ok(true)) => {
                ctx.extracted.fetch_add(1, Ordering::Relaxed);
                false
            }
            Ok(Ok(false)) => {
                ctx.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
            Ok(Err(err)) => {
                tracing::warn!(id = %doc.id, error = %err, "extraction failed");
                ctx.failed.fetch_add(1, Ordering::Relaxed);
                record_error(&ctx, &doc.id, &err.to_string()).await;
                // Subprocess trouble (including a watchdog kill mid-read)
                // invalidates the process; store trouble does not.
                matches!(err, DocError::Process(_))
            }
            Err(_elapsed) => {
                let seconds = ctx.cfg.doc_timeout.as_secs();
                tracing::warn!(id = %doc.id, seconds, "extraction timed out");
                ctx.failed.fetch_add(1, Ordering::Relaxed);
                record_error(
                    &ctx,
                    &doc.id,
                    &format!("extraction timed out after {seconds}s"),
                )
                .await;
                true
            }
        };
        let _ = tokio::fs::remove_file(&temp).await;

        if respawn {
            // Kill the old process with its handle and warm up a fresh one
            // before taking the next document.
            drop(process);
            process = match ExtractorProcess::spawn(&ctx.cfg.command, ctx.cfg.startup_timeout)
                .await
            {
                Ok(process) => process,
                Err(err) => {
                    tracing::error!(worker = idx, error = %err, "extractor respawn failed");
                    return Ok(());
                }
            };
            ctx.set_kill_handle(idx, process.kill_handle());
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum DocError {
    #[error("payload blob is missing")]
    MissingPayload,
    #[error("blob store failure")]
    Blob(#[source] stores::BlobError),
    #[error("failed to stage temp file")]
    Temp(#[source] std::io::Error),
    #[error(transparent)]
    Process(#[from] ExtractError),
    #[error("failed to encode structured output")]
    Encode(#[source] serde_json::Error),
    #[error("metadata update failed")]
    Meta(#[source] stores::meta::MetaError),
}

/// The whole per-document pipeline: stage the payload to a temp file, one
/// protocol exchange, store outputs, record metadata. Runs entirely under
/// the caller's deadline. Ok(false) means the extractor itself rejected
/// the document and the rejection was recorded.
async fn process_doc(
    ctx: &PoolCtx,
    process: &mut ExtractorProcess,
    doc: &DocumentRow,
    temp: &Path,
) -> Result<bool, DocError> {
    let key = keys::document(&ctx.cfg.input_prefix, &doc.id);
    let payload = ctx
        .blob
        .read(&key)
        .await
        .map_err(DocError::Blob)?
        .ok_or(DocError::MissingPayload)?;
    tokio::fs::write(temp, &payload)
        .await
        .map_err(DocError::Temp)?;

    let response = process.extract(temp).await?;

    if !response.success {
        let message = response
            .error
            .unwrap_or_else(|| "unknown extraction failure".to_string());
        ctx.meta
            .update_extraction_error(&doc.id, &message)
            .await
            .map_err(DocError::Meta)?;
        return Ok(false);
    }

    let text = response.text.as_deref().unwrap_or_default();
    ctx.blob
        .write(
            &keys::extracted_text(&ctx.cfg.output_prefix, &doc.id),
            text.as_bytes(),
        )
        .await
        .map_err(DocError::Blob)?;

    let structured = response
        .extraction
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    let structured_bytes = serde_json::to_vec(&structured).map_err(DocError::Encode)?;
    ctx.blob
        .write(
            &keys::extracted_meta(&ctx.cfg.output_prefix, &doc.id),
            &structured_bytes,
        )
        .await
        .map_err(DocError::Blob)?;

    ctx.meta
        .update_extraction(
            &doc.id,
            ExtractionCounts {
                word_count: response.word_count.unwrap_or(0),
                char_count: response.char_count.unwrap_or(0),
                table_count: response.table_count.unwrap_or(0),
                image_count: response.image_count.unwrap_or(0),
            },
        )
        .await
        .map_err(DocError::Meta)?;
    Ok(true)
}

async fn record_error(ctx: &PoolCtx, id: &str, message: &str) {
    if let Err(err) = ctx.meta.update_extraction_error(id, message).await {
        tracing::error!(id, error = %err, "failed to record extraction error");
    }
}

/// Kill every subprocess when the overall processed count sits still for
/// `stall_after` while work remains. Workers observe the dead process on
/// their next exchange and respawn; kill failures are swallowed.
async fn stall_watchdog(ctx: Arc<PoolCtx>) {
    let mut ticker = tokio::time::interval(ctx.cfg.stall_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_count = 0u64;
    let mut last_progress = tokio::time::Instant::now();

    loop {
        ticker.tick().await;
        let processed = ctx.processed.load(Ordering::Relaxed);
        if processed != last_count {
            last_count = processed;
            last_progress = tokio::time::Instant::now();
            continue;
        }
        if processed >= ctx.total {
            return;
        }
        if last_progress.elapsed() >= ctx.cfg.stall_after {
            tracing::warn!(processed, "no extraction progress; restarting all extractors");
            for slot in &ctx.kill_slots {
                if let Some(handle) = slot.lock().unwrap().as_ref() {
                    handle.kill();
                }
            }
            last_progress = tokio::time::Instant::now();
        }
    }
}
