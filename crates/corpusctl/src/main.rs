mod config;
mod logging;

use anyhow::Context as _;
use clap::Parser;
use config::StoreArgs;
use scrape::{ConsoleProgress, NullProgress, ProgressSink, ScrapeConfig};
use std::sync::Arc;
use std::time::Duration;
use warc::{FetchOptions, RateLimiterConfig};

/// corpusctl assembles a deduplicated, content-addressed corpus of Word
/// documents harvested from the Common Crawl web archive.
#[derive(Debug, Parser)]
#[clap(author, name = "corpusctl", version)]
struct Corpusctl {
    #[clap(flatten)]
    log: logging::LogArgs,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Subcommand {
    /// Discover and download new documents for one or more crawls
    Scrape(ScrapeArgs),
    /// Run text extraction over uploaded documents
    Extract(ExtractArgs),
    /// Write the sorted manifest of uploaded document ids
    Manifest(ManifestArgs),
    /// Show corpus and extraction statistics
    Status(StatusArgs),
}

#[derive(Debug, clap::Args)]
struct ScrapeArgs {
    /// Crawl ids to process (repeat or comma separate). Empty resolves
    /// the newest crawls from the public crawl list
    #[clap(long = "crawl-id", env = "CRAWL_ID", value_delimiter = ',')]
    crawl_ids: Vec<String>,

    /// How many of the newest crawls to process when none are named
    #[clap(long, default_value_t = 1)]
    latest_n: usize,

    /// Parallel download workers (clamped to 1..=50)
    #[clap(long, env = "CONCURRENCY", default_value_t = 20)]
    concurrency: usize,

    /// Stop a crawl after this many new uploads
    #[clap(long, env = "BATCH_SIZE", default_value_t = 1000)]
    batch_size: u64,

    #[clap(long, env = "RATE_LIMIT_RPS", default_value_t = 5.0)]
    rate_limit_rps: f64,

    #[clap(long, env = "MIN_RPS", default_value_t = 0.5)]
    min_rps: f64,

    #[clap(long, env = "MAX_RPS", default_value_t = 20.0)]
    max_rps: f64,

    #[clap(long, env = "TIMEOUT_MS", default_value_t = 45_000)]
    timeout_ms: u64,

    /// Attempts per record for throttled or flaky fetches (clamped to
    /// 3..=10)
    #[clap(long, env = "MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    #[clap(long, env = "MAX_BACKOFF_MS", default_value_t = 60_000)]
    max_backoff_ms: u64,

    /// Reprocess every record even if its URL was already uploaded
    #[clap(long)]
    force: bool,

    /// Archive data endpoint
    #[clap(long, env = "ARCHIVE_BASE_URL", default_value = warc::DEFAULT_BASE_URL)]
    base_url: String,

    /// Crawl-list endpoint
    #[clap(long, default_value = scrape::CRAWL_LIST_URL)]
    crawl_list_url: String,

    #[clap(flatten)]
    store: StoreArgs,
}

#[derive(Debug, clap::Args)]
struct ExtractArgs {
    /// Extractor command line; the program is spawned once per worker and
    /// fed file paths over stdin
    #[clap(long, env = "EXTRACT_COMMAND", default_value = "python3 extract_worker.py")]
    extract_command: String,

    #[clap(long, env = "EXTRACT_WORKERS", default_value_t = 2)]
    workers: usize,

    #[clap(long, env = "EXTRACT_BATCH_SIZE", default_value_t = 100)]
    batch_size: i64,

    #[clap(long, env = "EXTRACT_INPUT_PREFIX", default_value = "documents")]
    input_prefix: String,

    #[clap(long, env = "EXTRACT_OUTPUT_PREFIX", default_value = "extracted")]
    output_prefix: String,

    /// Per-document deadline covering download, extraction, and stores
    #[clap(long, env = "EXTRACT_TIMEOUT_MS", default_value_t = 30_000)]
    doc_timeout_ms: u64,

    #[clap(flatten)]
    store: StoreArgs,
}

#[derive(Debug, clap::Args)]
struct ManifestArgs {
    #[clap(flatten)]
    store: StoreArgs,
}

#[derive(Debug, clap::Args)]
struct StatusArgs {
    #[clap(flatten)]
    store: StoreArgs,
}

fn main() {
    let cli = Corpusctl::parse();
    logging::init_logging(&cli.log);

    if let Err(err) = run_blocking(cli.subcommand) {
        tracing::error!(error = ?err, "fatal");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run_blocking(subcommand: Subcommand) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async move {
        match subcommand {
            Subcommand::Scrape(args) => run_scrape(args).await,
            Subcommand::Extract(args) => run_extract(args).await,
            Subcommand::Manifest(args) => run_manifest(args).await,
            Subcommand::Status(args) => run_status(args).await,
        }
    })
}

async fn run_scrape(args: ScrapeArgs) -> anyhow::Result<()> {
    let concurrency = args.concurrency.clamp(1, 50);
    let max_retries = args.max_retries.clamp(3, 10);

    let http = reqwest::Client::builder()
        .user_agent(warc::USER_AGENT)
        .build()
        .context("failed to construct HTTP client")?;
    let crawl_ids =
        scrape::resolve_crawl_ids(&args.crawl_ids, args.latest_n, &http, &args.crawl_list_url)
            .await
            .context("failed to resolve crawl ids")?;

    let blob = args.store.open_blob().await?;
    let meta = args.store.open_meta().await?;

    for crawl_id in crawl_ids {
        let cfg = ScrapeConfig {
            crawl_id: crawl_id.clone(),
            concurrency,
            batch_size: args.batch_size,
            force: args.force,
            limiter: RateLimiterConfig {
                initial_rps: args.rate_limit_rps,
                min_rps: args.min_rps,
                max_rps: args.max_rps,
                ..Default::default()
            },
            fetch: FetchOptions {
                base_url: args.base_url.clone(),
                timeout: Duration::from_millis(args.timeout_ms),
                max_retries,
                max_backoff: Duration::from_millis(args.max_backoff_ms),
            },
        };
        let progress: Arc<dyn ProgressSink> = if atty::is(atty::Stream::Stderr) {
            Arc::new(ConsoleProgress::new(&crawl_id))
        } else {
            Arc::new(NullProgress)
        };
        scrape::run_crawl(cfg, blob.clone(), meta.clone(), progress)
            .await
            .with_context(|| format!("crawl {crawl_id} failed"))?;
    }
    Ok(())
}

async fn run_extract(args: ExtractArgs) -> anyhow::Result<()> {
    let command: Vec<String> = args
        .extract_command
        .split_whitespace()
        .map(str::to_owned)
        .collect();
    anyhow::ensure!(!command.is_empty(), "extract command must not be empty");

    let blob = args.store.open_blob().await?;
    let meta = args.store.open_meta().await?;

    let cfg = extract::ExtractConfig {
        command,
        workers: args.workers.max(1),
        batch_size: args.batch_size,
        input_prefix: args.input_prefix,
        output_prefix: args.output_prefix,
        doc_timeout: Duration::from_millis(args.doc_timeout_ms),
        ..Default::default()
    };
    extract::run_extraction(cfg, blob, meta).await?;
    Ok(())
}

async fn run_manifest(args: ManifestArgs) -> anyhow::Result<()> {
    let meta = args.store.open_meta().await?;
    let mirror = if args.store.uses_remote_blobs() {
        Some(args.store.open_blob().await?)
    } else {
        None
    };
    let summary =
        scrape::generate_manifest(&meta, &args.store.storage_path, mirror.as_deref()).await?;
    println!("{} uploaded ids -> {}", summary.count, summary.path.display());
    Ok(())
}

async fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    let meta = args.store.open_meta().await?;

    let stats = meta.stats_by_status().await?;
    println!("documents by status:");
    if stats.is_empty() {
        println!("  (none)");
    }
    for (status, count) in &stats {
        println!("  {status:<12} {count}");
    }

    let extraction = meta.extraction_stats().await?;
    println!(
        "extraction: {} uploaded, {} extracted, {} failed, {} pending",
        extraction.uploaded, extraction.extracted, extraction.failed, extraction.pending
    );
    Ok(())
}
