use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use vault_upload::chunk::{chunk_count, DEFAULT_CHUNK_SIZE};
use vault_upload::config::{parse_bytes, Config};
use vault_upload::crypto::ciphertext_len;
use vault_upload::http::ApiClient;
use vault_upload::logging;
use vault_upload::pool::CryptoWorkerPool;
use vault_upload::queue::UploadQueue;
use vault_upload::scan;
use vault_upload::telemetry::TransferStats;
use vault_upload::uploader::{clamp_part_size, effective_part_size, part_count, DEFAULT_PART_SIZE};

#[derive(Parser, Debug)]
#[command(name = "vault-upload", version)]
struct Cli {
    /// Path to config file (JSON or YAML)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Do not mirror logs to stdout
    #[arg(short = 'q', long = "quiet", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and upload files or directories into a collection
    Upload {
        #[arg(long = "collection")]
        collection: i64,

        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Show the chunk and part layout of files without uploading
    Plan {
        /// Part size override (e.g. 64MB)
        #[arg(long = "part-size")]
        part_size: Option<String>,

        /// Print JSON instead of a table
        #[arg(long = "json")]
        json: bool,

        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Upload { collection, paths } => {
            let cfg_path = cli.config.context("upload requires --config")?;
            let cfg = Config::load(&cfg_path)?;
            logging::init_log_file(&cfg.log_file_path(), cli.quiet)?;
            run_upload(cfg, collection, paths).await
        }
        Commands::Plan {
            part_size,
            json,
            paths,
        } => {
            let cfg = cli.config.as_deref().map(Config::load).transpose()?;
            run_plan(cfg.as_ref(), part_size.as_deref(), json, &paths)
        }
    }
}

async fn run_upload(cfg: Config, collection: i64, paths: Vec<PathBuf>) -> Result<()> {
    let stats = Arc::new(TransferStats::default());
    let api = ApiClient::new(
        &cfg.server_url,
        cfg.auth_token.as_deref(),
        cfg.part_timeout(),
        stats.clone(),
    )?;
    let keys = Arc::new(cfg.collection_keys()?);
    let pool = CryptoWorkerPool::new(cfg.pool_size()).context("start crypto workers")?;

    let files = scan::collect_files(&paths, &cfg.ignore)?;
    if files.is_empty() {
        info!("nothing to upload");
        return Ok(());
    }
    info!(
        files = files.len(),
        collection,
        pool = pool.size(),
        "starting upload"
    );

    let queue = UploadQueue::start_with_stats(
        Arc::new(api),
        keys,
        pool.clone(),
        cfg.queue_options(),
        stats.clone(),
    );
    queue.enqueue(files, collection).await?;

    let mut progress = queue.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_done = usize::MAX;
        while progress.changed().await.is_ok() {
            let snap = progress.borrow_and_update().clone();
            let done = snap.terminal();
            if done != last_done {
                last_done = done;
                info!(
                    stage = ?snap.stage,
                    done,
                    total = snap.total,
                    bytes_uploaded = snap.bytes_uploaded,
                    bytes_total = snap.bytes_total,
                    "progress"
                );
            }
        }
    });

    let report = tokio::select! {
        r = queue.wait_for_batch() => r?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling batch");
            queue.cancel_batch()?;
            queue.wait_for_batch().await?
        }
    };
    queue.shutdown().await?;
    pool.shutdown();
    reporter.abort();

    let snap = stats.snapshot();
    info!(
        bytes_sent = snap.bytes_sent_total,
        parts = snap.parts_sent_total,
        retries = snap.part_retries_total,
        aborts = snap.aborts_total,
        "transfer stats"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.failed.is_empty() {
        let total = report.completed.len() + report.skipped.len() + report.failed.len();
        anyhow::bail!("{} of {total} files failed", report.failed.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PlanEntry {
    name: String,
    size: u64,
    chunks: u64,
    ciphertext: u64,
    part_size: u64,
    parts: u32,
}

fn run_plan(
    cfg: Option<&Config>,
    part_size: Option<&str>,
    json: bool,
    paths: &[PathBuf],
) -> Result<()> {
    let part_size = match part_size {
        Some(raw) => clamp_part_size(
            parse_bytes(raw).ok_or_else(|| anyhow::anyhow!("invalid part size {raw:?}"))?,
        ),
        None => cfg.map(|c| c.part_size()).unwrap_or(DEFAULT_PART_SIZE),
    };
    let ignores = cfg.map(|c| c.ignore.clone()).unwrap_or_default();
    let files = scan::collect_files(paths, &ignores)?;

    let entries: Vec<PlanEntry> = files
        .iter()
        .map(|f| {
            let ciphertext = ciphertext_len(f.size(), DEFAULT_CHUNK_SIZE);
            PlanEntry {
                name: f.name().to_string(),
                size: f.size(),
                chunks: chunk_count(f.size(), DEFAULT_CHUNK_SIZE),
                ciphertext,
                part_size: effective_part_size(ciphertext, part_size),
                parts: part_count(ciphertext, part_size),
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for e in &entries {
        println!(
            "{}\tsize={}\tchunks={}\tciphertext={}\tparts={}x{}",
            e.name, e.size, e.chunks, e.ciphertext, e.parts, e.part_size
        );
    }
    println!("{} files", entries.len());
    Ok(())
}
