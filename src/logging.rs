use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber: a per-run log file, mirrored to stdout
/// unless `quiet`. `RUST_LOG` overrides the default `info` filter.
pub fn init_log_file(path: &Path, quiet: bool) -> Result<()> {
    let subscriber = file_subscriber(path, !quiet)?;
    // A second init in the same process keeps the first subscriber.
    let _ = subscriber.try_init();
    Ok(())
}

pub fn file_subscriber(path: &Path, mirror_to_stdout: bool) -> Result<impl Subscriber + Send + Sync> {
    let file = open_truncated(path)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(file));
    let stdout_layer = mirror_to_stdout.then(|| {
        fmt::layer()
            .with_target(false)
            .compact()
            .with_writer(std::io::stdout)
    });

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer))
}

fn open_truncated(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    // New log file per run.
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}
