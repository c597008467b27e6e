use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-wide transfer counters shared by the HTTP client and uploader.
#[derive(Default)]
pub struct TransferStats {
    bytes_sent: AtomicU64,
    parts_sent: AtomicU64,
    part_retries: AtomicU64,
    aborts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TransferStats {
    pub fn on_part_sent(&self, n: u64) {
        self.parts_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_part_retry(&self) {
        self.part_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        TransferStatsSnapshot {
            bytes_sent_total: self.bytes_sent.load(Ordering::Relaxed),
            parts_sent_total: self.parts_sent.load(Ordering::Relaxed),
            part_retries_total: self.part_retries.load(Ordering::Relaxed),
            aborts_total: self.aborts.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub bytes_sent_total: u64,
    pub parts_sent_total: u64,
    pub part_retries_total: u64,
    pub aborts_total: u64,
    pub last_error: String,
}
