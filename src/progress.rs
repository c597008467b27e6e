//! Process-wide upload progress.
//!
//! The scheduler is the only writer. Every transition replaces the whole
//! [`ProgressSnapshot`] inside a `watch` channel, so readers always see a
//! consistent set of counters and never block the writer.

use serde::Serialize;
use tokio::sync::watch;

use crate::queue::TaskState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    ReadingMetadata,
    Uploading,
    Cancelling,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub batch: u64,
    pub total: usize,
    pub queued: usize,
    pub encrypting: usize,
    pub uploading: usize,
    pub committing: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_total: u64,
    pub bytes_uploaded: u64,
    pub stage: Stage,
}

impl ProgressSnapshot {
    pub fn in_flight(&self) -> usize {
        self.encrypting + self.uploading + self.committing
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.skipped + self.failed
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.stage, Stage::Idle | Stage::Finished)
    }

    fn counter(&mut self, state: TaskState) -> &mut usize {
        match state {
            TaskState::Queued => &mut self.queued,
            TaskState::Encrypting => &mut self.encrypting,
            TaskState::Uploading => &mut self.uploading,
            TaskState::Committing => &mut self.committing,
            TaskState::Done => &mut self.completed,
            TaskState::Skipped => &mut self.skipped,
            TaskState::Failed => &mut self.failed,
        }
    }
}

pub struct ProgressTracker {
    tx: watch::Sender<ProgressSnapshot>,
    current: ProgressSnapshot,
    batches: u64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self {
            tx,
            current: ProgressSnapshot::default(),
            batches: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> &ProgressSnapshot {
        &self.current
    }

    /// Adds files to the running batch, starting a new one if none is active.
    pub fn add_files(&mut self, count: usize, bytes: u64) {
        if !self.current.is_active() {
            self.batches += 1;
            self.current = ProgressSnapshot {
                batch: self.batches,
                stage: Stage::ReadingMetadata,
                ..ProgressSnapshot::default()
            };
        }
        self.current.total += count;
        self.current.queued += count;
        self.current.bytes_total += bytes;
        self.publish();
    }

    pub fn transition(&mut self, from: TaskState, to: TaskState) {
        if from == to {
            return;
        }
        let old = self.current.counter(from);
        *old = old.saturating_sub(1);
        *self.current.counter(to) += 1;
        self.publish();
    }

    pub fn add_uploaded(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let next = self.current.bytes_uploaded + bytes;
        self.current.bytes_uploaded = next.min(self.current.bytes_total);
        self.publish();
    }

    pub fn set_stage(&mut self, stage: Stage) {
        if self.current.stage == stage || !self.current.is_active() {
            return;
        }
        self.current.stage = stage;
        self.publish();
    }

    /// Publishes the final snapshot of the batch and clears the counters.
    pub fn finish(&mut self) -> ProgressSnapshot {
        self.current.stage = Stage::Finished;
        self.publish();
        let last = self.current.clone();
        self.current = ProgressSnapshot {
            batch: self.batches,
            stage: Stage::Finished,
            ..ProgressSnapshot::default()
        };
        last
    }

    fn publish(&self) {
        self.tx.send_replace(self.current.clone());
    }
}
