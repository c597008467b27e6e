//! Upload queue and scheduler.
//!
//! One scheduler task owns every [`UploadTask`] and applies all state
//! transitions. Each dispatched task runs its pipeline (encrypt, upload,
//! commit) on its own tokio task and reports stage changes back over a
//! channel; its final outcome arrives through the `JoinSet`.
//!
//! Encryption is bounded by the crypto pool, uploads by a separate
//! semaphore. A task only gives its worker back after it holds an upload
//! slot, so an encrypted file never waits without being in a state.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::{ciphertext_len, CollectionKey, CryptoError};
use crate::encryptor::{EncryptedFile, EncryptorOptions, FileEncryptor};
use crate::error::{ErrorKind, UploadError};
use crate::http::{CommitFileRequest, RemoteApi};
use crate::pool::CryptoWorkerPool;
use crate::progress::{ProgressSnapshot, ProgressTracker, Stage};
use crate::retry::RetryPolicy;
use crate::source::{Fingerprint, LocalFileHandle};
use crate::telemetry::TransferStats;
use crate::uploader::{MultipartUploader, UploadedObject, UploaderOptions};

pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 2;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Encrypting,
    Uploading,
    Committing,
    Done,
    Failed,
    Skipped,
}

/// Source of already-decrypted collection keys.
#[async_trait]
pub trait CollectionKeyProvider: Send + Sync {
    async fn collection_key(&self, collection_id: i64) -> Result<Arc<CollectionKey>, UploadError>;
}

#[derive(Default)]
pub struct StaticCollectionKeys {
    keys: HashMap<i64, Arc<CollectionKey>>,
}

impl StaticCollectionKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection_id: i64, key: CollectionKey) {
        self.keys.insert(collection_id, Arc::new(key));
    }

    pub fn from_base64(map: &BTreeMap<i64, String>) -> Result<Self, CryptoError> {
        let mut out = Self::new();
        for (id, raw) in map {
            out.insert(*id, CollectionKey::from_base64(raw)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl CollectionKeyProvider for StaticCollectionKeys {
    async fn collection_key(&self, collection_id: i64) -> Result<Arc<CollectionKey>, UploadError> {
        self.keys
            .get(&collection_id)
            .cloned()
            .ok_or(UploadError::UnknownCollection(collection_id))
    }
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_concurrent_uploads: usize,
    pub encryptor: EncryptorOptions,
    pub uploader: UploaderOptions,
    /// Task-level policy: how often a whole file is re-queued.
    pub retry: RetryPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            encryptor: EncryptorOptions::default(),
            uploader: UploaderOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub batch: u64,
    pub completed: Vec<CompletedFile>,
    pub skipped: Vec<SkippedFile>,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedFile {
    pub task: TaskId,
    pub name: String,
    pub file_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub task: TaskId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub task: TaskId,
    pub name: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
}

/// Where the next attempt of a task picks up.
#[derive(Clone)]
enum ResumePoint {
    Start,
    Upload(Arc<EncryptedFile>),
    Commit(Arc<EncryptedFile>, UploadedObject),
}

pub struct UploadTask {
    pub id: TaskId,
    pub file: Arc<LocalFileHandle>,
    pub collection_id: i64,
    pub state: TaskState,
    pub attempt: u32,
    pub last_error: Option<UploadError>,
    resume: ResumePoint,
    cipher_len: u64,
    uploaded: u64,
    claimed: bool,
    dispatched: bool,
    cancel: CancellationToken,
}

type Outcome = Result<i64, (UploadError, ResumePoint)>;
type Joined = (TaskId, std::thread::Result<Outcome>);

enum Command {
    Enqueue {
        files: Vec<LocalFileHandle>,
        collection_id: i64,
        reply: oneshot::Sender<Vec<TaskId>>,
    },
    CancelBatch,
    WaitForBatch {
        reply: oneshot::Sender<BatchReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Event {
    Stage {
        task: TaskId,
        state: TaskState,
    },
    Uploaded {
        task: TaskId,
        bytes: u64,
    },
    Requeue {
        task: TaskId,
    },
    Listing {
        collection_id: i64,
        generation: u64,
        result: Result<HashSet<Fingerprint>, UploadError>,
    },
}

enum Listing {
    Pending,
    Ready(HashSet<Fingerprint>),
}

/// Handle to a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct UploadQueue {
    commands: mpsc::UnboundedSender<Command>,
    progress: watch::Receiver<ProgressSnapshot>,
    pool: CryptoWorkerPool,
    stats: Arc<TransferStats>,
}

impl UploadQueue {
    pub fn start(
        api: Arc<dyn RemoteApi>,
        keys: Arc<dyn CollectionKeyProvider>,
        pool: CryptoWorkerPool,
        options: QueueOptions,
    ) -> Self {
        Self::start_with_stats(api, keys, pool, options, Arc::new(TransferStats::default()))
    }

    pub fn start_with_stats(
        api: Arc<dyn RemoteApi>,
        keys: Arc<dyn CollectionKeyProvider>,
        pool: CryptoWorkerPool,
        options: QueueOptions,
        stats: Arc<TransferStats>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new();
        let progress = tracker.subscribe();
        let max_uploads = options.max_concurrent_uploads.max(1);

        let pipeline = Arc::new(Pipeline {
            api: api.clone(),
            keys,
            pool: pool.clone(),
            encryptor: FileEncryptor::new(pool.clone(), options.encryptor.clone()),
            uploader: MultipartUploader::new(api.clone(), options.uploader.clone(), stats.clone()),
            upload_slots: Arc::new(Semaphore::new(max_uploads)),
            events: events_tx.clone(),
        });

        let scheduler = Scheduler {
            pipeline,
            api,
            retry: options.retry,
            chunk_size: options.encryptor.chunk_size,
            max_active: pool.size() + max_uploads,
            commands: commands_rx,
            events: events_rx,
            events_tx,
            tracker,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            awaiting_listing: HashMap::new(),
            listings: HashMap::new(),
            listing_generation: 0,
            committed: HashMap::new(),
            owners: HashMap::new(),
            parked: HashMap::new(),
            waiting_retry: HashSet::new(),
            running: JoinSet::new(),
            cancel: CancellationToken::new(),
            cancelling: false,
            batch_error: None,
            report: BatchReport::default(),
            last_report: BatchReport::default(),
            waiters: Vec::new(),
            next_id: 1,
        };
        tokio::spawn(scheduler.run());

        Self {
            commands: commands_tx,
            progress,
            pool,
            stats,
        }
    }

    /// Adds files to the current batch, starting one if the queue is idle.
    pub async fn enqueue(
        &self,
        files: Vec<LocalFileHandle>,
        collection_id: i64,
    ) -> Result<Vec<TaskId>, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            files,
            collection_id,
            reply,
        })?;
        rx.await.map_err(|_| UploadError::SchedulerStopped)
    }

    pub fn cancel_batch(&self) -> Result<(), UploadError> {
        self.send(Command::CancelBatch)
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.clone()
    }

    /// Resolves once every task of the current batch is terminal. With no
    /// active batch it returns the report of the last one.
    pub async fn wait_for_batch(&self) -> Result<BatchReport, UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::WaitForBatch { reply })?;
        rx.await.map_err(|_| UploadError::SchedulerStopped)
    }

    /// Cancels outstanding work and waits for the scheduler to exit.
    pub async fn shutdown(&self) -> Result<(), UploadError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply })?;
        rx.await.map_err(|_| UploadError::SchedulerStopped)
    }

    pub fn pool(&self) -> &CryptoWorkerPool {
        &self.pool
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    fn send(&self, cmd: Command) -> Result<(), UploadError> {
        self.commands
            .send(cmd)
            .map_err(|_| UploadError::SchedulerStopped)
    }
}

struct Pipeline {
    api: Arc<dyn RemoteApi>,
    keys: Arc<dyn CollectionKeyProvider>,
    pool: CryptoWorkerPool,
    encryptor: FileEncryptor,
    uploader: MultipartUploader,
    upload_slots: Arc<Semaphore>,
    events: mpsc::UnboundedSender<Event>,
}

impl Pipeline {
    async fn run(
        self: Arc<Self>,
        id: TaskId,
        file: Arc<LocalFileHandle>,
        collection_id: i64,
        resume: ResumePoint,
        cancel: CancellationToken,
    ) -> Outcome {
        match resume {
            ResumePoint::Start => self.from_start(id, &file, collection_id, &cancel).await,
            ResumePoint::Upload(encrypted) => {
                let permit = match self.upload_slot(&cancel).await {
                    Ok(p) => p,
                    Err(e) => return Err((e, ResumePoint::Upload(encrypted))),
                };
                self.stage(id, TaskState::Uploading);
                self.upload_and_commit(id, &file, collection_id, encrypted, permit, &cancel)
                    .await
            }
            ResumePoint::Commit(encrypted, object) => {
                self.stage(id, TaskState::Committing);
                self.commit(&file, collection_id, encrypted, object, &cancel)
                    .await
            }
        }
    }

    async fn from_start(
        &self,
        id: TaskId,
        file: &LocalFileHandle,
        collection_id: i64,
        cancel: &CancellationToken,
    ) -> Outcome {
        let start = |e| (e, ResumePoint::Start);
        let key = self.keys.collection_key(collection_id).await.map_err(start)?;
        let worker = self.pool.acquire(cancel).await.map_err(start)?;
        self.stage(id, TaskState::Encrypting);

        let encrypted = match self.encryptor.encrypt_with(&worker, file, &key, cancel).await {
            Ok(e) => Arc::new(e),
            Err(e) => {
                self.pool.release(worker);
                return Err(start(e));
            }
        };
        drop(key);

        let permit = match self.upload_slot(cancel).await {
            Ok(p) => p,
            Err(e) => {
                self.pool.release(worker);
                return Err((e, ResumePoint::Upload(encrypted)));
            }
        };
        self.stage(id, TaskState::Uploading);
        self.pool.release(worker);
        self.upload_and_commit(id, file, collection_id, encrypted, permit, cancel)
            .await
    }

    async fn upload_slot(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, UploadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            p = self.upload_slots.clone().acquire_owned() => {
                p.map_err(|_| UploadError::SchedulerStopped)
            }
        }
    }

    async fn upload_and_commit(
        &self,
        id: TaskId,
        file: &LocalFileHandle,
        collection_id: i64,
        encrypted: Arc<EncryptedFile>,
        permit: OwnedSemaphorePermit,
        cancel: &CancellationToken,
    ) -> Outcome {
        let events = self.events.clone();
        let on_progress = move |bytes: u64| {
            let _ = events.send(Event::Uploaded { task: id, bytes });
        };
        let object = match self
            .uploader
            .upload(&encrypted.payload, cancel, &on_progress)
            .await
        {
            Ok(o) => o,
            Err(e) => return Err((e, ResumePoint::Upload(encrypted))),
        };
        self.stage(id, TaskState::Committing);
        drop(permit);
        self.commit(file, collection_id, encrypted, object, cancel)
            .await
    }

    async fn commit(
        &self,
        file: &LocalFileHandle,
        collection_id: i64,
        encrypted: Arc<EncryptedFile>,
        object: UploadedObject,
        cancel: &CancellationToken,
    ) -> Outcome {
        let req = CommitFileRequest {
            collection_id,
            object_key: object.object_key.clone(),
            object_size: object.size,
            decryption_header: encrypted.header.to_base64(),
            encrypted_key: encrypted.wrapped_key.clone(),
            metadata: encrypted.encrypted_metadata.clone(),
            fingerprint: file.fingerprint(),
        };
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            r = self.api.commit_file_metadata(&req) => r.map_err(|e| UploadError::OrphanedUpload {
                object_key: object.object_key.clone(),
                reason: e.to_string(),
            }),
        };
        match res {
            Ok(file_id) => Ok(file_id),
            Err(err) => {
                if let UploadError::OrphanedUpload { object_key, reason } = &err {
                    error!(
                        file = file.name(),
                        object = %object_key,
                        error = %reason,
                        "orphaned upload: object stored but metadata commit failed"
                    );
                }
                Err((err, ResumePoint::Commit(encrypted, object)))
            }
        }
    }

    fn stage(&self, task: TaskId, state: TaskState) {
        let _ = self.events.send(Event::Stage { task, state });
    }
}

struct Scheduler {
    pipeline: Arc<Pipeline>,
    api: Arc<dyn RemoteApi>,
    retry: RetryPolicy,
    chunk_size: u32,
    max_active: usize,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    tracker: ProgressTracker,
    tasks: HashMap<TaskId, UploadTask>,
    ready: VecDeque<TaskId>,
    awaiting_listing: HashMap<i64, Vec<TaskId>>,
    listings: HashMap<i64, Listing>,
    listing_generation: u64,
    /// Fingerprints this process committed, until a fresh listing covers them.
    committed: HashMap<i64, HashSet<Fingerprint>>,
    owners: HashMap<(i64, Fingerprint), TaskId>,
    /// Duplicates waiting on the task that owns their fingerprint.
    parked: HashMap<TaskId, Vec<TaskId>>,
    waiting_retry: HashSet<TaskId>,
    running: JoinSet<Joined>,
    cancel: CancellationToken,
    cancelling: bool,
    batch_error: Option<UploadError>,
    report: BatchReport,
    last_report: BatchReport,
    waiters: Vec<oneshot::Sender<BatchReport>>,
    next_id: TaskId,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(ev) = self.events.recv() => self.on_event(ev),
                joined = self.running.join_next(), if !self.running.is_empty() => {
                    if let Some(joined) = joined {
                        self.on_joined(joined);
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
            }
            self.dispatch();
            self.refresh_stage();
            self.maybe_finish_batch();
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                files,
                collection_id,
                reply,
            } => {
                let ids = self.enqueue(files, collection_id);
                let _ = reply.send(ids);
            }
            Command::CancelBatch => self.cancel_batch(),
            Command::WaitForBatch { reply } => {
                if self.tracker.current().is_active() {
                    self.waiters.push(reply);
                } else {
                    let _ = reply.send(self.last_report.clone());
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn enqueue(&mut self, files: Vec<LocalFileHandle>, collection_id: i64) -> Vec<TaskId> {
        if files.is_empty() {
            return Vec::new();
        }
        let starting = !self.tracker.current().is_active();
        let bytes: u64 = files
            .iter()
            .map(|f| ciphertext_len(f.size(), self.chunk_size))
            .sum();
        self.tracker.add_files(files.len(), bytes);
        if starting {
            self.report = BatchReport {
                batch: self.tracker.current().batch,
                ..BatchReport::default()
            };
            info!(batch = self.report.batch, "batch started");
        }
        self.cancelling = false;

        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let id = self.next_id;
            self.next_id += 1;
            let cipher_len = ciphertext_len(file.size(), self.chunk_size);
            debug!(task = id, file = file.name(), collection = collection_id, "queued");
            self.tasks.insert(
                id,
                UploadTask {
                    id,
                    file: Arc::new(file),
                    collection_id,
                    state: TaskState::Queued,
                    attempt: 0,
                    last_error: None,
                    resume: ResumePoint::Start,
                    cipher_len,
                    uploaded: 0,
                    claimed: false,
                    dispatched: false,
                    cancel: self.cancel.clone(),
                },
            );
            match self.listings.get(&collection_id) {
                Some(Listing::Ready(_)) => self.ready.push_back(id),
                Some(Listing::Pending) => {
                    self.awaiting_listing.entry(collection_id).or_default().push(id);
                }
                None => {
                    self.listings.insert(collection_id, Listing::Pending);
                    self.awaiting_listing.entry(collection_id).or_default().push(id);
                    self.fetch_listing(collection_id);
                }
            }
            ids.push(id);
        }
        ids
    }

    /// Loads the remote fingerprints of a collection once per batch.
    fn fetch_listing(&self, collection_id: i64) {
        let api = self.api.clone();
        let tx = self.events_tx.clone();
        let policy = self.retry;
        let cancel = self.cancel.clone();
        let generation = self.listing_generation;
        tokio::spawn(async move {
            let mut attempt = 1;
            let result = loop {
                let res = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err(UploadError::Cancelled),
                    r = api.existing_fingerprints(collection_id) => r,
                };
                match res {
                    Ok(list) => break Ok(list.into_iter().collect()),
                    Err(err) if policy.should_retry(attempt) => {
                        warn!(collection = collection_id, attempt, error = %err, "listing fingerprints failed, retrying");
                        if !policy.backoff(attempt, &cancel).await {
                            break Err(UploadError::Cancelled);
                        }
                        attempt += 1;
                    }
                    Err(err) => break Err(UploadError::Remote(err.to_string())),
                }
            };
            let _ = tx.send(Event::Listing {
                collection_id,
                generation,
                result,
            });
        });
    }

    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::Stage { task, state } => {
                let active = self
                    .tasks
                    .get(&task)
                    .is_some_and(|t| t.dispatched && !matches!(t.state, TaskState::Done | TaskState::Failed | TaskState::Skipped));
                if active {
                    self.set_state(task, state);
                }
            }
            Event::Uploaded { task, bytes } => {
                let Some(t) = self.tasks.get_mut(&task) else {
                    return;
                };
                let add = bytes.min(t.cipher_len.saturating_sub(t.uploaded));
                t.uploaded += add;
                self.tracker.add_uploaded(add);
            }
            Event::Requeue { task } => {
                if self.waiting_retry.remove(&task) && self.tasks.contains_key(&task) {
                    self.set_state(task, TaskState::Queued);
                    self.ready.push_back(task);
                }
            }
            Event::Listing {
                collection_id,
                generation,
                result,
            } => {
                if generation != self.listing_generation {
                    return;
                }
                let waiting = self
                    .awaiting_listing
                    .remove(&collection_id)
                    .unwrap_or_default();
                match result {
                    Ok(set) => {
                        debug!(collection = collection_id, known = set.len(), "remote fingerprints loaded");
                        if let Some(done) = self.committed.get_mut(&collection_id) {
                            done.retain(|fp| !set.contains(fp));
                        }
                        self.listings.insert(collection_id, Listing::Ready(set));
                        self.ready.extend(waiting);
                    }
                    Err(UploadError::Cancelled) if !waiting.is_empty() => {
                        // Cancelled fetch of an earlier batch; files queued since need a fresh one.
                        self.awaiting_listing.insert(collection_id, waiting);
                        self.fetch_listing(collection_id);
                    }
                    Err(err) => {
                        self.listings.remove(&collection_id);
                        for id in waiting {
                            self.fail_now(id, err.clone());
                        }
                    }
                }
            }
        }
    }

    fn on_joined(&mut self, joined: Result<Joined, JoinError>) {
        // Stage events a task sent before finishing must land first.
        while let Ok(ev) = self.events.try_recv() {
            self.on_event(ev);
        }
        match joined {
            Ok((id, Ok(outcome))) => self.on_outcome(id, outcome),
            Ok((id, Err(_panic))) => {
                error!(task = id, "upload pipeline panicked");
                if let Some(t) = self.tasks.get_mut(&id) {
                    t.dispatched = false;
                }
                self.fail_now(id, UploadError::Encryption("pipeline panicked".into()));
            }
            Err(err) => error!(error = %err, "upload pipeline task failed to join"),
        }
    }

    fn on_outcome(&mut self, id: TaskId, outcome: Outcome) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.dispatched = false;
        match outcome {
            Ok(file_id) => {
                let name = task.file.name().to_string();
                let key = (task.collection_id, task.file.fingerprint());
                self.set_state(id, TaskState::Done);
                info!(task = id, file = %name, file_id, "upload done");
                self.report.completed.push(CompletedFile {
                    task: id,
                    name,
                    file_id,
                });
                self.tasks.remove(&id);
                self.settle_claim(id, key, true);
            }
            Err((err, resume)) => {
                let err = if task.cancel.is_cancelled() {
                    self.batch_error.clone().unwrap_or(UploadError::Cancelled)
                } else {
                    err
                };
                let attempt = task.attempt;
                task.resume = resume;
                task.last_error = Some(err.clone());
                self.set_state(id, TaskState::Failed);

                if matches!(err, UploadError::PoolExhausted) && self.batch_error.is_none() {
                    self.fail_batch(err.clone());
                }
                if err.is_retryable() && self.retry.should_retry(attempt) {
                    self.schedule_retry(id, attempt, &err);
                } else {
                    self.finalize_failure(id);
                }
            }
        }
    }

    fn schedule_retry(&mut self, id: TaskId, attempt: u32, err: &UploadError) {
        self.waiting_retry.insert(id);
        let delay = self.retry.delay_for(attempt);
        warn!(task = id, attempt, kind = %err.kind(), error = %err, ?delay, "task failed, re-queueing");
        let tx = self.events_tx.clone();
        let policy = self.retry;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if policy.backoff(attempt, &cancel).await {
                let _ = tx.send(Event::Requeue { task: id });
            }
        });
    }

    fn dispatch(&mut self) {
        while self.running.len() < self.max_active {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.state != TaskState::Queued || task.dispatched {
                continue;
            }
            if !task.claimed {
                let fp = task.file.fingerprint();
                let remote_hit = matches!(
                    self.listings.get(&task.collection_id),
                    Some(Listing::Ready(set)) if set.contains(&fp)
                );
                let committed = self
                    .committed
                    .get(&task.collection_id)
                    .is_some_and(|done| done.contains(&fp));
                if remote_hit || committed {
                    self.skip(id);
                    continue;
                }
                let key = (task.collection_id, fp);
                if let Some(&owner) = self.owners.get(&key) {
                    debug!(task = id, owner, "same file in flight, parked");
                    self.parked.entry(owner).or_default().push(id);
                    continue;
                }
                self.owners.insert(key, id);
                task.claimed = true;
            }

            task.attempt += 1;
            task.dispatched = true;
            task.cancel = self.cancel.clone();
            debug!(task = id, file = task.file.name(), attempt = task.attempt, "dispatching");

            let pipeline = self.pipeline.clone();
            let file = task.file.clone();
            let collection_id = task.collection_id;
            let resume = task.resume.clone();
            let cancel = task.cancel.clone();
            self.running.spawn(async move {
                let fut = pipeline.run(id, file, collection_id, resume, cancel);
                let out = AssertUnwindSafe(fut).catch_unwind().await;
                (id, out)
            });
        }
    }

    fn skip(&mut self, id: TaskId) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let name = task.file.name().to_string();
        self.set_state(id, TaskState::Skipped);
        info!(task = id, file = %name, "duplicate, skipped");
        self.report.skipped.push(SkippedFile { task: id, name });
        self.tasks.remove(&id);
    }

    /// Releases the fingerprint owned by `id`. Parked duplicates are skipped
    /// once the owner committed, otherwise they go back to the front of the
    /// ready queue and the first of them takes over the claim.
    fn settle_claim(&mut self, id: TaskId, key: (i64, Fingerprint), done: bool) {
        if self.owners.get(&key) == Some(&id) {
            self.owners.remove(&key);
        }
        let parked = self.parked.remove(&id).unwrap_or_default();
        if done {
            self.committed.entry(key.0).or_default().insert(key.1);
            for dup in parked {
                self.skip(dup);
            }
        } else {
            for dup in parked.into_iter().rev() {
                self.ready.push_front(dup);
            }
        }
    }

    fn set_state(&mut self, id: TaskId, to: TaskState) {
        if let Some(task) = self.tasks.get_mut(&id) {
            let from = task.state;
            task.state = to;
            self.tracker.transition(from, to);
        }
    }

    /// Fails a task that is not running and evicts it.
    fn fail_now(&mut self, id: TaskId, err: UploadError) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.last_error = Some(err);
        self.set_state(id, TaskState::Failed);
        self.finalize_failure(id);
    }

    fn finalize_failure(&mut self, id: TaskId) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };
        if task.claimed {
            self.settle_claim(id, (task.collection_id, task.file.fingerprint()), false);
        }
        let err = task.last_error.unwrap_or(UploadError::Cancelled);
        warn!(
            task = id,
            file = task.file.name(),
            kind = %err.kind(),
            attempts = task.attempt,
            error = %err,
            "upload failed"
        );
        self.report.failed.push(FailedFile {
            task: id,
            name: task.file.name().to_string(),
            kind: err.kind(),
            message: err.to_string(),
            attempts: task.attempt,
        });
    }

    fn cancel_batch(&mut self) {
        if !self.tracker.current().is_active() {
            return;
        }
        info!(batch = self.report.batch, "cancelling batch");
        self.cancelling = true;
        self.tracker.set_stage(Stage::Cancelling);
        self.abandon_pending(UploadError::Cancelled);
    }

    fn fail_batch(&mut self, err: UploadError) {
        error!(batch = self.report.batch, error = %err, "failing whole batch");
        self.batch_error = Some(err.clone());
        self.abandon_pending(err);
    }

    /// Cancels running pipelines and fails everything that is not running.
    fn abandon_pending(&mut self, err: UploadError) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.ready.clear();
        self.awaiting_listing.clear();

        let mut pending: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued && !t.dispatched)
            .map(|t| t.id)
            .collect();
        pending.sort_unstable();
        for id in pending {
            self.fail_now(id, err.clone());
        }

        let mut waiting: Vec<TaskId> = self.waiting_retry.drain().collect();
        waiting.sort_unstable();
        for id in waiting {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.last_error = Some(err.clone());
            }
            self.finalize_failure(id);
        }
    }

    fn refresh_stage(&mut self) {
        if !self.tracker.current().is_active() {
            return;
        }
        let stage = if self.cancelling {
            Stage::Cancelling
        } else if self.running.is_empty() && !self.awaiting_listing.is_empty() {
            Stage::ReadingMetadata
        } else {
            Stage::Uploading
        };
        self.tracker.set_stage(stage);
    }

    fn maybe_finish_batch(&mut self) {
        if !self.tracker.current().is_active() || !self.tasks.is_empty() || !self.running.is_empty() {
            return;
        }
        let last = self.tracker.finish();
        self.report.batch = last.batch;
        self.last_report = std::mem::take(&mut self.report);
        info!(
            batch = last.batch,
            completed = self.last_report.completed.len(),
            skipped = self.last_report.skipped.len(),
            failed = self.last_report.failed.len(),
            "batch finished"
        );
        for w in self.waiters.drain(..) {
            let _ = w.send(self.last_report.clone());
        }
        self.listings.clear();
        self.listing_generation += 1;
        self.batch_error = None;
        self.cancelling = false;
    }

    async fn shutdown(&mut self) {
        info!("upload queue shutting down");
        if self.tracker.current().is_active() {
            self.cancelling = true;
            self.abandon_pending(UploadError::Cancelled);
        }
        while let Some(joined) = self.running.join_next().await {
            self.on_joined(joined);
        }
        // Retries scheduled by the last outcomes never run.
        let mut waiting: Vec<TaskId> = self.waiting_retry.drain().collect();
        waiting.sort_unstable();
        for id in waiting {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.last_error = Some(UploadError::Cancelled);
            }
            self.finalize_failure(id);
        }
        self.maybe_finish_batch();
        for w in self.waiters.drain(..) {
            let _ = w.send(self.report.clone());
        }
    }
}
