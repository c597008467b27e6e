use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::encryptor::Spool;
use crate::error::UploadError;
use crate::http::{CompletedPart, RemoteApi};
use crate::retry::RetryPolicy;
use crate::telemetry::TransferStats;

pub const DEFAULT_PART_SIZE: u64 = 20 * 1024 * 1024; // 20MB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024; // S3 minimum
pub const MAX_PARTS: u64 = 10000;
pub const DEFAULT_PART_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    pub part_number: u32,
    pub url: String,
    pub offset: u64,
    pub length: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploaderOptions {
    pub part_size: u64,
    pub part_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

/// A multipart object whose parts were all confirmed and completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedObject {
    pub object_key: String,
    pub size: u64,
    pub parts: Vec<CompletedPart>,
}

/// Raises a configured part size to the storage minimum.
pub fn clamp_part_size(requested: u64) -> u64 {
    requested.max(MIN_PART_SIZE)
}

/// Doubles `part_size` until `len` fits in at most [`MAX_PARTS`] parts.
pub fn effective_part_size(len: u64, part_size: u64) -> u64 {
    let mut part_size = part_size.max(1);
    while divide_and_ceil(len, part_size) > MAX_PARTS {
        part_size *= 2;
    }
    part_size
}

/// Number of parts for `len` bytes; an empty object is still one part.
pub fn part_count(len: u64, part_size: u64) -> u32 {
    divide_and_ceil(len, effective_part_size(len, part_size)).max(1) as u32
}

/// Part layout without URLs; offsets are contiguous and cover `len`.
pub fn plan_parts(len: u64, part_size: u64) -> Vec<UploadPart> {
    let part_size = effective_part_size(len, part_size);
    let count = part_count(len, part_size) as u64;
    (0..count)
        .map(|i| {
            let offset = i * part_size;
            UploadPart {
                part_number: i as u32 + 1,
                url: String::new(),
                offset,
                length: part_size.min(len - offset),
                etag: None,
            }
        })
        .collect()
}

fn divide_and_ceil(n: u64, d: u64) -> u64 {
    if d == 0 {
        return 0;
    }
    n.div_ceil(d)
}

pub fn content_md5(body: &[u8]) -> String {
    STANDARD.encode(md5::compute(body).0)
}

pub struct MultipartUploader {
    api: Arc<dyn RemoteApi>,
    options: UploaderOptions,
    stats: Arc<TransferStats>,
}

impl MultipartUploader {
    pub fn new(api: Arc<dyn RemoteApi>, options: UploaderOptions, stats: Arc<TransferStats>) -> Self {
        Self {
            api,
            options,
            stats,
        }
    }

    pub fn options(&self) -> &UploaderOptions {
        &self.options
    }

    /// Uploads `payload` as one multipart object. Every call requests fresh
    /// part URLs. `on_progress` receives the byte count of each confirmed part.
    pub async fn upload(
        &self,
        payload: &Spool,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<UploadedObject, UploadError> {
        let size = payload.len();
        let mut parts = plan_parts(size, self.options.part_size);
        let count = parts.len() as u32;

        let urls = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            r = self.api.request_upload_urls(count) => {
                r.map_err(|e| UploadError::Remote(e.to_string()))?
            }
        };
        let object_key = urls.object_key;
        let mut by_number: BTreeMap<u32, String> = urls
            .parts
            .into_iter()
            .map(|p| (p.part_number, p.url))
            .collect();
        for part in parts.iter_mut() {
            match by_number.remove(&part.part_number) {
                Some(url) => part.url = url,
                None => {
                    self.abort(&object_key).await;
                    return Err(UploadError::Remote(format!(
                        "missing url for part {}",
                        part.part_number
                    )));
                }
            }
        }
        debug!(object = %object_key, size, parts = count, "multipart upload started");

        let mut completed: BTreeMap<u32, String> = BTreeMap::new();
        let mut inflight = stream::iter(parts)
            .map(|part| self.upload_part(payload, part, cancel, on_progress))
            .buffer_unordered(self.options.part_concurrency.max(1));

        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Some(UploadError::Cancelled),
                n = inflight.next() => n,
            };
            match next {
                Some(Ok(part)) => {
                    let etag = part.etag.unwrap_or_default();
                    completed.insert(part.part_number, etag);
                }
                Some(Err(err)) => break Some(err),
                None => break None,
            }
        };
        drop(inflight);

        if let Some(err) = failure {
            self.abort(&object_key).await;
            return Err(err);
        }
        if completed.len() != count as usize {
            self.abort(&object_key).await;
            return Err(UploadError::Remote(format!(
                "{} of {count} parts confirmed",
                completed.len()
            )));
        }

        let parts = completed
            .into_iter()
            .map(|(part_number, etag)| CompletedPart { part_number, etag })
            .collect::<Vec<_>>();

        let done = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            r = self.api.complete_multipart_upload(&object_key, &parts) => {
                r.map_err(|e| UploadError::Remote(format!("complete {object_key}: {e}")))
            }
        };
        if let Err(err) = done {
            self.abort(&object_key).await;
            return Err(err);
        }

        info!(object = %object_key, size, parts = count, "multipart upload completed");
        Ok(UploadedObject {
            object_key,
            size,
            parts,
        })
    }

    async fn upload_part(
        &self,
        payload: &Spool,
        mut part: UploadPart,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<UploadPart, UploadError> {
        let body = payload
            .read_range(part.offset, part.length)
            .await
            .map_err(|e| UploadError::read(&format!("spool part {}", part.part_number), e))?;
        let md5 = content_md5(&body);
        let policy = self.options.retry;

        let mut attempt = 1;
        loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                r = self.api.upload_part(&part.url, body.clone(), &md5) => r,
            };
            // A part without an etag is unconfirmed and counts as a failed attempt.
            let res = res.and_then(|etag| {
                if etag.is_empty() {
                    anyhow::bail!("storage returned no etag for part {}", part.part_number);
                }
                Ok(etag)
            });
            match res {
                Ok(etag) => {
                    part.etag = Some(etag);
                    on_progress(part.length);
                    return Ok(part);
                }
                Err(err) if policy.should_retry(attempt) => {
                    self.stats.on_part_retry();
                    warn!(
                        part = part.part_number,
                        attempt,
                        error = %err,
                        "part upload failed, retrying"
                    );
                    if !policy.backoff(attempt, cancel).await {
                        return Err(UploadError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.stats.set_last_error(&err);
                    return Err(UploadError::PartUpload {
                        part_number: part.part_number,
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    async fn abort(&self, object_key: &str) {
        self.stats.on_abort();
        if let Err(err) = self.api.abort_multipart_upload(object_key).await {
            warn!(object = %object_key, error = %err, "multipart abort failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{CommitFileRequest, PresignedPart, UploadUrls};
    use crate::source::Fingerprint;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Storage {
        fail_times: HashMap<u32, u32>,
        attempts: Mutex<HashMap<u32, u32>>,
        finished: Mutex<Vec<u32>>,
        completed: Mutex<Vec<Vec<CompletedPart>>>,
        aborted: Mutex<Vec<String>>,
        reverse_delays: bool,
        hang: bool,
        no_etag: bool,
        parts_requested: AtomicU64,
    }

    fn part_of(url: &str) -> u32 {
        url.rsplit('/').next().and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    #[async_trait]
    impl RemoteApi for Storage {
        async fn request_upload_urls(&self, count: u32) -> anyhow::Result<UploadUrls> {
            self.parts_requested.store(count as u64, Ordering::SeqCst);
            Ok(UploadUrls {
                object_key: "obj-1".into(),
                parts: (1..=count)
                    .map(|n| PresignedPart {
                        part_number: n,
                        url: format!("mem://obj-1/{n}"),
                    })
                    .collect(),
            })
        }

        async fn upload_part(&self, url: &str, body: Bytes, md5: &str) -> anyhow::Result<String> {
            let n = part_of(url);
            assert_eq!(md5, content_md5(&body));
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.reverse_delays {
                tokio::time::sleep(Duration::from_millis(10 * (4 - n as u64))).await;
            }
            let seen = {
                let mut a = self.attempts.lock().unwrap();
                let e = a.entry(n).or_default();
                *e += 1;
                *e
            };
            if seen <= self.fail_times.get(&n).copied().unwrap_or(0) {
                anyhow::bail!("injected failure for part {n}");
            }
            if self.no_etag {
                return Ok(String::new());
            }
            self.finished.lock().unwrap().push(n);
            Ok(format!("etag-{n}"))
        }

        async fn complete_multipart_upload(
            &self,
            _object_key: &str,
            parts: &[CompletedPart],
        ) -> anyhow::Result<()> {
            self.completed.lock().unwrap().push(parts.to_vec());
            Ok(())
        }

        async fn abort_multipart_upload(&self, object_key: &str) -> anyhow::Result<()> {
            self.aborted.lock().unwrap().push(object_key.to_string());
            Ok(())
        }

        async fn commit_file_metadata(&self, _req: &CommitFileRequest) -> anyhow::Result<i64> {
            Ok(1)
        }

        async fn existing_fingerprints(&self, _id: i64) -> anyhow::Result<Vec<Fingerprint>> {
            Ok(Vec::new())
        }
    }

    fn uploader(api: Arc<Storage>, part_size: u64) -> MultipartUploader {
        MultipartUploader::new(
            api,
            UploaderOptions {
                part_size,
                part_concurrency: 3,
                retry: RetryPolicy::new(3, Duration::from_millis(1)),
            },
            Arc::new(TransferStats::default()),
        )
    }

    fn payload(len: usize) -> Spool {
        Spool::Memory(Bytes::from(vec![7u8; len]))
    }

    #[test]
    fn part_layout_for_45_over_20() {
        const MB: u64 = 1024 * 1024;
        let parts = plan_parts(45 * MB, 20 * MB);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].offset, 40 * MB);
        assert_eq!(parts[2].length, 5 * MB);
        assert_eq!(part_count(0, 20 * MB), 1);
        assert_eq!(plan_parts(0, 20 * MB)[0].length, 0);
    }

    #[test]
    fn part_size_clamped_and_doubled() {
        assert_eq!(clamp_part_size(1024), MIN_PART_SIZE);
        assert_eq!(clamp_part_size(64 << 20), 64 << 20);
        let len = MAX_PARTS * MIN_PART_SIZE + 1;
        assert_eq!(effective_part_size(len, MIN_PART_SIZE), MIN_PART_SIZE * 2);
        assert!(part_count(len, MIN_PART_SIZE) as u64 <= MAX_PARTS);
    }

    #[tokio::test]
    async fn reverse_order_completion_is_completed_ascending() {
        let api = Arc::new(Storage {
            reverse_delays: true,
            ..Default::default()
        });
        let up = uploader(api.clone(), 100);
        let seen = AtomicU64::new(0);
        let out = up
            .upload(&payload(250), &CancellationToken::new(), &|n: u64| {
                seen.fetch_add(n, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(*api.finished.lock().unwrap(), vec![3, 2, 1]);
        let completed = api.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        let numbers: Vec<u32> = completed[0].iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(out.parts, completed[0]);
        assert_eq!(seen.load(Ordering::SeqCst), 250);
    }

    #[tokio::test]
    async fn transient_part_failure_is_retried() {
        let api = Arc::new(Storage {
            fail_times: HashMap::from([(2, 2)]),
            ..Default::default()
        });
        let up = uploader(api.clone(), 100);
        up.upload(&payload(250), &CancellationToken::new(), &|_: u64| {})
            .await
            .unwrap();
        assert_eq!(api.attempts.lock().unwrap()[&2], 3);
        assert_eq!(api.completed.lock().unwrap().len(), 1);
        assert!(api.aborted.lock().unwrap().is_empty());
        assert_eq!(up.stats.snapshot().part_retries_total, 2);
    }

    #[tokio::test]
    async fn exhausted_part_aborts_without_complete() {
        let api = Arc::new(Storage {
            fail_times: HashMap::from([(1, 10)]),
            ..Default::default()
        });
        let up = uploader(api.clone(), 100);
        let err = up
            .upload(&payload(250), &CancellationToken::new(), &|_: u64| {})
            .await
            .unwrap_err();
        match err {
            UploadError::PartUpload {
                part_number,
                attempts,
                ..
            } => {
                assert_eq!(part_number, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(api.completed.lock().unwrap().is_empty());
        assert_eq!(*api.aborted.lock().unwrap(), vec!["obj-1".to_string()]);
    }

    #[tokio::test]
    async fn part_without_etag_is_never_completed() {
        let api = Arc::new(Storage {
            no_etag: true,
            ..Default::default()
        });
        let up = uploader(api.clone(), 100);
        let err = up
            .upload(&payload(250), &CancellationToken::new(), &|_: u64| {})
            .await
            .unwrap_err();
        match err {
            UploadError::PartUpload {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("no etag"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(api.completed.lock().unwrap().is_empty());
        assert_eq!(api.aborted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_payload_uploads_one_empty_part() {
        let api = Arc::new(Storage::default());
        let up = uploader(api.clone(), 100);
        let out = up
            .upload(&payload(0), &CancellationToken::new(), &|_: u64| {})
            .await
            .unwrap();
        assert_eq!(api.parts_requested.load(Ordering::SeqCst), 1);
        assert_eq!(out.parts.len(), 1);
    }

    #[tokio::test]
    async fn cancel_mid_upload_aborts() {
        let api = Arc::new(Storage {
            hang: true,
            ..Default::default()
        });
        let up = uploader(api.clone(), 100);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = up.upload(&payload(250), &cancel, &|_: u64| {}).await.unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(api.aborted.lock().unwrap().len(), 1);
        assert!(api.completed.lock().unwrap().is_empty());
    }
}
