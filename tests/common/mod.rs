#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use vault_upload::crypto::CollectionKey;
use vault_upload::encryptor::EncryptorOptions;
use vault_upload::http::{CommitFileRequest, CompletedPart, PresignedPart, RemoteApi, UploadUrls};
use vault_upload::pool::CryptoWorkerPool;
use vault_upload::queue::{QueueOptions, StaticCollectionKeys, UploadQueue};
use vault_upload::retry::RetryPolicy;
use vault_upload::source::Fingerprint;
use vault_upload::uploader::UploaderOptions;

pub const COLLECTION: i64 = 42;
pub const TEST_CHUNK: u32 = 4 * 1024;

pub fn collection_key() -> CollectionKey {
    CollectionKey::from_bytes(&[3u8; 32]).unwrap()
}

pub fn data(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[derive(Default)]
pub struct MockState {
    pub url_requests: u32,
    pub part_attempts: HashMap<u32, u32>,
    pub staged: HashMap<String, BTreeMap<u32, Bytes>>,
    pub objects: HashMap<String, Vec<u8>>,
    pub completed: Vec<(String, Vec<u32>)>,
    pub aborted: Vec<String>,
    pub commit_attempts: u32,
    pub commits: Vec<CommitFileRequest>,
    pub existing: HashMap<i64, Vec<Fingerprint>>,
}

/// In-memory object storage plus metadata API with failure injection.
#[derive(Default)]
pub struct MockApi {
    state: Mutex<MockState>,
    part_failures: Mutex<HashMap<u32, u32>>,
    commit_failures: AtomicU32,
    part_delay_ms: AtomicU64,
    next_object: AtomicU64,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `times` attempts at part `part_number` fail.
    pub fn fail_part(&self, part_number: u32, times: u32) {
        self.part_failures.lock().unwrap().insert(part_number, times);
    }

    pub fn fail_commits(&self, times: u32) {
        self.commit_failures.store(times, Ordering::SeqCst);
    }

    pub fn set_part_delay(&self, d: Duration) {
        self.part_delay_ms.store(d.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn add_existing(&self, collection_id: i64, fp: Fingerprint) {
        self.state().existing.entry(collection_id).or_default().push(fp);
    }

    /// Drops the collection's remote records, as if deleted elsewhere.
    pub fn forget_existing(&self, collection_id: i64) {
        self.state().existing.remove(&collection_id);
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

fn parse_url(url: &str) -> (String, u32) {
    let rest = url.trim_start_matches("mem://");
    let (obj, n) = rest.rsplit_once('/').unwrap();
    (obj.to_string(), n.parse().unwrap())
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn request_upload_urls(&self, count: u32) -> anyhow::Result<UploadUrls> {
        let id = self.next_object.fetch_add(1, Ordering::SeqCst) + 1;
        let object_key = format!("obj-{id}");
        let mut st = self.state();
        st.url_requests += 1;
        st.staged.insert(object_key.clone(), BTreeMap::new());
        Ok(UploadUrls {
            parts: (1..=count)
                .map(|n| PresignedPart {
                    part_number: n,
                    url: format!("mem://{object_key}/{n}"),
                })
                .collect(),
            object_key,
        })
    }

    async fn upload_part(&self, url: &str, body: Bytes, content_md5: &str) -> anyhow::Result<String> {
        let delay = self.part_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let (obj, n) = parse_url(url);
        assert_eq!(content_md5, vault_upload::uploader::content_md5(&body));

        let fail = {
            let mut f = self.part_failures.lock().unwrap();
            match f.get_mut(&n) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        let mut st = self.state();
        *st.part_attempts.entry(n).or_default() += 1;
        if fail {
            anyhow::bail!("injected 503 for part {n}");
        }
        let staged = st
            .staged
            .get_mut(&obj)
            .ok_or_else(|| anyhow::anyhow!("unknown or aborted object {obj}"))?;
        staged.insert(n, body);
        Ok(format!("etag-{obj}-{n}"))
    }

    async fn complete_multipart_upload(
        &self,
        object_key: &str,
        parts: &[CompletedPart],
    ) -> anyhow::Result<()> {
        let mut st = self.state();
        let staged = st
            .staged
            .remove(object_key)
            .ok_or_else(|| anyhow::anyhow!("unknown object {object_key}"))?;
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        let mut bytes = Vec::new();
        for p in parts {
            anyhow::ensure!(p.etag == format!("etag-{object_key}-{}", p.part_number));
            let body = staged
                .get(&p.part_number)
                .ok_or_else(|| anyhow::anyhow!("part {} never uploaded", p.part_number))?;
            bytes.extend_from_slice(body);
        }
        st.objects.insert(object_key.to_string(), bytes);
        st.completed.push((object_key.to_string(), numbers));
        Ok(())
    }

    async fn abort_multipart_upload(&self, object_key: &str) -> anyhow::Result<()> {
        let mut st = self.state();
        st.staged.remove(object_key);
        st.aborted.push(object_key.to_string());
        Ok(())
    }

    async fn commit_file_metadata(&self, req: &CommitFileRequest) -> anyhow::Result<i64> {
        let mut st = self.state();
        st.commit_attempts += 1;
        let left = self.commit_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.commit_failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("commit failed: 500 metadata store unavailable");
        }
        anyhow::ensure!(st.objects.contains_key(&req.object_key), "object not completed");
        st.commits.push(req.clone());
        st.existing
            .entry(req.collection_id)
            .or_default()
            .push(req.fingerprint.clone());
        Ok(1000 + st.commits.len() as i64)
    }

    async fn existing_fingerprints(&self, collection_id: i64) -> anyhow::Result<Vec<Fingerprint>> {
        Ok(self
            .state()
            .existing
            .get(&collection_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct Harness {
    pub api: Arc<MockApi>,
    pub pool: CryptoWorkerPool,
    pub queue: UploadQueue,
}

pub fn options(part_size: u64, max_uploads: usize) -> QueueOptions {
    let fast = RetryPolicy::new(3, Duration::from_millis(1));
    QueueOptions {
        max_concurrent_uploads: max_uploads,
        encryptor: EncryptorOptions {
            chunk_size: TEST_CHUNK,
            read_ahead: 2,
            spool_threshold: u64::MAX,
            spool_dir: None,
        },
        uploader: UploaderOptions {
            part_size,
            part_concurrency: 3,
            retry: fast,
        },
        retry: fast,
    }
}

pub fn start(api: Arc<MockApi>, pool_size: usize, opts: QueueOptions) -> Harness {
    let mut keys = StaticCollectionKeys::new();
    keys.insert(COLLECTION, collection_key());
    let pool = CryptoWorkerPool::new(pool_size).unwrap();
    let queue = UploadQueue::start(api.clone(), Arc::new(keys), pool.clone(), opts);
    Harness { api, pool, queue }
}
