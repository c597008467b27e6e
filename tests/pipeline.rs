mod common;

use std::time::Duration;

use common::*;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use vault_upload::crypto::{decrypt_file, open_metadata, unwrap_file_key, EncryptionHeader};
use vault_upload::metadata::FileMetadata;
use vault_upload::progress::Stage;
use vault_upload::{ErrorKind, LocalFileHandle};

const WAIT: Duration = Duration::from_secs(20);

fn file(name: &str, len: usize, seed: u8) -> LocalFileHandle {
    LocalFileHandle::from_bytes(name, data(len, seed), 1_700_000_000_000)
}

#[tokio::test]
async fn uploaded_object_decrypts_with_collection_key() {
    let h = start(MockApi::new(), 2, options(20 * 1024, 2));
    let plain = data(45 * 1024, 7);
    h.queue
        .enqueue(
            vec![LocalFileHandle::from_bytes("IMG_0001.JPG", plain.clone(), 1234)],
            COLLECTION,
        )
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.completed.len(), 1);
    assert!(report.completed[0].file_id > 0);

    let st = h.api.state();
    let req = &st.commits[0];
    assert_eq!(req.collection_id, COLLECTION);
    assert_eq!(req.fingerprint.name, "IMG_0001.JPG");
    assert_eq!(req.fingerprint.modification_time, 1234);
    let object = &st.objects[&req.object_key];
    assert_eq!(object.len() as u64, req.object_size);

    let key = unwrap_file_key(&req.encrypted_key, &collection_key()).unwrap();
    let header = EncryptionHeader::from_base64(&req.decryption_header).unwrap();
    assert_eq!(header.chunk_size, TEST_CHUNK);
    assert_eq!(decrypt_file(&key, &header, object).unwrap(), plain);

    let meta = FileMetadata::from_json(&open_metadata(&key, &req.metadata).unwrap()).unwrap();
    assert_eq!(meta.title(), "IMG_0001.JPG");
    assert_eq!(meta.modification_time(), 1234);
}

#[tokio::test]
async fn same_fingerprint_twice_in_one_batch_uploads_once() {
    let h = start(MockApi::new(), 2, options(20 * 1024, 2));
    h.queue
        .enqueue(vec![file("a.jpg", 5000, 1), file("a.jpg", 5000, 1)], COLLECTION)
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.failed.is_empty());
    assert_eq!(h.api.state().url_requests, 1);
    assert_eq!(h.api.state().commits.len(), 1);
}

#[tokio::test]
async fn duplicate_takes_over_when_in_flight_copy_fails() {
    let api = MockApi::new();
    api.fail_part(2, u32::MAX);
    let h = start(api, 2, options(20 * 1024, 2));
    h.queue
        .enqueue(vec![file("big.mov", 45 * 1024, 5), file("big.mov", 45 * 1024, 5)], COLLECTION)
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();

    // The copy never reached storage, so it is attempted rather than skipped.
    assert!(report.completed.is_empty());
    assert!(report.skipped.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed.iter().all(|f| f.attempts == 3));
    let st = h.api.state();
    assert_eq!(st.url_requests, 6);
    assert!(st.commits.is_empty());
}

#[tokio::test]
async fn duplicate_waits_for_in_flight_copy_then_skips() {
    let api = MockApi::new();
    api.set_part_delay(Duration::from_millis(20));
    let h = start(api, 2, options(20 * 1024, 2));
    h.queue
        .enqueue(
            vec![file("clip.mp4", 30 * 1024, 9), file("clip.mp4", 30 * 1024, 9)],
            COLLECTION,
        )
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].task > report.completed[0].task);
    assert_eq!(h.api.state().url_requests, 1);
    assert_eq!(h.api.state().commits.len(), 1);
}

#[tokio::test]
async fn file_known_remotely_is_skipped_without_network_upload() {
    let api = MockApi::new();
    let known = file("old.mov", 9000, 2);
    api.add_existing(COLLECTION, known.fingerprint());
    let h = start(api, 2, options(20 * 1024, 2));

    h.queue.enqueue(vec![known], COLLECTION).await.unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert!(report.completed.is_empty());
    assert_eq!(h.api.state().url_requests, 0);
}

#[tokio::test]
async fn later_batch_skips_what_earlier_batch_committed() {
    let h = start(MockApi::new(), 1, options(20 * 1024, 1));
    h.queue.enqueue(vec![file("a.jpg", 3000, 1)], COLLECTION).await.unwrap();
    let first = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(first.completed.len(), 1);

    h.queue.enqueue(vec![file("a.jpg", 3000, 1)], COLLECTION).await.unwrap();
    let second = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert!(second.batch > first.batch);
    assert_eq!(second.skipped.len(), 1);
    assert_eq!(h.api.state().url_requests, 1);
}

#[tokio::test]
async fn refreshed_listing_replaces_local_commit_record() {
    let h = start(MockApi::new(), 1, options(20 * 1024, 1));
    h.queue.enqueue(vec![file("a.jpg", 3000, 1)], COLLECTION).await.unwrap();
    timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();

    // This batch's listing already carries a.jpg.
    h.queue.enqueue(vec![file("a.jpg", 3000, 1)], COLLECTION).await.unwrap();
    let second = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(second.skipped.len(), 1);

    // Removed remotely: nothing local keeps it from being uploaded again.
    h.api.forget_existing(COLLECTION);
    h.queue.enqueue(vec![file("a.jpg", 3000, 1)], COLLECTION).await.unwrap();
    let third = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(third.completed.len(), 1);
    assert_eq!(h.api.state().url_requests, 2);
}

#[tokio::test]
async fn transient_part_failures_retry_the_part_not_the_file() {
    let api = MockApi::new();
    api.fail_part(2, 2);
    let h = start(api, 2, options(20 * 1024, 2));

    // 45 KiB of plaintext in 20 KiB parts: three parts.
    h.queue.enqueue(vec![file("clip.mp4", 45 * 1024, 3)], COLLECTION).await.unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.completed.len(), 1);

    let st = h.api.state();
    assert_eq!(st.url_requests, 1);
    assert_eq!(st.commit_attempts, 1);
    assert_eq!(st.completed.len(), 1);
    assert_eq!(st.completed[0].1, vec![1, 2, 3]);
    assert_eq!(st.part_attempts[&2], 3);
    assert_eq!(st.part_attempts[&1], 1);
    assert!(st.aborted.is_empty());
    assert_eq!(h.queue.stats().snapshot().part_retries_total, 2);
}

#[tokio::test]
async fn failed_commit_is_retried_without_reupload() {
    let api = MockApi::new();
    api.fail_commits(1);
    let h = start(api, 1, options(20 * 1024, 1));

    h.queue.enqueue(vec![file("doc.pdf", 30 * 1024, 4)], COLLECTION).await.unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.completed.len(), 1);

    let st = h.api.state();
    assert_eq!(st.url_requests, 1);
    assert_eq!(st.commit_attempts, 2);
    assert_eq!(st.commits.len(), 1);
}

#[tokio::test]
async fn exhausted_part_fails_file_but_not_its_batch_mates() {
    let api = MockApi::new();
    api.fail_part(2, u32::MAX);
    let h = start(api, 2, options(20 * 1024, 2));

    h.queue
        .enqueue(
            vec![file("big.mov", 45 * 1024, 5), file("small.jpg", 1000, 6)],
            COLLECTION,
        )
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].name, "small.jpg");
    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.name, "big.mov");
    assert_eq!(failed.kind, ErrorKind::PartUpload);
    assert_eq!(failed.attempts, 3);

    let st = h.api.state();
    // Three attempts at the big file, each with fresh URLs, plus the small one.
    assert_eq!(st.url_requests, 4);
    assert_eq!(st.aborted.len(), 3);
    assert_eq!(st.commits.len(), 1);
}

#[tokio::test]
async fn truncated_source_is_a_permanent_read_error() {
    let h = start(MockApi::new(), 2, options(20 * 1024, 2));
    let short = LocalFileHandle::from_reader(
        "short.bin",
        10_000,
        0,
        Box::new(std::io::Cursor::new(vec![1u8; 100])),
    );
    h.queue
        .enqueue(vec![short, file("fine.jpg", 2000, 8)], COLLECTION)
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].kind, ErrorKind::Read);
    assert_eq!(report.failed[0].attempts, 1);
    assert_eq!(h.pool.outstanding(), 0);
}

#[tokio::test]
async fn unknown_collection_fails_without_upload() {
    let h = start(MockApi::new(), 1, options(20 * 1024, 1));
    h.queue.enqueue(vec![file("a.jpg", 100, 1)], 7).await.unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].kind, ErrorKind::Encryption);
    assert_eq!(h.api.state().url_requests, 0);
}

#[tokio::test]
async fn cancel_fails_every_task_and_returns_workers() {
    let h = start(MockApi::new(), 2, options(20 * 1024, 2));

    // Readers that never produce a byte keep both workers busy.
    let mut writers = Vec::new();
    let mut files = Vec::new();
    for i in 0..10 {
        let (writer, reader) = tokio::io::duplex(64);
        writers.push(writer);
        files.push(LocalFileHandle::from_reader(
            format!("stalled-{i}.raw"),
            8192,
            i,
            Box::new(reader),
        ));
    }
    h.queue.enqueue(files, COLLECTION).await.unwrap();

    let mut rx = h.queue.subscribe();
    timeout(WAIT, rx.wait_for(|s| s.encrypting == 2))
        .await
        .unwrap()
        .unwrap();
    h.queue.cancel_batch().unwrap();

    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.failed.len(), 10);
    assert!(report.failed.iter().all(|f| f.kind == ErrorKind::Cancelled));
    assert!(report.completed.is_empty());
    assert_eq!(h.pool.outstanding(), 0);
    assert_eq!(h.api.state().url_requests, 0);
    drop(writers);
}

#[tokio::test]
async fn stage_bounds_hold_under_load() {
    let api = MockApi::new();
    api.set_part_delay(Duration::from_millis(5));
    let h = start(api, 2, options(8 * 1024, 1));

    let mut rx = h.queue.subscribe();
    let watcher = tokio::spawn(async move {
        let (mut max_enc, mut max_up) = (0, 0);
        while rx.changed().await.is_ok() {
            let s = rx.borrow_and_update().clone();
            max_enc = max_enc.max(s.encrypting);
            max_up = max_up.max(s.uploading);
            if s.stage == Stage::Finished {
                break;
            }
        }
        (max_enc, max_up)
    });

    let files = (0..12).map(|i| file(&format!("f{i}.jpg"), 20 * 1024, i as u8)).collect();
    h.queue.enqueue(files, COLLECTION).await.unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.completed.len(), 12);

    let (max_enc, max_up) = timeout(WAIT, watcher).await.unwrap().unwrap();
    assert!(max_enc <= 2, "encrypting peaked at {max_enc}");
    assert!(max_up <= 1, "uploading peaked at {max_up}");
    assert_eq!(h.pool.outstanding(), 0);
}

#[tokio::test]
async fn finished_snapshot_accounts_for_every_file() {
    let api = MockApi::new();
    let dup = file("dup.jpg", 4000, 9);
    api.add_existing(COLLECTION, dup.fingerprint());
    let h = start(api, 2, options(20 * 1024, 2));

    let mut rx = h.queue.subscribe();
    h.queue
        .enqueue(vec![file("a.jpg", 25 * 1024, 1), file("b.jpg", 0, 2), dup], COLLECTION)
        .await
        .unwrap();
    let finished = timeout(WAIT, rx.wait_for(|s| s.stage == Stage::Finished))
        .await
        .unwrap()
        .unwrap()
        .clone();

    assert_eq!(finished.total, 3);
    assert_eq!(finished.completed, 2);
    assert_eq!(finished.skipped, 1);
    assert_eq!(finished.failed, 0);
    assert_eq!(finished.in_flight(), 0);
    // The skipped file never contributes uploaded bytes.
    assert!(finished.bytes_uploaded <= finished.bytes_total);
    assert!(finished.bytes_uploaded > 0);

    let report = h.queue.wait_for_batch().await.unwrap();
    assert_eq!(report.completed.len(), 2);
    let empty = h
        .api
        .state()
        .completed
        .iter()
        .filter(|(_, parts)| parts == &vec![1])
        .count();
    assert!(empty >= 1);
}

#[tokio::test]
async fn pool_shutdown_fails_the_whole_batch() {
    let h = start(MockApi::new(), 2, options(20 * 1024, 2));
    h.pool.shutdown();
    h.queue
        .enqueue(
            vec![file("a.jpg", 100, 1), file("b.jpg", 100, 2), file("c.jpg", 100, 3)],
            COLLECTION,
        )
        .await
        .unwrap();
    let report = timeout(WAIT, h.queue.wait_for_batch()).await.unwrap().unwrap();
    assert_eq!(report.failed.len(), 3);
    assert!(report.failed.iter().all(|f| f.kind == ErrorKind::PoolExhausted));
    assert_eq!(h.api.state().url_requests, 0);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_work() {
    let h = start(MockApi::new(), 1, options(20 * 1024, 1));
    let (mut writer, reader) = tokio::io::duplex(64);
    writer.write_all(&[1, 2, 3]).await.unwrap();
    h.queue
        .enqueue(
            vec![LocalFileHandle::from_reader("slow.raw", 8192, 0, Box::new(reader))],
            COLLECTION,
        )
        .await
        .unwrap();
    let mut rx = h.queue.subscribe();
    timeout(WAIT, rx.wait_for(|s| s.encrypting == 1)).await.unwrap().unwrap();

    timeout(WAIT, h.queue.shutdown()).await.unwrap().unwrap();
    assert_eq!(h.pool.outstanding(), 0);
    assert!(h.queue.enqueue(vec![file("late.jpg", 10, 1)], COLLECTION).await.is_err());
    drop(writer);
}
