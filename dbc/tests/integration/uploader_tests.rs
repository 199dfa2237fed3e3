use std::sync::Arc;

use dbc::uploader::{MultiThreadedBlobUploader, UploadRequest, UploaderSettings};
use dbc_common::config::UploaderConfig;
use dbc_common::Digest;

use crate::common::init_test_logging;
use crate::common::mocks::InMemoryCas;

fn blob(hash: &str, size: usize) -> UploadRequest {
    UploadRequest::from_bytes(Digest::new(hash, size as u64), vec![b'x'; size])
}

#[tokio::test]
async fn test_quota_exceeded_is_reported_and_successes_are_cached() {
    init_test_logging();
    crate::test_log!("TEST START: test_quota_exceeded_is_reported_and_successes_are_cached");

    let cas = Arc::new(InMemoryCas::default());
    cas.reject("d2", "quota exceeded");
    let uploader = MultiThreadedBlobUploader::new(
        cas.clone(),
        UploaderSettings::from(&UploaderConfig::default()),
    );

    let err = uploader
        .add_missing(vec![blob("d1", 100), blob("d2", 200)])
        .await
        .expect_err("d2 is rejected");
    assert!(err.to_string().contains("quota exceeded"), "got: {err}");
    assert_eq!(cas.stored("d1").map(|b| b.len()), Some(100));
    assert!(cas.stored("d2").is_none());

    let calls = cas.calls();
    uploader
        .add_missing(vec![blob("d1", 100)])
        .await
        .expect("d1 is cached");
    assert_eq!(cas.calls(), calls, "cached digest must not hit the network");

    crate::test_log!("TEST PASS: test_quota_exceeded_is_reported_and_successes_are_cached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_callers_publish_overlapping_sets() {
    init_test_logging();

    let cas = Arc::new(InMemoryCas::default());
    let uploader = MultiThreadedBlobUploader::new(
        cas.clone(),
        UploaderSettings {
            missing_check_limit: 3,
            upload_size_limit_bytes: 64,
            worker_count: 2,
        },
    );

    let tasks: Vec<_> = (0..8)
        .map(|caller| {
            let uploader = uploader.clone();
            tokio::spawn(async move {
                let requests: Vec<_> = (0..6)
                    .map(|i| blob(&format!("blob-{}", (caller + i) % 10), 16))
                    .collect();
                uploader.add_missing(requests).await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("upload");
    }

    for i in 0..10 {
        assert!(cas.stored(&format!("blob-{i}")).is_some(), "blob-{i} missing");
    }
    let stats = uploader.stats();
    assert_eq!(stats.blobs_uploaded, 10);
    assert_eq!(uploader.pending_count(), 0);
}
