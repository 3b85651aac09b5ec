//! Test: restart_ships_everything_left_on_disk
//!
//! Purpose
//! - Simulate a process that died mid-pipeline and validate that the next
//!   process uploads every leftover file once and loses no complete sample.
//!
//! Inputs
//! - Previous process: one segment rotated but never compressed, one segment
//!   compressed but never uploaded, and an active segment with a torn last line.
//! - Next process: opens the same buffer directory, recovers, then runs one cycle.
//!
//! Expected Behavior
//! - Recovery uploads the two pending segments, oldest first.
//! - The cycle rotates the adopted active segment; the torn line is dropped and
//!   the sample appended after restart is kept.
//! - Three objects with increasing keys and an empty buffer directory.

mod common;

use common::{fs_store, gunzip_lines, list_dir, make_sample};
use promvault_persistent_storage::{
    CycleOutcome, GzipCompressor, SegmentCompressor, SegmentStore, UploadPipeline, UploaderConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn restart_ships_everything_left_on_disk() {
    let buffer_tmp = TempDir::new().expect("tmpdir");
    let bucket_tmp = TempDir::new().expect("tmpdir");
    let buffer = buffer_tmp.path().to_path_buf();

    // Previous process
    {
        let store = SegmentStore::open(&buffer).await.expect("open");
        store
            .append(&make_sample(1, 1.0, "a", &[]))
            .await
            .expect("append");
        store.rotate().await.expect("rotate");

        store
            .append(&make_sample(2, 2.0, "b", &[]))
            .await
            .expect("append");
        let second = store.rotate().await.expect("rotate");
        GzipCompressor::default()
            .compress(&second)
            .await
            .expect("compress");

        store
            .append(&make_sample(3, 3.0, "c", &[]))
            .await
            .expect("append");
    }
    let active = buffer.join("current.jsonl");
    let mut raw = tokio::fs::read(&active).await.expect("active segment");
    raw.extend_from_slice(b"{\"timestamp\":\"1970-01-01T00:00:00.004Z\",\"metricNa");
    tokio::fs::write(&active, raw).await.expect("torn write");

    // Next process
    let store = SegmentStore::open(&buffer).await.expect("reopen");
    let cloud = fs_store(bucket_tmp.path());
    let pipeline = UploadPipeline::new(
        UploaderConfig {
            interval: Duration::from_secs(3600),
            key_prefix: String::new(),
            recover_on_start: true,
        },
        store.clone(),
        Arc::new(cloud.clone()),
    );

    assert_eq!(pipeline.recover_pending().await.expect("recover"), 2);
    assert_eq!(list_dir(&buffer).await, vec!["current.jsonl".to_string()]);

    store
        .append(&make_sample(5, 5.0, "d", &[]))
        .await
        .expect("append after restart");
    assert!(matches!(
        pipeline.run_cycle().await.expect("cycle"),
        CycleOutcome::Uploaded(_)
    ));
    assert!(list_dir(&buffer).await.is_empty());

    let keys = cloud.list_keys("").await.expect("list");
    assert_eq!(keys.len(), 3);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    let mut names = Vec::new();
    for key in &keys {
        for line in gunzip_lines(&cloud.get_object(key).await.expect("get")) {
            let v: serde_json::Value = serde_json::from_str(&line).expect("intact json line");
            names.push(v["metricName"].as_str().expect("name").to_string());
        }
    }
    assert_eq!(names, vec!["a", "b", "c", "d"]);
}
