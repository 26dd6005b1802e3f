//! End-to-end import runs against local `file://` datasets and in-memory backends

mod helpers;

use async_trait::async_trait;
use helpers::{empty_archive, jpeg, png, write_dataset, ArchiveBuilder, Harness, CONFIG};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use ydm_common::models::{
    Dataset, DatasetFilter, ErrorCode, Image, ImageFilter, ImportJob, ImportStep, JobStatus,
    StorageLayout,
};
use ydm_common::uuid_utils::dataset_id_for_job;
use ydm_ingest::gateways::{MetadataGateway, StorageGateway};
use ydm_ingest::services::JobOutcome;
use ydm_ingest::worker::{self, WorkerPool};

/// img1 with one `person` box, img2 with no label file
fn two_image_dataset() -> helpers::DatasetFiles {
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(64, 48))
        .file("img2.png", png(32, 32))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.3\n")
        .build();
    write_dataset(CONFIG, &images, &labels)
}

#[tokio::test]
async fn imports_a_small_dataset() {
    let harness = Harness::new().await;
    let files = two_image_dataset();

    let job_id = harness.submit(files.request("coco-mini")).await;
    assert_eq!(harness.run_queue().await, 1);

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.progress.percentage, 100);
    assert_eq!(job.progress.steps_completed, ImportStep::ALL.to_vec());
    assert_eq!(job.attempts, 1);
    assert!(job.error.is_none());

    let dataset_id = job.dataset_id.expect("completed job names its dataset");
    assert_eq!(dataset_id, dataset_id_for_job(job_id));

    let summary = job.summary.expect("summary");
    assert_eq!(summary.total_images, 2);
    assert_eq!(summary.total_annotations, 1);
    assert_eq!(summary.skipped_entries, 0);
    assert_eq!(summary.classes, vec!["person", "car", "bicycle"]);

    let dataset = harness.service.get_dataset(dataset_id).await.unwrap();
    assert_eq!(dataset.name, "coco-mini");
    assert_eq!(dataset.import_job_id, job_id);
    assert_eq!(dataset.status, JobStatus::Completed);
    assert_eq!(dataset.stats.total_images, 2);
    assert_eq!(dataset.stats.total_annotations, 1);
    assert_eq!(dataset.stats.classes_count, 3);
    assert_eq!(dataset.stats.width.max, 64);
    assert_eq!(dataset.stats.height.min, 32);
    assert_eq!(dataset.classes[0].name, "person");
    assert_eq!(dataset.classes[0].count, 1);
    assert_eq!(dataset.classes[1].count, 0);
    assert_eq!(
        harness.metadata.count_images(dataset_id).await.unwrap(),
        dataset.stats.total_images
    );

    let page = harness
        .service
        .list_images(dataset_id, &ImageFilter::default(), 1, 10)
        .await
        .unwrap();
    assert_eq!(page.pagination.total_items, 2);
    let img1 = &page.items[0];
    assert_eq!(img1.filename, "img1.jpg");
    assert_eq!((img1.width, img1.height), (64, 48));
    assert_eq!(img1.annotation_count, 1);
    assert_eq!(img1.annotations[0].class_id, 0);
    assert_eq!(img1.annotations[0].class_name, "person");
    assert!((img1.annotations[0].bbox.width - 0.2).abs() < 1e-9);
    let img2 = &page.items[1];
    assert_eq!(img2.filename, "img2.png");
    assert_eq!(img2.annotation_count, 0);
    assert!(img2.annotations.is_empty());

    let layout = StorageLayout::for_dataset(dataset_id);
    let blobs = harness.blobs(dataset_id).await;
    assert!(blobs.contains(&layout.config_path));
    assert!(blobs.contains(&format!("{}/img1.jpg", layout.images_path)));
    assert!(blobs.contains(&format!("{}/img2.png", layout.images_path)));
    assert!(blobs.contains(&format!("{}/img1.txt", layout.labels_path)));
}

#[tokio::test]
async fn pairs_labels_across_layout_directories() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .dir("images/")
        .file("images/train/a.jpg", jpeg(16, 16))
        .file("images/val/a.jpg", jpeg(20, 10))
        .build();
    let labels = ArchiveBuilder::new()
        .file("labels/train/a.txt", b"1 0.5 0.5 0.1 0.1\n")
        .file("labels/val/a.txt", b"2 0.5 0.5 0.1 0.1\n2 0.2 0.2 0.1 0.1\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("split")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let dataset_id = job.dataset_id.unwrap();
    let page = harness
        .service
        .list_images(dataset_id, &ImageFilter::default(), 1, 10)
        .await
        .unwrap();
    let by_path = |path: &str| -> Image {
        page.items
            .iter()
            .find(|i| i.relative_path == path)
            .cloned()
            .expect("image present")
    };
    assert_eq!(by_path("images/train/a.jpg").annotations[0].class_name, "car");
    assert_eq!(by_path("images/val/a.jpg").annotation_count, 2);
}

#[tokio::test]
async fn out_of_bounds_class_id_skips_only_that_image() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .file("img2.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .file("img2.txt", b"7 0.5 0.5 0.2 0.2\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("partial")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.progress.images_processed, 1);
    assert_eq!(job.progress.images_skipped, 1);
    assert_eq!(job.summary.as_ref().unwrap().skipped_entries, 1);

    let dataset_id = job.dataset_id.unwrap();
    let dataset = harness.service.get_dataset(dataset_id).await.unwrap();
    assert_eq!(dataset.stats.total_images, 1);
    assert_eq!(dataset.stats.skipped_entries, 1);
    assert_eq!(harness.metadata.count_images(dataset_id).await.unwrap(), 1);
}

#[tokio::test]
async fn label_line_with_six_fields_skips_its_image() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .file("img2.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.1 0.1 0.9\n")
        .file("img2.txt", b"1 0.5 0.5 0.1 0.1\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("six-fields")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.progress.images_processed, 1);
    assert_eq!(job.progress.images_skipped, 1);
    assert_eq!(job.summary.as_ref().unwrap().skipped_entries, 1);

    let page = harness
        .service
        .list_images(job.dataset_id.unwrap(), &ImageFilter::default(), 1, 10)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].filename, "img2.jpg");
}

#[tokio::test]
async fn six_field_label_reports_its_line() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.1 0.1\n2 0.5 0.5 0.1 0.1 0.9\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("six-fields-only")).await;
    harness.run_queue().await;

    let error = harness.job(job_id).await.error.expect("job fails");
    assert_eq!(error.code, ErrorCode::LabelParseError);
    assert_eq!(error.kind, "no_usable_images");
    let sample = &error.detail.unwrap()["samples"][0];
    assert_eq!(sample["file"], "img1.txt");
    assert_eq!(sample["kind"], "malformed_line");
    assert_eq!(sample["line"], 2);
}

#[tokio::test]
async fn orphan_and_duplicate_labels_are_skipped() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .file("img2.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .file("labels/img1.txt", b"1 0.5 0.5 0.2 0.2\n")
        .file("img9.txt", b"2 0.5 0.5 0.2 0.2\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("stray-labels")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.progress.images_processed, 2);
    assert_eq!(job.summary.as_ref().unwrap().skipped_entries, 2);

    let dataset_id = job.dataset_id.unwrap();
    let dataset = harness.service.get_dataset(dataset_id).await.unwrap();
    assert_eq!(dataset.stats.skipped_entries, 2);
    // First label in archive order wins the pairing
    let page = harness
        .service
        .list_images(dataset_id, &ImageFilter::default(), 1, 10)
        .await
        .unwrap();
    let img1 = page.items.iter().find(|i| i.filename == "img1.jpg").unwrap();
    assert_eq!(img1.annotations[0].class_name, "person");
}

#[tokio::test]
async fn stray_labels_count_toward_the_skip_ratio() {
    let harness = Harness::configured(|s| s.max_skip_ratio = Some(0.5)).await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .file("img2.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .file("labels/img1.txt", b"1 0.5 0.5 0.2 0.2\n")
        .file("img8.txt", b"2 0.5 0.5 0.2 0.2\n")
        .file("img9.txt", b"2 0.5 0.5 0.2 0.2\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("too-many-strays")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::LabelParseError);
    assert_eq!(error.kind, "tolerance_exceeded");
    let detail = error.detail.unwrap();
    assert_eq!(detail["skipped"], 3);
    assert_eq!(detail["by_code"]["label_parse_error"], 3);
    let kinds: Vec<&str> = detail["samples"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["duplicate_label", "missing_image", "missing_image"]);
    assert!(harness.blobs(dataset_id_for_job(job_id)).await.is_empty());
}

#[tokio::test]
async fn downloads_share_one_byte_budget() {
    let sizes = |files: &helpers::DatasetFiles| {
        ["dataset.yaml", "labels.zip", "images.zip"]
            .map(|name| std::fs::metadata(files.dir.path().join(name)).unwrap().len())
    };
    let files = two_image_dataset();
    let [config, labels, images] = sizes(&files);
    assert!(images > config + labels);

    // Every artifact fits on its own; together they do not
    let harness = Harness::configured(|s| s.max_dataset_bytes = images).await;
    let job_id = harness.submit(files.request("over-budget")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::FetchError);
    assert_eq!(error.kind, "size_exceeded");
    let detail = error.detail.unwrap();
    assert_eq!(detail["artifact"], "images archive");
    assert_eq!(detail["attempts"], 1);
    assert_eq!(detail["limit_bytes"], images - config - labels);
    assert!(harness.blobs(dataset_id_for_job(job_id)).await.is_empty());

    let roomy = Harness::configured(|s| s.max_dataset_bytes = 2 * (config + labels + images)).await;
    let job_id = roomy.submit(files.request("ample-budget")).await;
    roomy.run_queue().await;
    assert_eq!(roomy.job(job_id).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn declared_archive_contents_must_fit_the_dataset_limit() {
    let harness = Harness::configured(|s| s.max_dataset_bytes = 100_000).await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .file("padding.bin", vec![0u8; 150_000])
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .build();
    assert!(images.len() < 50_000);
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("expands")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::ArchiveError);
    assert_eq!(error.kind, "size_exceeded");
    let detail = error.detail.unwrap();
    assert_eq!(detail["artifact"], "images archive");
    assert_eq!(detail["limit_bytes"], 100_000);
    assert!(detail["total_bytes"].as_u64().unwrap() > 150_000);
    assert_eq!(harness.metadata.count_images(dataset_id_for_job(job_id)).await.unwrap(), 0);
}

#[tokio::test]
async fn dataset_without_usable_images_fails() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", b"this is not a jpeg")
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("broken")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.dataset_id.is_none());
    assert!(job.completed_at.is_none());
    let error = job.error.expect("failed job carries its error");
    assert_eq!(error.code, ErrorCode::ImageFormatError);
    assert_eq!(error.kind, "no_usable_images");
    let detail = error.detail.expect("skip detail");
    assert_eq!(detail["skipped"], 1);
    assert_eq!(detail["samples"][0]["file"], "img1.jpg");

    let dataset_id = dataset_id_for_job(job_id);
    assert!(harness.metadata.get_dataset(dataset_id).await.unwrap().is_none());
    assert_eq!(harness.metadata.count_images(dataset_id).await.unwrap(), 0);
    assert!(harness.blobs(dataset_id).await.is_empty());
}

#[tokio::test]
async fn archive_without_images_is_reported_as_empty() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("README.md", b"nothing here")
        .build();
    let labels = empty_archive();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("empty")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::ArchiveError);
    assert_eq!(error.kind, "empty");
}

#[tokio::test]
async fn class_count_mismatch_fails_validation() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .build();
    let files = write_dataset("nc: 2\nnames: [person, car, bicycle]\n", &images, &labels);

    let job_id = harness.submit(files.request("mismatch")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::ConfigValidationError);
    assert_eq!(error.kind, "class_count_mismatch");
    assert!(harness.blobs(dataset_id_for_job(job_id)).await.is_empty());
}

#[tokio::test]
async fn missing_names_field_is_reported() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .build();
    let labels = empty_archive();
    let files = write_dataset("nc: 1\ntrain: images\n", &images, &labels);

    let job_id = harness.submit(files.request("no-names")).await;
    harness.run_queue().await;

    let error = harness.job(job_id).await.error.unwrap();
    assert_eq!(error.code, ErrorCode::ConfigValidationError);
    assert_eq!(error.kind, "missing_field");
    assert_eq!(error.detail.unwrap()["field"], "names");
}

#[tokio::test]
async fn corrupt_archive_fails_the_job() {
    let harness = Harness::new().await;
    let labels = empty_archive();
    let files = write_dataset(CONFIG, b"PK\x03\x04 definitely not a zip", &labels);

    let job_id = harness.submit(files.request("corrupt")).await;
    harness.run_queue().await;

    let error = harness.job(job_id).await.error.unwrap();
    assert_eq!(error.code, ErrorCode::ArchiveError);
    assert_eq!(error.kind, "corrupt");
    assert_eq!(error.detail.unwrap()["artifact"], "images archive");
}

#[tokio::test]
async fn path_traversal_entry_fails_before_extraction() {
    let harness = Harness::new().await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("../../etc/evil.txt", b"0 0.5 0.5 0.1 0.1\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("traversal")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::ArchiveError);
    assert_eq!(error.kind, "path_traversal");
    assert_eq!(error.detail.unwrap()["artifact"], "labels archive");
}

#[tokio::test]
async fn oversized_entry_is_treated_as_zip_bomb() {
    let harness = Harness::configured(|s| s.max_entry_bytes = 1024).await;
    let images = ArchiveBuilder::new()
        .file("big.png", vec![0u8; 64 * 1024])
        .build();
    let labels = empty_archive();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("bomb")).await;
    harness.run_queue().await;

    let error = harness.job(job_id).await.error.unwrap();
    assert_eq!(error.code, ErrorCode::ArchiveError);
    assert_eq!(error.kind, "zip_bomb");
    let detail = error.detail.unwrap();
    assert_eq!(detail["entry"], "big.png");
    assert_eq!(detail["limit_bytes"], 1024);
}

#[tokio::test]
async fn missing_local_file_is_a_fetch_error() {
    let harness = Harness::new().await;
    let files = two_image_dataset();
    let mut request = files.request("gone");
    request.labels_url = helpers::fixtures::file_url(&files.dir.path().join("missing.zip"));

    let job_id = harness.submit(request).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::FetchError);
    assert_eq!(error.kind, "not_found");
    let detail = error.detail.unwrap();
    assert_eq!(detail["artifact"], "labels archive");
    assert_eq!(detail["attempts"], 1);
}

#[tokio::test]
async fn redelivery_of_a_finished_job_changes_nothing() {
    let harness = Harness::new().await;
    let files = two_image_dataset();

    let job_id = harness.submit(files.request("once")).await;
    harness.run_queue().await;
    let before = harness.job(job_id).await;
    assert_eq!(before.status, JobStatus::Completed);

    harness.redeliver(job_id).await;
    assert_eq!(harness.run_queue().await, 1);

    let after = harness.job(job_id).await;
    assert_eq!(after, before);
    assert_eq!(
        harness.process(job_id).await,
        JobOutcome::AlreadyTerminal(JobStatus::Completed)
    );
    assert_eq!(
        harness.metadata.count_images(after.dataset_id.unwrap()).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn unknown_job_ids_are_dropped() {
    let harness = Harness::new().await;
    assert_eq!(harness.process(Uuid::new_v4()).await, JobOutcome::Missing);

    harness.redeliver(Uuid::new_v4()).await;
    assert_eq!(harness.run_queue().await, 1);
    assert!(harness.queue.is_empty().await);
}

#[tokio::test]
async fn interrupted_job_restarts_from_scratch() {
    let harness = Harness::new().await;
    let files = two_image_dataset();
    let job_id = harness.submit(files.request("restart")).await;
    let dataset_id = dataset_id_for_job(job_id);

    // A worker picked the job up, wrote a blob and died
    let mut job = harness.job(job_id).await;
    job.begin_attempt().unwrap();
    job.advance_to_step(ImportStep::ExtractArchives);
    job.raise_percentage(30);
    assert!(harness.metadata.upsert_job(&job).await.unwrap());
    let stale = format!("{}/images/stale.jpg", StorageLayout::root(dataset_id));
    harness
        .storage
        .put(&stale, Box::new(std::io::Cursor::new(b"stale".to_vec())))
        .await
        .unwrap();

    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.progress.percentage, 100);
    let blobs = harness.blobs(dataset_id).await;
    assert!(!blobs.contains(&stale));
    assert_eq!(harness.metadata.count_images(dataset_id).await.unwrap(), 2);
}

#[tokio::test]
async fn skip_ratio_limit_fails_the_job() {
    let harness = Harness::configured(|s| s.max_skip_ratio = Some(0.25)).await;
    let images = ArchiveBuilder::new()
        .file("img1.jpg", jpeg(8, 8))
        .file("img2.jpg", jpeg(8, 8))
        .build();
    let labels = ArchiveBuilder::new()
        .file("img1.txt", b"0 0.5 0.5 0.2 0.2\n")
        .file("img2.txt", b"0 1.5 0.5 0.2 0.2\n")
        .build();
    let files = write_dataset(CONFIG, &images, &labels);

    let job_id = harness.submit(files.request("strict")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::LabelParseError);
    assert_eq!(error.kind, "tolerance_exceeded");
    let detail = error.detail.unwrap();
    assert_eq!(detail["max_skip_ratio"], 0.25);
    assert_eq!(detail["samples"][0]["kind"], "out_of_range");
    assert_eq!(detail["samples"][0]["file"], "img2.txt");
    assert_eq!(detail["samples"][0]["line"], 1);

    let dataset_id = dataset_id_for_job(job_id);
    assert_eq!(harness.metadata.count_images(dataset_id).await.unwrap(), 0);
    assert!(harness.blobs(dataset_id).await.is_empty());
}

#[tokio::test]
async fn single_image_batches_persist_every_image() {
    let harness = Harness::configured(|s| s.image_batch_size = 1).await;
    let images = (0..5u32)
        .fold(ArchiveBuilder::new(), |archive, i| {
            archive.file(&format!("img{}.jpg", i), jpeg(8 + i, 8))
        })
        .build();
    let files = write_dataset(CONFIG, &images, &empty_archive());

    let job_id = harness.submit(files.request("batches")).await;
    harness.run_queue().await;

    let job = harness.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error);
    let dataset_id = job.dataset_id.unwrap();
    assert_eq!(harness.metadata.count_images(dataset_id).await.unwrap(), 5);
    assert_eq!(job.progress.images_discovered, 5);
    assert_eq!(job.progress.images_processed, 5);
}

/// Records every job snapshot written through it; the first
/// `failing_lookups` job reads return an error
struct RecordingMetadata {
    inner: Arc<dyn MetadataGateway>,
    snapshots: Arc<Mutex<Vec<ImportJob>>>,
    failing_lookups: Arc<AtomicUsize>,
}

#[async_trait]
impl MetadataGateway for RecordingMetadata {
    async fn upsert_job(&self, job: &ImportJob) -> ydm_common::Result<bool> {
        self.snapshots.lock().unwrap().push(job.clone());
        self.inner.upsert_job(job).await
    }
    async fn get_job(&self, job_id: Uuid) -> ydm_common::Result<Option<ImportJob>> {
        let failing = self
            .failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ydm_common::Error::Internal("metadata store unavailable".into()));
        }
        self.inner.get_job(job_id).await
    }
    async fn insert_dataset(&self, dataset: &Dataset) -> ydm_common::Result<()> {
        self.inner.insert_dataset(dataset).await
    }
    async fn get_dataset(&self, dataset_id: Uuid) -> ydm_common::Result<Option<Dataset>> {
        self.inner.get_dataset(dataset_id).await
    }
    async fn delete_dataset(&self, dataset_id: Uuid) -> ydm_common::Result<()> {
        self.inner.delete_dataset(dataset_id).await
    }
    async fn count_datasets(&self, filter: &DatasetFilter) -> ydm_common::Result<u64> {
        self.inner.count_datasets(filter).await
    }
    async fn list_datasets(
        &self,
        filter: &DatasetFilter,
        offset: u64,
        limit: u32,
    ) -> ydm_common::Result<Vec<Dataset>> {
        self.inner.list_datasets(filter, offset, limit).await
    }
    async fn insert_images(&self, images: &[Image]) -> ydm_common::Result<()> {
        self.inner.insert_images(images).await
    }
    async fn delete_images(&self, dataset_id: Uuid) -> ydm_common::Result<u64> {
        self.inner.delete_images(dataset_id).await
    }
    async fn count_matching_images(
        &self,
        dataset_id: Uuid,
        filter: &ImageFilter,
    ) -> ydm_common::Result<u64> {
        self.inner.count_matching_images(dataset_id, filter).await
    }
    async fn list_images(
        &self,
        dataset_id: Uuid,
        filter: &ImageFilter,
        offset: u64,
        limit: u32,
    ) -> ydm_common::Result<Vec<Image>> {
        self.inner.list_images(dataset_id, filter, offset, limit).await
    }
}

#[tokio::test]
async fn progress_never_moves_backwards() {
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let recorder = snapshots.clone();
    let harness = Harness::build(
        |s| s.image_batch_size = 1,
        move |inner| {
            let recording: Arc<dyn MetadataGateway> = Arc::new(RecordingMetadata {
                inner,
                snapshots: recorder,
                failing_lookups: Arc::new(AtomicUsize::new(0)),
            });
            recording
        },
    )
    .await;
    let files = two_image_dataset();

    let job_id = harness.submit(files.request("progress")).await;
    harness.run_queue().await;
    assert_eq!(harness.job(job_id).await.status, JobStatus::Completed);

    let snapshots = snapshots.lock().unwrap();
    assert!(snapshots.len() > 5);
    let percentages: Vec<u8> = snapshots.iter().map(|j| j.progress.percentage).collect();
    assert!(
        percentages.windows(2).all(|w| w[0] <= w[1]),
        "percentages regressed: {:?}",
        percentages
    );
    let steps: Vec<ImportStep> = snapshots
        .iter()
        .filter_map(|j| j.progress.current_step)
        .collect();
    assert!(steps.windows(2).all(|w| w[0] <= w[1]), "steps regressed: {:?}", steps);
    assert!(steps.contains(&ImportStep::ParseAnnotations));
    assert_eq!(percentages.last(), Some(&100));
}

#[tokio::test]
async fn unrecorded_outcome_releases_the_delivery() {
    let failing_lookups = Arc::new(AtomicUsize::new(1));
    let failures = failing_lookups.clone();
    let harness = Harness::build(
        |_| {},
        move |inner| {
            let recording: Arc<dyn MetadataGateway> = Arc::new(RecordingMetadata {
                inner,
                snapshots: Arc::new(Mutex::new(Vec::new())),
                failing_lookups: failures,
            });
            recording
        },
    )
    .await;
    let files = two_image_dataset();
    let job_id = harness.submit(files.request("released")).await;

    let first = worker::run_once(harness.queue.as_ref(), &harness.orchestrator).await;
    assert!(first.is_err());
    assert_eq!(failing_lookups.load(Ordering::SeqCst), 0);
    assert_eq!(harness.queue.len().await, 1);

    // Visible again at once, without waiting out the hour-long lease
    assert_eq!(harness.run_queue().await, 1);
    assert_eq!(harness.job(job_id).await.status, JobStatus::Completed);
    assert!(harness.queue.is_empty().await);
}

#[tokio::test]
async fn worker_pool_drains_the_queue_and_stops() {
    let harness = Harness::new().await;
    let files = two_image_dataset();
    let first = harness.submit(files.request("first")).await;
    let second = harness.submit(files.request("second")).await;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        harness.queue.clone(),
        harness.orchestrator.clone(),
        Duration::from_millis(10),
    );
    let handles = pool.spawn(2, shutdown.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let a = harness.job(first).await;
        let b = harness.job(second).await;
        if a.is_terminal() && b.is_terminal() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops after cancellation")
            .unwrap();
    }

    assert_eq!(harness.job(first).await.status, JobStatus::Completed);
    assert_eq!(harness.job(second).await.status, JobStatus::Completed);
    assert_ne!(
        harness.job(first).await.dataset_id,
        harness.job(second).await.dataset_id
    );
}
