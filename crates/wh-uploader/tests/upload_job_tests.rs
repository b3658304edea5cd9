//! End-to-end upload-job scenarios over the in-memory store and scripted
//! collaborators

mod helpers;

use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use helpers::*;
use wh_uploader::config::UploaderConfig;
use wh_uploader::error::UploadError;
use wh_uploader::metrics::{
    METRIC_LOAD_FILES_GENERATED, METRIC_LONG_RUNNING_UPLOAD, METRIC_UPLOAD_ABORTED,
    METRIC_UPLOAD_COMPLETED,
};
use wh_uploader::model::TableUploadStatus;
use wh_uploader::schema::{ColumnType, Schema};
use wh_uploader::state::UploadStage;
use wh_uploader::store::UploadStore;

#[tokio::test]
async fn happy_path_single_table() {
    let rig = Rig::new();
    let staging = vec![
        staging_file(10, events_schema()),
        staging_file(11, events_schema()),
    ];
    let mut job = rig.job(upload_row(1, Schema::new()), staging);

    job.run().await.expect("upload should complete");

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "exported_data");
    assert_eq!(row.schema, events_schema());

    // One in-progress and one completed entry per productive stage, in
    // non-decreasing time order.
    assert_eq!(row.timings.len(), 16);
    for stage in UploadStage::ALL {
        assert!(row.timings.contains_status(stage.in_progress_status()));
        assert!(row.timings.contains_status(stage.completed_status()));
    }
    let times: Vec<_> = row.timings.iter().map(|e| e.at).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    // Both staging files produced one events load file each.
    assert_eq!(row.load_file_range(), Some((100, 101)));
    let events = rig.store.table_upload(1, "events").await.unwrap().unwrap();
    assert_eq!(events.status, "exported_data");
    assert_eq!(events.total_events, Some(2));
    assert!(events.location.is_some());

    assert_eq!(rig.manager.create_schema_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *rig.manager.created_tables.lock().unwrap(),
        vec!["events".to_string()]
    );
    assert_eq!(
        *rig.manager.loaded_tables.lock().unwrap(),
        vec!["events".to_string()]
    );
    assert_eq!(rig.manager.setup_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.manager.cleanup_calls.load(Ordering::SeqCst), 1);

    for id in [10, 11] {
        assert_eq!(rig.store.staging_file(id).unwrap().status, "succeeded");
    }

    assert_eq!(rig.metrics.count(METRIC_UPLOAD_COMPLETED), 1);
    assert_eq!(rig.metrics.count(METRIC_LOAD_FILES_GENERATED), 2);
    assert_eq!(rig.metrics.count(METRIC_UPLOAD_ABORTED), 0);
}

#[tokio::test]
async fn completed_upload_reruns_as_noop() {
    let rig = Rig::new();
    let mut job = rig.job(
        upload_row(1, Schema::new()),
        vec![staging_file(10, events_schema())],
    );
    job.run().await.unwrap();
    let timings_after_first = rig.store.upload(1).unwrap().timings.len();

    let upload = rig.store.upload(1).unwrap();
    let mut job = rig.job(upload, vec![staging_file(10, events_schema())]);
    job.run().await.unwrap();

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "exported_data");
    assert_eq!(row.timings.len(), timings_after_first);
    assert_eq!(rig.metrics.count(METRIC_UPLOAD_COMPLETED), 1);
}

#[tokio::test]
async fn schema_change_restarts_from_first_stage() {
    let rig = Rig::new();

    // The local snapshot knows one column; the live warehouse grew another.
    let cached = schema_of(&[("events", &[("id", ColumnType::String)])]);
    rig.store
        .save_namespace_schema("src-1", "dst-1", "analytics", &cached)
        .await
        .unwrap();
    rig.manager.set_remote_schema(schema_of(&[(
        "events",
        &[("id", ColumnType::String), ("plan", ColumnType::String)],
    )]));

    let mut upload = upload_row(1, events_schema());
    upload.status = "generated_load_files".into();
    let mut job = rig.job(upload, vec![staging_file(10, events_schema())]);

    job.run().await.expect("upload should complete");

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "exported_data");
    // Resumption ignored the persisted stage and restarted at the first
    // productive stage.
    assert_eq!(row.timings.first().unwrap().status, "generating_upload_schema");

    // The known column kept its warehouse type, the new one was added.
    assert!(rig
        .manager
        .added_columns
        .lock()
        .unwrap()
        .contains(&("events".to_string(), "received_at".to_string())));
    assert_eq!(rig.manager.create_schema_calls.load(Ordering::SeqCst), 0);

    // The local cache converged onto the live warehouse.
    let cache = rig.store.namespace_schema("dst-1", "analytics").await.unwrap();
    assert_eq!(cache, rig.manager.remote_schema.lock().unwrap().clone());
}

#[tokio::test]
async fn partial_failure_marks_table_and_stage() {
    let rig = Rig::new();
    let schema = schema_of(&[
        ("orders", &[("id", ColumnType::String)]),
        ("shipments", &[("id", ColumnType::String)]),
    ]);
    rig.manager
        .fail_load_of("shipments", "connection reset by peer");

    let mut job = rig.job(upload_row(1, Schema::new()), vec![staging_file(10, schema)]);
    let err = job.run().await.expect_err("stage should fail");
    assert!(matches!(err, UploadError::TableLoads(_)));

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "failed_exporting_data");

    // Both tables were attempted.
    let orders = rig.store.table_upload(1, "orders").await.unwrap().unwrap();
    assert_eq!(orders.status, "exported_data");
    let shipments = rig.store.table_upload(1, "shipments").await.unwrap().unwrap();
    assert_eq!(shipments.status, "exporting_data_failed");
    assert!(shipments.error.unwrap().contains("connection reset by peer"));

    let failure = row.error.stage("exporting_data").unwrap();
    assert_eq!(failure.attempt, 1);
    assert_eq!(failure.errors.len(), 1);
    assert!(failure.errors[0].contains("shipments"));
    assert!(failure.errors[0].contains("connection reset by peer"));

    assert!(row.metadata.get("next_retry_time").is_some());
    assert_eq!(rig.metrics.count(METRIC_UPLOAD_ABORTED), 0);
}

#[tokio::test]
async fn exhausted_retries_outside_window_abort() {
    let rig = Rig::new();
    let schema = schema_of(&[
        ("orders", &[("id", ColumnType::String)]),
        ("shipments", &[("id", ColumnType::String)]),
    ]);
    rig.manager.fail_load_of("shipments", "disk full");

    let mut upload = upload_row(1, schema.clone());
    upload.status = "failed_exporting_data".into();
    upload.start_load_file_id = Some(100);
    upload.end_load_file_id = Some(101);
    // Four prior attempts, the first of them well outside the retry window.
    for _ in 0..4 {
        upload.error.record("exporting_data", "disk full");
    }
    upload
        .timings
        .push("exporting_data", Utc::now() - Duration::hours(4));

    rig.store.insert_load_files(vec![
        load_file(100, 10, "orders"),
        load_file(101, 10, "shipments"),
    ]);

    let mut job = rig.job(upload, vec![staging_file(10, schema)]);
    rig.store
        .create_table_uploads(1, &["orders".to_string(), "shipments".to_string()])
        .await
        .unwrap();

    job.run().await.expect_err("stage should fail");

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "aborted");
    assert_eq!(row.error.attempts("exporting_data"), 5);
    assert_eq!(rig.metrics.count(METRIC_UPLOAD_ABORTED), 1);
}

#[tokio::test]
async fn previously_failed_table_is_skipped_and_reported() {
    let rig = Rig::new();

    // Upload 1 left table c failed and is itself not terminal.
    let mut u1 = upload_row(1, schema_of(&[("c", &[("id", ColumnType::String)])]));
    u1.status = "failed_exporting_data".into();
    rig.store.insert_upload(u1);
    rig.store
        .create_table_uploads(1, &["c".to_string()])
        .await
        .unwrap();
    rig.store
        .set_table_upload_error(1, "c", TableUploadStatus::ExportingDataFailed, "boom")
        .await
        .unwrap();

    let schema = schema_of(&[
        ("c", &[("id", ColumnType::String)]),
        ("d", &[("id", ColumnType::String)]),
    ]);
    let mut job = rig.job(upload_row(2, Schema::new()), vec![staging_file(20, schema)]);
    job.run().await.expect_err("stage should fail");

    let row = rig.store.upload(2).unwrap();
    assert_eq!(row.status, "failed_exporting_data");
    let failure = row.error.stage("exporting_data").unwrap();
    assert!(failure.errors[0]
        .contains("skipping the following tables because they failed previously: [c]"));

    // d loaded, c never reached the driver.
    assert_eq!(
        *rig.manager.loaded_tables.lock().unwrap(),
        vec!["d".to_string()]
    );
    let c = rig.store.table_upload(2, "c").await.unwrap().unwrap();
    assert_eq!(c.status, "waiting");
    let d = rig.store.table_upload(2, "d").await.unwrap().unwrap();
    assert_eq!(d.status, "exported_data");
}

#[tokio::test]
async fn aborted_workers_fail_load_file_generation() {
    let rig = Rig::new();
    rig.notifier.set_mode(NotifierMode::AbortAll);

    let mut job = rig.job(
        upload_row(1, Schema::new()),
        vec![staging_file(10, events_schema())],
    );
    let err = job.run().await.expect_err("stage should fail");
    assert!(matches!(err, UploadError::NoLoadFilesGenerated));

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "failed_generating_load_files");
    assert_eq!(row.error.attempts("generating_load_files"), 1);
    assert_eq!(rig.store.staging_file(10).unwrap().status, "failed");
}

#[tokio::test]
async fn user_tables_load_through_the_atomic_driver_call() {
    let rig = Rig::new();
    let schema = schema_of(&[
        ("events", &[("id", ColumnType::String)]),
        ("identifies", &[("user_id", ColumnType::String)]),
        ("users", &[("user_id", ColumnType::String)]),
    ]);

    let mut job = rig.job(upload_row(1, Schema::new()), vec![staging_file(10, schema)]);
    job.run().await.expect("upload should complete");

    assert_eq!(rig.manager.user_table_load_calls.load(Ordering::SeqCst), 1);
    for table in ["identifies", "users"] {
        let tu = rig.store.table_upload(1, table).await.unwrap().unwrap();
        assert_eq!(tu.status, "exported_data", "table {table}");
    }
    // The final stage only drove the regular table.
    assert_eq!(
        *rig.manager.loaded_tables.lock().unwrap(),
        vec!["events".to_string()]
    );
}

#[tokio::test]
async fn identity_tables_resolve_then_load() {
    let mut config = UploaderConfig::default();
    config.id_resolution_enabled = true;
    let rig = Rig::with_config(config);

    let schema = schema_of(&[
        ("events", &[("id", ColumnType::String)]),
        (
            "rudder_identity_merge_rules",
            &[("merge_property_1_type", ColumnType::String)],
        ),
    ]);
    let mut job = rig.job(upload_row(1, Schema::new()), vec![staging_file(10, schema)]);
    job.run().await.expect("upload should complete");

    assert_eq!(rig.resolver.resolve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.resolver.historic_calls.load(Ordering::SeqCst), 0);
    assert_eq!(rig.manager.merge_rules_load_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.manager.mappings_load_calls.load(Ordering::SeqCst), 1);

    for table in ["rudder_identity_merge_rules", "rudder_identity_mappings"] {
        let tu = rig.store.table_upload(1, table).await.unwrap().unwrap();
        assert_eq!(tu.status, "exported_data", "table {table}");
    }
    assert_eq!(
        *rig.manager.loaded_tables.lock().unwrap(),
        vec!["events".to_string()]
    );
}

#[tokio::test]
async fn empty_staging_set_fails_internal_processing() {
    let rig = Rig::new();
    let mut job = rig.job(upload_row(1, Schema::new()), vec![]);

    let err = job.run().await.expect_err("job should fail");
    assert!(matches!(err, UploadError::InternalProcessing(_)));

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "internal_processing_failed");
    assert_eq!(row.error.attempts("internal_processing_failed"), 1);
}

#[tokio::test]
async fn schema_fetch_failure_uses_its_own_label() {
    let rig = Rig::new();
    rig.manager.fail_fetch.store(true, Ordering::SeqCst);

    let mut job = rig.job(
        upload_row(1, Schema::new()),
        vec![staging_file(10, events_schema())],
    );
    let err = job.run().await.expect_err("job should fail");
    assert!(matches!(err, UploadError::FetchingRemoteSchema(_)));

    let row = rig.store.upload(1).unwrap();
    assert_eq!(row.status, "fetching_remote_schema_failed");
    assert_eq!(row.error.attempts("fetching_remote_schema_failed"), 1);
}

#[tokio::test]
async fn long_running_watchdog_fires_once_without_failing_the_job() {
    let mut config = UploaderConfig::default();
    config.long_running_threshold = StdDuration::from_millis(10);
    let rig = Rig::with_config(config);
    *rig.manager.load_delay.lock().unwrap() = Some(StdDuration::from_millis(150));

    let mut job = rig.job(
        upload_row(1, Schema::new()),
        vec![staging_file(10, events_schema())],
    );
    job.run().await.expect("upload should complete");

    assert_eq!(rig.metrics.count(METRIC_LONG_RUNNING_UPLOAD), 1);
    assert_eq!(rig.store.upload(1).unwrap().status, "exported_data");
}
