use migrate::error::ErrorKind;
use migrate::orchestrator::Orchestrator;
use migrate::test_utils::run::{TestRun, fast_config};
use migrate::types::{StageId, WorkStatus};
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn restarted_migration_keeps_finished_work() {
    init_test_tracing();
    let work_dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.work_dir = work_dir.path().to_path_buf();
    config.export_retry.max_attempts = 1;
    let mut run = TestRun::persistent(config).unwrap();
    run.tool.script_run(Vec::new(), 2);

    // The first process fails on the export.
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    let err = orchestrator.wait().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::ExportFailed));
    drop(orchestrator);

    // A second process picks the run up from the work directory.
    run.restart().unwrap();
    let persisted = run.context().status().snapshot();
    assert_eq!(persisted.status, WorkStatus::Error);
    assert_eq!(
        persisted.stage(StageId::ProvisionBucket).unwrap().status,
        WorkStatus::Finished
    );
    assert_eq!(persisted.stage(StageId::Dump).unwrap().status, WorkStatus::Error);
    assert!(!run.context().resources().get().compartment_id.is_empty());

    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.reset().await.unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait().await.unwrap();

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Finished);
    for kind in ["compartment", "vcn", "instance", "bucket", "db_system"] {
        assert_eq!(run.cloud.created(kind), 1, "{kind}");
    }
    assert_eq!(run.tool.launches(), 2);
    assert_eq!(run.helper.load_requests().len(), 1);
    // The failure of the first attempt stays in the history.
    assert!(
        snapshot
            .errors
            .iter()
            .any(|error| error.kind == format!("{:?}", ErrorKind::ExportFailed))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_after_abort_retries_the_interrupted_stages() {
    init_test_tracing();
    let mut config = fast_config();
    config.helper.connect_attempts = u32::MAX;
    let run = TestRun::new(config);
    run.helper.fail_connects(u32::MAX);
    let helper_started = run.frontend.notify_on_status(
        StageId::ProvisionHelper,
        migrate::types::WorkStatusEvent::Begin,
    );

    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    helper_started.notified().await;
    assert!(orchestrator.abort().await.unwrap_err().is_aborted());

    // The jump host comes up.
    run.helper.fail_connects(0);
    orchestrator.reset().await.unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait().await.unwrap();

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Finished);
    assert_eq!(
        snapshot.stage(StageId::ProvisionHelper).unwrap().status,
        WorkStatus::Finished
    );
    assert_eq!(run.cloud.created("instance"), 1);
}
