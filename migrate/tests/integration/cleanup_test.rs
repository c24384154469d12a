use migrate::cloud::CloudProvider;
use migrate::orchestrator::Orchestrator;
use migrate::test_utils::run::{TestRun, fast_config};
use migrate::types::{StageId, WorkStatus};
use telemetry::init_test_tracing;

async fn migrated(run: &TestRun) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait().await.unwrap();

    orchestrator
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_deletes_the_bucket_and_the_jump_host() {
    init_test_tracing();
    let run = TestRun::new(fast_config());
    let mut orchestrator = migrated(&run).await;
    let before = run.context().resources().get();
    assert!(run.cloud.has_bucket(&before.bucket_name));
    assert!(run.cloud.has_instance(&before.compute_id));

    orchestrator.cleanup(true, true).await.unwrap();

    assert!(!run.cloud.has_bucket(&before.bucket_name));
    assert!(!run.cloud.has_instance(&before.compute_id));
    assert!(
        run.cloud
            .deleted_prefixes()
            .contains(&(before.bucket_name.clone(), String::new()))
    );

    let after = run.context().resources().get();
    assert!(after.bucket_name.is_empty());
    assert!(!after.bucket_created);
    assert!(after.bucket_par.is_none());
    assert!(after.compute_id.is_empty());
    assert!(after.compute_public_ip.is_empty());
    assert!(!after.compute_created);
    // Everything else is kept.
    assert_eq!(after.db_system_id, before.db_system_id);

    let cleanup = orchestrator.snapshot();
    let record = cleanup.stage(StageId::Cleanup).unwrap();
    assert!(record.enabled);
    assert_eq!(record.status, WorkStatus::Finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_only_deletes_what_was_asked_for() {
    init_test_tracing();
    let run = TestRun::new(fast_config());
    let mut orchestrator = migrated(&run).await;
    let before = run.context().resources().get();

    orchestrator.cleanup(true, false).await.unwrap();

    assert!(!run.cloud.has_bucket(&before.bucket_name));
    assert!(run.cloud.has_instance(&before.compute_id));
    assert_eq!(run.cloud.calls("terminate_instance"), 0);
    let after = run.context().resources().get();
    assert_eq!(after.compute_id, before.compute_id);
    assert!(after.compute_created);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_keeps_resources_the_migration_did_not_create() {
    init_test_tracing();
    let run = TestRun::new(fast_config());
    let mut orchestrator = migrated(&run).await;
    run.context()
        .resources()
        .update(|resources| resources.bucket_created = false)
        .unwrap();
    let before = run.context().resources().get();

    orchestrator.cleanup(true, false).await.unwrap();

    assert!(run.cloud.has_bucket(&before.bucket_name));
    assert_eq!(run.cloud.calls("delete_bucket"), 0);
    assert_eq!(run.context().resources().get().bucket_name, before.bucket_name);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_tolerates_resources_deleted_elsewhere() {
    init_test_tracing();
    let run = TestRun::new(fast_config());
    let mut orchestrator = migrated(&run).await;
    let before = run.context().resources().get();
    assert!(run.cloud.delete_bucket(&before.bucket_name).await.unwrap());
    assert!(
        run.cloud
            .terminate_instance(&before.compute_id)
            .await
            .unwrap()
            .is_some()
    );

    orchestrator.cleanup(true, true).await.unwrap();

    assert_eq!(run.cloud.calls("delete_bucket"), 2);
    assert_eq!(run.cloud.calls("terminate_instance"), 2);
    let after = run.context().resources().get();
    assert!(after.bucket_name.is_empty());
    assert!(after.compute_id.is_empty());
    assert_eq!(
        orchestrator.snapshot().stage(StageId::Cleanup).unwrap().status,
        WorkStatus::Finished
    );
}
