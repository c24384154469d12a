use migrate::error::ErrorKind;
use migrate::failpoints::{CLOUD__BEFORE_CALL, EXPORT__BEFORE_LAUNCH, SUPERVISOR__BEFORE_CYCLE};
use migrate::orchestrator::Orchestrator;
use migrate::test_utils::failpoints::CustomFailScenario;
use migrate::test_utils::run::{TestRun, fast_config, hot_config};
use migrate::types::{StageId, WorkStatus};
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn injected_stage_failure_is_recorded_on_the_stage() {
    init_test_tracing();
    let _scenario = CustomFailScenario::fail_stage(StageId::ProvisionDbSystem, "return");

    let run = TestRun::new(fast_config());
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    let err = orchestrator.wait().await.unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::InjectedFailure));
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Error);
    assert_eq!(
        snapshot.stage(StageId::ProvisionDbSystem).unwrap().status,
        WorkStatus::Error
    );
    assert!(snapshot.errors.iter().any(|error| error.kind == "InjectedFailure"));
    assert_eq!(run.cloud.created("db_system"), 0);

    // The export does not depend on the DB system.
    assert_eq!(
        snapshot.stage(StageId::Dump).unwrap().status,
        WorkStatus::Finished
    );
    assert!(run.helper.load_requests().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_before_the_export_launch_is_not_retried() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(EXPORT__BEFORE_LAUNCH, "return")]);

    let mut config = fast_config();
    config.export_retry.max_attempts = 3;
    let run = TestRun::new(config);
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    let err = orchestrator.wait().await.unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::InjectedFailure));
    assert_eq!(run.tool.launches(), 0);
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.stage(StageId::Dump).unwrap().status, WorkStatus::Error);
    assert_eq!(snapshot.stage(StageId::Load).unwrap().status, WorkStatus::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn supervisor_failure_ends_the_replication_stage_only() {
    init_test_tracing();
    let _scenario =
        CustomFailScenario::setup(&[(SUPERVISOR__BEFORE_CYCLE, "return(transient)")]);

    let run = TestRun::new(hot_config());
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    let err = orchestrator.wait().await.unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::CloudApiTransient));
    let snapshot = orchestrator.snapshot();
    assert_eq!(
        snapshot.stage(StageId::MonitorChannel).unwrap().status,
        WorkStatus::Error
    );
    assert_eq!(
        snapshot.stage(StageId::Congrats).unwrap().status,
        WorkStatus::Finished
    );
    assert_eq!(run.cloud.created("channel"), 1);
    assert_eq!(run.cloud.calls("resume_channel"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_recovers_once_the_fail_point_is_switched_off() {
    init_test_tracing();
    let mut scenario = CustomFailScenario::fail_stage(StageId::ProvisionBucket, "return");

    let run = TestRun::new(fast_config());
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    assert!(orchestrator.wait().await.is_err());
    assert_eq!(run.tool.launches(), 0);

    scenario.configure("stage_worker.before_run.PROVISION_BUCKET", "off");
    orchestrator.reset().await.unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait().await.unwrap();

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Finished);
    assert_eq!(run.cloud.created("bucket"), 1);
    assert_eq!(run.cloud.created("db_system"), 1);
    assert_eq!(run.tool.launches(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_cloud_errors_are_retried_within_the_stage() {
    init_test_tracing();
    let _scenario =
        CustomFailScenario::setup(&[(CLOUD__BEFORE_CALL, "2*return(transient)->off")]);

    let run = TestRun::new(fast_config());
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait().await.unwrap();

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Finished);
    assert!(snapshot.errors.is_empty());
    assert_eq!(run.cloud.created("compartment"), 1);
    assert_eq!(run.cloud.created("db_system"), 1);
    assert_eq!(run.tool.launches(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_cloud_errors_fail_the_stage_once_retries_are_spent() {
    init_test_tracing();
    let _scenario = CustomFailScenario::setup(&[(CLOUD__BEFORE_CALL, "return(transient)")]);

    let mut config = fast_config();
    config.cloud_retry.max_attempts = 3;
    let run = TestRun::new(config);
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    let err = orchestrator.wait().await.unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::CloudApiTransient));
    let snapshot = orchestrator.snapshot();
    assert_eq!(
        snapshot.stage(StageId::ProvisionCompartment).unwrap().status,
        WorkStatus::Error
    );
    assert_eq!(run.cloud.created("compartment"), 0);
}
