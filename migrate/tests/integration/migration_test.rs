use migrate::orchestrator::Orchestrator;
use migrate::status::WorkStatusInfo;
use migrate::test_utils::run::{TestRun, fast_config};
use migrate::types::{StageId, WorkStatus, WorkStatusEvent};
use serde_json::json;
use telemetry::init_test_tracing;

async fn run_to_completion(run: &TestRun) -> WorkStatusInfo {
    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    orchestrator.wait().await.unwrap();

    orchestrator.snapshot()
}

#[tokio::test(flavor = "multi_thread")]
async fn cold_migration_provisions_exports_and_imports() {
    init_test_tracing();
    let run = TestRun::new(fast_config());

    let snapshot = run_to_completion(&run).await;

    assert_eq!(snapshot.status, WorkStatus::Finished);
    for kind in ["compartment", "vcn", "instance", "bucket", "db_system"] {
        assert_eq!(run.cloud.created(kind), 1, "{kind}");
    }
    assert_eq!(run.cloud.created("channel"), 0);
    assert_eq!(run.cloud.calls("enable_crash_recovery"), 1);
    assert_eq!(run.tool.launches(), 1);
    assert_eq!(run.helper.load_requests().len(), 1);

    // The helper was first asked to reach the target at the address of the DB System.
    let resources = run.context().resources().get();
    assert_eq!(
        run.helper.database_connections(),
        vec![("target".to_owned(), resources.db_system_ip.clone())]
    );
    assert_eq!(
        run.frontend.messages(StageId::Congrats),
        vec![json!({
            "dbSystemName": run.context().config().options.names.db_system,
            "dbSystemIP": resources.db_system_ip,
        })]
    );
    assert_eq!(
        run.frontend.statuses(StageId::Orchestration),
        vec![WorkStatusEvent::Begin, WorkStatusEvent::End]
    );
    assert!(snapshot.errors.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn optional_stages_run_when_requested() {
    init_test_tracing();
    let mut config = fast_config();
    config.options.enable_ha = true;
    config.options.enable_heatwave = true;
    let run = TestRun::new(config);

    let snapshot = run_to_completion(&run).await;

    assert_eq!(snapshot.status, WorkStatus::Finished);
    assert_eq!(run.cloud.calls("enable_high_availability"), 1);
    assert_eq!(run.cloud.calls("add_heat_wave_cluster"), 1);
    for id in [StageId::EnableHa, StageId::ProvisionHeatWaveCluster] {
        let record = snapshot.stage(id).unwrap();
        assert!(record.enabled, "{id}");
        assert_eq!(record.status, WorkStatus::Finished, "{id}");
    }

    let resources = run.context().resources().get();
    assert!(resources.ha_enabled);
    assert!(resources.heat_wave_cluster_created);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_export_failures_are_retried() {
    init_test_tracing();
    let mut config = fast_config();
    config.export_retry.max_attempts = 3;
    let run = TestRun::new(config);
    let unavailable =
        json!({"exceptionInfo": {"exception": {"code": 54503, "message": "Service Unavailable"}}});
    run.tool.script_run(vec![unavailable.to_string()], 1);
    run.tool.script_success();

    let snapshot = run_to_completion(&run).await;

    assert_eq!(snapshot.status, WorkStatus::Finished);
    assert_eq!(run.tool.launches(), 2);
    assert_eq!(run.cloud.deleted_prefixes().len(), 1);
    assert_eq!(run.helper.load_requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_aborts_the_migration() {
    init_test_tracing();
    let mut config = fast_config();
    config.helper.connect_attempts = u32::MAX;
    let run = TestRun::new(config);
    // The jump host never answers, the migration waits for it until stopped.
    run.helper.fail_connects(u32::MAX);
    let helper_started = run
        .frontend
        .notify_on_status(StageId::ProvisionHelper, WorkStatusEvent::Begin);

    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    helper_started.notified().await;

    let err = orchestrator.abort().await.unwrap_err();

    assert!(err.is_aborted());
    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Aborted);
    assert_eq!(
        snapshot.stage(StageId::ProvisionHelper).unwrap().status,
        WorkStatus::Aborted
    );
}
