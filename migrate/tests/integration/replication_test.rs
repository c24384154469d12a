use std::time::Duration;

use migrate::cloud::LifecycleState;
use migrate::orchestrator::Orchestrator;
use migrate::test_utils::run::{SOURCE_HOST, TestRun, hot_config};
use migrate::test_utils::source::SOURCE_SERVER_UUID;
use migrate::types::{ReplicationStatus, StageId, WorkStatus, WorkStatusEvent};
use serde_json::{Value, json};
use telemetry::init_test_tracing;
use tokio::time::{Instant, sleep};

const G: &str = SOURCE_SERVER_UUID;

fn channel_status(executed: &str, broken: Option<&str>) -> Value {
    let applier = match broken {
        Some(transaction) => json!([{
            "LAST_ERROR_NUMBER": 1062,
            "LAST_ERROR_MESSAGE": "Duplicate entry '7' for key 'PRIMARY'",
            "APPLYING_TRANSACTION": format!("{G}:{transaction}"),
        }]),
        None => json!([{"LAST_ERROR_NUMBER": 0}]),
    };

    json!({
        "gtid_executed": format!("{G}:{executed}"),
        "gtid_received": format!("{G}:1-11"),
        "connection_status": [{"SERVICE_STATE": "ON", "LAST_ERROR_NUMBER": 0}],
        "applier_status_by_worker": applier,
    })
}

/// Waits until `condition` holds, failing the test after a few seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn hot_migration_replicates_until_the_sync_is_completed() {
    init_test_tracing();
    let run = TestRun::new(hot_config());
    run.helper.set_channel_status(channel_status("1-11", None));
    let monitoring = run
        .frontend
        .notify_on_status(StageId::MonitorChannel, WorkStatusEvent::Begin);

    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    monitoring.notified().await;

    eventually("the first channel report", || {
        orchestrator.channel_status().is_some()
    })
    .await;
    assert_eq!(
        orchestrator.channel_status().unwrap().status,
        ReplicationStatus::Active
    );
    // The user is told to switch over once the channel runs.
    eventually("the migration to be ready", || {
        orchestrator.snapshot().status == WorkStatus::Ready
    })
    .await;

    orchestrator.complete_sync();
    orchestrator.wait().await.unwrap();

    let snapshot = orchestrator.snapshot();
    assert_eq!(snapshot.status, WorkStatus::Finished);
    assert_eq!(run.cloud.created("channel"), 1);
    let spec = run.cloud.last_channel_spec().unwrap();
    assert_eq!(spec.source_host, SOURCE_HOST);
    assert!(
        run.helper
            .database_connections()
            .contains(&("source".to_owned(), SOURCE_HOST.to_owned()))
    );
    assert_eq!(
        snapshot.stage(StageId::MonitorChannel).unwrap().status,
        WorkStatus::Finished
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn skipped_transactions_let_the_channel_resume_once() {
    init_test_tracing();
    let run = TestRun::new(hot_config());
    run.helper.set_channel_status(channel_status("1-10", None));
    let monitoring = run
        .frontend
        .notify_on_status(StageId::MonitorChannel, WorkStatusEvent::Begin);

    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();
    monitoring.notified().await;

    // Transaction 11 breaks the applier and the control plane flags the channel.
    let channel_id = run.context().resources().get().channel_id;
    run.helper.set_channel_status(channel_status("1-10", Some("11")));
    run.cloud
        .set_channel_state(&channel_id, LifecycleState::NeedsAttention);
    eventually("the applier error to be reported", || {
        orchestrator
            .channel_status()
            .is_some_and(|report| report.status == ReplicationStatus::ApplierError)
    })
    .await;
    assert_eq!(run.cloud.calls("resume_channel"), 0);

    // The user skips it, the target then reports it as executed.
    orchestrator.skip_gtids(&format!("{G}:11")).unwrap();
    eventually("the skip to reach the target", || {
        !run.helper.skipped_gtids().is_empty()
    })
    .await;
    run.helper.set_channel_status(channel_status("1-11", Some("11")));

    eventually("the channel to be resumed", || {
        run.cloud.calls("resume_channel") == 1
    })
    .await;
    assert_eq!(
        run.cloud.channel(&channel_id).unwrap().state,
        LifecycleState::Active
    );

    run.helper.set_channel_status(channel_status("1-11", None));
    sleep(Duration::from_millis(50)).await;

    orchestrator.complete_sync();
    orchestrator.wait().await.unwrap();

    assert_eq!(run.helper.skipped_gtids(), vec![format!("{G}:11")]);
    assert_eq!(run.cloud.calls("resume_channel"), 1);
    assert_eq!(orchestrator.snapshot().status, WorkStatus::Finished);
}

#[tokio::test(flavor = "multi_thread")]
async fn throttled_channel_reads_do_not_stop_the_supervision() {
    init_test_tracing();
    let run = TestRun::new(hot_config());
    run.helper.set_channel_status(channel_status("1-11", None));
    run.cloud.fail_transiently("get_channel", 3);

    let mut orchestrator = Orchestrator::new(run.context()).unwrap();
    orchestrator.prepare().unwrap();
    orchestrator.start().unwrap();

    eventually("the channel to be read past the throttling", || {
        run.cloud.calls("get_channel") >= 4
    })
    .await;
    eventually("the migration to be ready", || {
        orchestrator.snapshot().status == WorkStatus::Ready
    })
    .await;

    orchestrator.complete_sync();
    orchestrator.wait().await.unwrap();

    let snapshot = orchestrator.snapshot();
    assert_eq!(
        snapshot.stage(StageId::MonitorChannel).unwrap().status,
        WorkStatus::Finished
    );
    assert!(snapshot.errors.is_empty());
}
