//! Drives one migration: builds the stage graph, walks it on a task of its own and exposes the
//! controls a frontend needs while it runs.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::concurrency::signal::SignalRx;
use crate::error::{ErrorKind, MigrateResult};
use crate::gtid::GtidSet;
use crate::replication::{ChannelStatus, MonitorChannelStage};
use crate::stage::{StageContext, StageGraph};
use crate::status::{Transition, WorkStatusInfo};
use crate::types::StageId;

mod cleanup;
pub mod context;
pub mod plan;
pub mod provision;
pub mod sync;

pub use context::{Collaborators, RunContext};

/// Stages that only have a status record. They are never part of the graph, cleanup records
/// the runs of [`Orchestrator::cleanup`].
const RECORD_ONLY_STAGES: [StageId; 2] = [StageId::Cleanup, StageId::FinalSummary];

pub struct Orchestrator {
    run: RunContext,
    graph: Arc<Mutex<StageGraph>>,
    monitor: Arc<MonitorChannelStage>,
    shutdown_tx: ShutdownTx,
    walk: Option<JoinHandle<MigrateResult<()>>>,
}

impl Orchestrator {
    pub fn new(run: RunContext) -> MigrateResult<Self> {
        let monitor = Arc::new(MonitorChannelStage::new());
        let graph = plan::build_graph(Arc::clone(&monitor))?;
        let (shutdown_tx, _) = create_shutdown_channel();

        Ok(Self {
            run,
            graph: Arc::new(Mutex::new(graph)),
            monitor,
            shutdown_tx,
            walk: None,
        })
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Returns `true` while a walk is in progress.
    pub fn is_running(&self) -> bool {
        self.walk.as_ref().is_some_and(|walk| !walk.is_finished())
    }

    fn graph(&self) -> MigrateResult<tokio::sync::MutexGuard<'_, StageGraph>> {
        match self.graph.try_lock() {
            Ok(graph) => Ok(graph),
            Err(_) => bail!(
                ErrorKind::InvalidState,
                "Migration is running",
                "The stage graph cannot be changed while it is walked"
            ),
        }
    }

    /// Decides which stages take part in this run and records it in the status document.
    pub fn prepare(&self) -> MigrateResult<()> {
        let options = &self.run.config().options;
        let enablement = self.graph()?.prepare(options);

        let status = self.run.status();
        for (id, enabled) in enablement {
            if id.is_work_stage() {
                status.set_enabled(id, enabled)?;
            }
        }
        for id in RECORD_ONLY_STAGES {
            status.set_enabled(id, false)?;
        }

        info!(
            migration_type = ?options.migration_type,
            connectivity = ?options.cloud_connectivity,
            "prepared migration"
        );

        Ok(())
    }

    /// Re-arms the run for another walk.
    ///
    /// Stages that finished, in this process or in an earlier one according to the persisted
    /// status, stay finished. Everything else is retried by the next walk.
    pub async fn reset(&mut self) -> MigrateResult<()> {
        let mut graph = self.graph()?;

        // Stages look at how far the previous attempt got, before the records are re-armed.
        let status = self.run.status();
        graph.reset(&status.snapshot());
        status.reset_unfinished()?;
        drop(graph);

        self.walk = None;
        self.shutdown_tx.rearm();
        self.run.disconnect_helper().await;

        info!(run_id = %self.run.run_id(), "migration was reset");

        Ok(())
    }

    /// Starts walking the graph on a task of its own and returns right away.
    pub fn start(&mut self) -> MigrateResult<()> {
        let graph = match Arc::clone(&self.graph).try_lock_owned() {
            Ok(graph) => graph,
            Err(_) => bail!(
                ErrorKind::InvalidState,
                "Migration is already running",
                "Wait for the current walk to end before starting another one"
            ),
        };

        info!(run_id = %self.run.run_id(), "starting migration");
        let walk = tokio::spawn(drive(graph, self.run.clone(), self.shutdown_tx.subscribe()));
        self.walk = Some(walk);

        Ok(())
    }

    /// Waits for the current walk to end and returns its outcome.
    pub async fn wait(&mut self) -> MigrateResult<()> {
        let Some(walk) = self.walk.take() else {
            info!("migration was not started, nothing to wait for");
            return Ok(());
        };

        walk.await?
    }

    /// Asks every running stage to stop. Returns without waiting for them.
    pub fn stop(&self) {
        info!("stopping migration");
        self.shutdown_tx.shutdown();
    }

    /// Stops the migration and waits for the walk to end.
    pub async fn abort(&mut self) -> MigrateResult<()> {
        self.stop();
        self.wait().await
    }

    /// Ends replication monitoring: the user switched the applications over to the target.
    pub fn complete_sync(&self) {
        self.monitor.complete_sync();
    }

    /// Queues transactions the replication channel should skip, e.g. `uuid:7,uuid:9-10`.
    pub fn skip_gtids(&self, gtids: &str) -> MigrateResult<()> {
        let set: GtidSet = gtids.parse()?;
        if set.is_empty() {
            bail!(
                ErrorKind::InvalidData,
                "No transactions to skip",
                format!("'{gtids}' does not name any transaction")
            );
        }

        self.monitor.skip_gtids(set.to_string());

        Ok(())
    }

    /// Deletes the bucket and the jump host when asked to and when this migration created them.
    ///
    /// Runs under [`StageId::Cleanup`] and is refused while a walk is in progress. Resources that
    /// are already gone are skipped.
    pub async fn cleanup(
        &mut self,
        delete_bucket: bool,
        delete_jump_host: bool,
    ) -> MigrateResult<()> {
        if self.is_running() {
            bail!(
                ErrorKind::InvalidState,
                "Migration is running",
                "Resources can only be cleaned up once the migration stopped"
            );
        }

        self.shutdown_tx.rearm();
        self.run.status().set_enabled(StageId::Cleanup, true)?;

        let ctx = StageContext::new(
            StageId::Cleanup,
            self.run.clone(),
            self.shutdown_tx.subscribe(),
        );
        ctx.push_status(Transition::begin().with_message("Cleaning up cloud resources"))?;

        match cleanup::clean_up(&ctx, delete_bucket, delete_jump_host).await {
            Ok(()) => {
                ctx.push_status(Transition::end().with_message("Clean up completed"))?;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "clean up failed");
                ctx.report_failure(&err);
                Err(err)
            }
        }
    }

    /// Returns a copy of the status document, including the summary of the run.
    pub fn snapshot(&self) -> WorkStatusInfo {
        let mut snapshot = self.run.status().snapshot();
        snapshot.summary = self.run.summary();

        snapshot
    }

    /// Returns a receiver notified after every change of the status document.
    pub fn subscribe(&self) -> SignalRx {
        self.run.status().subscribe()
    }

    /// Returns the last status reported for the replication channel.
    pub fn channel_status(&self) -> Option<ChannelStatus> {
        self.monitor.last_report()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run", &self.run)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("orchestrator dropped while the migration is running, stopping it");
            self.shutdown_tx.shutdown();
        }
    }
}

/// Body of the walk task. Records the overall outcome under [`StageId::Orchestration`].
async fn drive(
    mut graph: OwnedMutexGuard<StageGraph>,
    run: RunContext,
    shutdown: ShutdownRx,
) -> MigrateResult<()> {
    let ctx = StageContext::new(StageId::Orchestration, run.clone(), shutdown.clone());
    ctx.push_status(Transition::begin().with_message("Migration started"))?;

    let result = graph.walk(&run, &shutdown).await;

    match &result {
        Ok(()) => {
            info!("migration completed");
            ctx.push_status_or_log(Transition::end().with_message("Migration completed"));
        }
        Err(err) if err.is_aborted() => {
            info!("migration was aborted");
            ctx.push_status_or_log(Transition::aborted().with_message("Migration aborted"));
        }
        Err(err) => {
            error!(error = %err, "migration failed");

            // Stages waiting on a failed one only echo it.
            let errors = err.to_stage_errors();
            let causes: Vec<_> = errors
                .iter()
                .filter(|error| error.kind != format!("{:?}", ErrorKind::DependencyFailed))
                .cloned()
                .collect();
            let errors = if causes.is_empty() { errors } else { causes };

            ctx.push_status_or_log(Transition::error(errors));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use config::shared::MigrationType;

    use super::*;
    use crate::test_utils::run::{TestRun, fast_config};
    use crate::types::WorkStatus;

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_migration_runs_to_completion() {
        let run = TestRun::new(fast_config());
        run.tool.script_success();
        run.helper.script_successful_load();

        let mut orchestrator = Orchestrator::new(run.context()).unwrap();
        orchestrator.prepare().unwrap();
        orchestrator.start().unwrap();
        orchestrator.wait().await.unwrap();

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.status, WorkStatus::Finished);
        for id in [StageId::ProvisionDbSystem, StageId::Dump, StageId::Load, StageId::Congrats] {
            assert_eq!(
                snapshot.stage(id).unwrap().status,
                WorkStatus::Finished,
                "{id}"
            );
        }
        let channel = snapshot.stage(StageId::CreateChannel).unwrap();
        assert!(!channel.enabled);
        assert_eq!(channel.status, WorkStatus::NotStarted);
        assert!(!snapshot.summary.db_system_id.is_empty());
        assert_eq!(snapshot.summary.migration_type, MigrationType::Cold);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_are_recorded_once_with_their_cause() {
        let run = TestRun::new(fast_config());
        run.tool.script_run(Vec::new(), 2);
        run.helper.script_successful_load();

        let mut orchestrator = Orchestrator::new(run.context()).unwrap();
        orchestrator.prepare().unwrap();
        orchestrator.start().unwrap();
        let err = orchestrator.wait().await.unwrap_err();

        assert!(err.kinds().contains(&ErrorKind::ExportFailed));
        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.status, WorkStatus::Error);
        assert!(
            snapshot
                .errors
                .iter()
                .all(|error| error.kind != "DependencyFailed")
        );
        assert_eq!(
            snapshot.stage(StageId::Dump).unwrap().status,
            WorkStatus::Error
        );
    }

    #[tokio::test]
    async fn graph_cannot_change_while_walked() {
        let run = TestRun::new(fast_config());
        let mut orchestrator = Orchestrator::new(run.context()).unwrap();

        let _held = orchestrator.graph.clone().try_lock_owned().unwrap();

        assert_eq!(
            orchestrator.prepare().unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            orchestrator.start().unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[tokio::test]
    async fn skipped_transactions_must_parse() {
        let run = TestRun::new(fast_config());
        let orchestrator = Orchestrator::new(run.context()).unwrap();

        assert_eq!(
            orchestrator.skip_gtids("").unwrap_err().kind(),
            ErrorKind::InvalidData
        );
        assert_eq!(
            orchestrator.skip_gtids("uuid:x").unwrap_err().kind(),
            ErrorKind::GtidParseError
        );
        orchestrator.skip_gtids("uuid:7").unwrap();
    }

    #[tokio::test]
    async fn waiting_without_a_walk_returns_right_away() {
        let run = TestRun::new(fast_config());
        let mut orchestrator = Orchestrator::new(run.context()).unwrap();

        orchestrator.wait().await.unwrap();
        assert!(!orchestrator.is_running());
    }
}
