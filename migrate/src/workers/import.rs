use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{error, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownResult;
use crate::error::{ErrorKind, MigrateError, MigrateResult};
use crate::migrate_error;
use crate::persist::lock;
use crate::remote::{HelperClient, LoadDumpRequest};
use crate::stage::{Stage, StageContext, StageKind};
use crate::status::{Progress, Transition, WorkStatusInfo};
use crate::types::StageId;
use crate::workers::export::DumpStatus;
use crate::workers::tool::{LoadProgress, ToolException, ToolMessage};

/// Moves the executed transactions recorded in the dump into `gtid_purged` of the target, so
/// that replication resumes right after them.
const SET_GTID_PURGED: &str = "call sys.set_gtid_purged(concat('+', gtid_subtract(?, @@gtid_purged)))";

/// Phase of the import. Ordered like [`DumpStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LoadStatus {
    Ready = 1,
    Starting = 2,
    DdlSchemas = 3,
    DdlTables = 4,
    DdlViews = 5,
    LoadingData = 6,
    DdlIndexes = 7,
    PostWork = 8,
    Done = 9,
    Error = 10,
}

/// Share of the overall import progress each phase accounts for.
const PHASE_WEIGHTS: [(LoadStatus, f64); 5] = [
    (LoadStatus::DdlSchemas, 5.0),
    (LoadStatus::DdlTables, 5.0),
    (LoadStatus::DdlViews, 5.0),
    (LoadStatus::LoadingData, 65.0),
    (LoadStatus::DdlIndexes, 20.0),
];

impl LoadStatus {
    /// Maps the phase names reported by the load tool.
    pub fn from_phase(phase: &str) -> Option<LoadStatus> {
        match phase {
            "Executing schema DDL" => Some(LoadStatus::DdlSchemas),
            "Executing table DDL" => Some(LoadStatus::DdlTables),
            "Executing view DDL" => Some(LoadStatus::DdlViews),
            "Data Import" => Some(LoadStatus::LoadingData),
            "Building indexes" => Some(LoadStatus::DdlIndexes),
            _ => None,
        }
    }

    fn weight(self) -> f64 {
        PHASE_WEIGHTS
            .iter()
            .find(|(status, _)| *status == self)
            .map(|(_, weight)| *weight)
            .unwrap_or(0.0)
    }

    fn is_done(self) -> bool {
        matches!(self, LoadStatus::Done | LoadStatus::Error)
    }
}

/// Folds the per phase progress of the load tool into one monotonic percentage.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    status: LoadStatus,
    progress: f64,
}

impl LoadTracker {
    pub const TOTAL: u64 = 100;

    pub fn new() -> Self {
        Self {
            status: LoadStatus::Ready,
            progress: 0.0,
        }
    }

    pub fn status(&self) -> LoadStatus {
        self.status
    }

    pub fn set_status(&mut self, status: LoadStatus) {
        self.status = status;
    }

    /// Applies a progress report and returns the overall progress, out of [`LoadTracker::TOTAL`].
    pub fn on_progress(&mut self, progress: &LoadProgress) -> u64 {
        if !self.status.is_done() {
            if let Some(status) = LoadStatus::from_phase(&progress.stage) {
                self.status = status;
            }
        }

        let mut overall: f64 = PHASE_WEIGHTS
            .iter()
            .filter(|(status, _)| *status < self.status)
            .map(|(_, weight)| weight)
            .sum();

        if let (Some(current), Some(total)) = (progress.current, progress.total) {
            if total > 0 {
                overall += self.status.weight() * current.min(total) as f64 / total as f64;
            }
        }

        if overall > self.progress {
            self.progress = overall;
        }

        self.progress.round() as u64
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads the export into the target through the remote helper, starting as soon as the export
/// is writing data.
#[derive(Debug)]
pub struct LoadStage {
    dump: watch::Receiver<DumpStatus>,
    tracker: Mutex<LoadTracker>,
}

impl LoadStage {
    pub fn new(dump: watch::Receiver<DumpStatus>) -> Self {
        Self {
            dump,
            tracker: Mutex::new(LoadTracker::new()),
        }
    }

    pub fn status(&self) -> LoadStatus {
        lock(&self.tracker).status()
    }

    fn set_status(&self, status: LoadStatus) {
        lock(&self.tracker).set_status(status);
    }

    async fn wait_for_dump(&self, ctx: &StageContext) -> MigrateResult<()> {
        ctx.push_progress("Waiting for the export to start writing data", &Progress::default())?;

        let mut dump = self.dump.clone();
        let mut shutdown = ctx.shutdown_rx();
        let status = match shutdown
            .run_until_shutdown(dump.wait_for(|status| *status >= DumpStatus::DumpingData))
            .await
        {
            ShutdownResult::Ok(Ok(status)) => *status,
            ShutdownResult::Ok(Err(_)) => bail!(
                ErrorKind::InvalidState,
                "Export status is no longer published"
            ),
            ShutdownResult::Shutdown(()) => {
                bail!(ErrorKind::Aborted, "Import was cancelled while waiting for the export")
            }
        };

        if status == DumpStatus::Error {
            bail!(
                ErrorKind::ImportFailed,
                "Import cannot proceed",
                "The export of the source database has failed"
            );
        }

        info!(export = status.name(), "export is writing data, starting the import");
        Ok(())
    }

    async fn load(&self, ctx: &StageContext) -> MigrateResult<()> {
        self.wait_for_dump(ctx).await?;

        self.set_status(LoadStatus::Starting);
        ctx.push_status(Transition::begin().with_message("Starting data load to DB System"))?;

        let run = ctx.run();
        let helper = run.helper(&ctx.shutdown_rx()).await?;
        let par = run.bucket_par(&ctx.shutdown_rx()).await?;

        let request = LoadDumpRequest {
            dump_uri: par.uri,
            threads: run.config().options.import_threads(),
            options: json!({
                "createInvisiblePKs": true,
                "dropExistingObjects": true,
                "ignoreVersion": true,
                "handleGrantErrors": "ignore",
            }),
        };
        info!(threads = request.threads, "starting the remote import");
        helper.load_dump(&request).await?;

        self.track(ctx, &helper).await?;
        self.update_gtid_purged(ctx, &helper).await?;

        ctx.push_status(Transition::end().with_message("Data load to target DB System completed"))?;

        Ok(())
    }

    /// Consumes the status stream of the import until it reports its exit code.
    async fn track(&self, ctx: &StageContext, helper: &HelperClient) -> MigrateResult<()> {
        let mut items = helper.load_status().await?;
        let mut shutdown = ctx.shutdown_rx();
        let mut last_error = None;

        loop {
            let item = match shutdown.run_until_shutdown(items.next()).await {
                ShutdownResult::Ok(Some(item)) => item?,
                ShutdownResult::Ok(None) => bail!(
                    ErrorKind::ImportFailed,
                    "Import status stream ended unexpectedly",
                    "The remote helper stopped reporting before the import finished"
                ),
                ShutdownResult::Shutdown(()) => {
                    info!("import was cancelled, stopping the remote import");
                    if let Err(err) = helper.stop_load_dump().await {
                        error!(error = %err, "failed to stop the remote import");
                    }
                    bail!(ErrorKind::Aborted, "Import was cancelled");
                }
            };

            for message in ToolMessage::decode(item)? {
                if let Some(returncode) = self.on_message(ctx, message, &mut last_error)? {
                    if returncode == 0 {
                        self.set_status(LoadStatus::Done);
                        return Ok(());
                    }

                    self.set_status(LoadStatus::Error);
                    return Err(load_error(returncode, last_error));
                }
            }
        }
    }

    /// Applies one message of the load tool, returning its exit code once it reported one.
    fn on_message(
        &self,
        ctx: &StageContext,
        message: ToolMessage,
        last_error: &mut Option<ToolException>,
    ) -> MigrateResult<Option<i64>> {
        if let Some(line) = message.output_line() {
            ctx.push_output(&line)?;
        }

        match message {
            ToolMessage::Done { returncode, .. } => return Ok(Some(returncode)),
            ToolMessage::DumpMetadata(coordinates) => {
                info!(
                    binlog_file = coordinates.binlog_file,
                    binlog_position = coordinates.binlog_position,
                    "recording replication coordinates of the export"
                );
                ctx.run()
                    .coordinates()
                    .update(|recorded| *recorded = Some(coordinates))?;
            }
            ToolMessage::Progress(progress) => {
                let overall = lock(&self.tracker).on_progress(&progress);
                ctx.push_progress(
                    &progress.stage,
                    &Progress::new(overall, LoadTracker::TOTAL)
                        .with_eta(progress.eta)
                        .with_info(&json!({ "stage": progress.stage })),
                )?;
            }
            ToolMessage::ExceptionInfo(info) => *last_error = Some(info.exception),
            ToolMessage::Note(text) | ToolMessage::Warning(text) | ToolMessage::Error(text) => {
                ctx.push_progress(&text, &Progress::default())?;
            }
            _ => {}
        }

        Ok(None)
    }

    async fn update_gtid_purged(
        &self,
        ctx: &StageContext,
        helper: &HelperClient,
    ) -> MigrateResult<()> {
        let Some(coordinates) = ctx.run().coordinates().get() else {
            bail!(
                ErrorKind::MissingResource,
                "Replication coordinates are missing",
                "The import finished without reporting the dump metadata"
            );
        };

        info!(
            gtid_executed = coordinates.executed_gtid_set,
            "updating gtid_purged of the target"
        );
        helper
            .target_run_sql(SET_GTID_PURGED, vec![Value::from(coordinates.executed_gtid_set)])
            .await?;

        Ok(())
    }
}

fn load_error(returncode: i64, last_error: Option<ToolException>) -> MigrateError {
    match last_error {
        Some(error) => migrate_error!(
            ErrorKind::ImportFailed,
            "Import into the target failed",
            error.message
        )
        .with_code(error.code),
        None => migrate_error!(
            ErrorKind::ImportFailed,
            "Import into the target failed",
            format!("load process has failed with exit code {returncode}")
        ),
    }
}

#[async_trait]
impl Stage for LoadStage {
    fn id(&self) -> StageId {
        StageId::Load
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(5))
    }

    fn on_reset(&self, _persisted: &WorkStatusInfo) {
        *lock(&self.tracker) = LoadTracker::new();
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let result = self.load(&ctx).await;
        if result.is_err() {
            self.set_status(LoadStatus::Error);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::run::{TestRun, fast_config};
    use crate::test_utils::source::SOURCE_SERVER_UUID;
    use crate::types::WorkStatus;

    fn prepared_run() -> TestRun {
        let run = TestRun::new(fast_config());
        run.context()
            .resources()
            .update(|resources| {
                resources.bucket_name = "migration-bucket".to_owned();
                resources.compute_public_ip = "203.0.113.7".to_owned();
            })
            .unwrap();

        run
    }

    fn context(run: &TestRun) -> StageContext {
        StageContext::new(StageId::Load, run.context(), run.shutdown_rx())
    }

    fn progress(stage: &str, current: u64, total: u64) -> LoadProgress {
        LoadProgress {
            stage: stage.to_owned(),
            current: Some(current),
            total: Some(total),
            eta: None,
        }
    }

    #[test]
    fn phases_are_weighted() {
        let mut tracker = LoadTracker::new();

        assert_eq!(tracker.on_progress(&progress("Executing schema DDL", 1, 1)), 5);
        assert_eq!(tracker.on_progress(&progress("Executing table DDL", 1, 2)), 8);
        assert_eq!(tracker.on_progress(&progress("Data Import", 50, 100)), 48);
        assert_eq!(tracker.status(), LoadStatus::LoadingData);
        assert_eq!(tracker.on_progress(&progress("Building indexes", 10, 10)), 100);
    }

    #[test]
    fn overall_progress_never_goes_back() {
        let mut tracker = LoadTracker::new();

        assert_eq!(tracker.on_progress(&progress("Data Import", 80, 100)), 67);
        // The total grows while the export is still running.
        assert_eq!(tracker.on_progress(&progress("Data Import", 90, 200)), 67);
        assert_eq!(tracker.on_progress(&progress("Data Import", 190, 200)), 77);
    }

    #[test]
    fn finished_imports_ignore_late_phase_changes() {
        let mut tracker = LoadTracker::new();
        tracker.set_status(LoadStatus::Done);

        tracker.on_progress(&progress("Data Import", 1, 2));

        assert_eq!(tracker.status(), LoadStatus::Done);
    }

    #[test]
    fn unknown_phases_keep_the_current_one() {
        let mut tracker = LoadTracker::new();
        tracker.on_progress(&progress("Executing view DDL", 0, 1));

        tracker.on_progress(&progress("Updating GTID", 0, 1));

        assert_eq!(tracker.status(), LoadStatus::DdlViews);
    }

    #[tokio::test]
    async fn import_records_the_coordinates_and_purges_them_on_the_target() {
        let run = prepared_run();
        let (_dump_tx, dump_rx) = watch::channel(DumpStatus::DumpingData);
        let stage = LoadStage::new(dump_rx);

        stage.run(context(&run)).await.unwrap();

        assert_eq!(stage.status(), LoadStatus::Done);
        let coordinates = run.context().coordinates().get().unwrap();
        assert_eq!(coordinates.binlog_file, "binlog.000042");
        assert_eq!(coordinates.binlog_position, 1337);

        let requests = run.helper.load_requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0]["dumpUri"].as_str().unwrap().contains("migration-bucket"));

        let sql = run.helper.sql();
        assert_eq!(sql[0].0, SET_GTID_PURGED);
        assert_eq!(sql[0].1, json!([format!("{SOURCE_SERVER_UUID}:1-10")]));

        let record = run.context().status().snapshot();
        let load = record.stage(StageId::Load).unwrap();
        assert_eq!(load.status, WorkStatus::Finished);
        assert_eq!(load.current, Some(100));
    }

    #[tokio::test]
    async fn failed_export_fails_the_import_before_it_starts() {
        let run = prepared_run();
        let (_dump_tx, dump_rx) = watch::channel(DumpStatus::Error);
        let stage = LoadStage::new(dump_rx);

        let err = stage.run(context(&run)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ImportFailed);
        assert!(run.helper.load_requests().is_empty());
        assert_eq!(stage.status(), LoadStatus::Error);
    }

    #[tokio::test]
    async fn import_waits_for_the_export_to_write_data() {
        let run = prepared_run();
        let (dump_tx, dump_rx) = watch::channel(DumpStatus::Synchronizing);
        let stage = Arc::new(LoadStage::new(dump_rx));

        let worker = tokio::spawn({
            let stage = stage.clone();
            let ctx = context(&run);
            async move { stage.run(ctx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(run.helper.load_requests().is_empty());

        dump_tx.send_replace(DumpStatus::DumpingData);
        worker.await.unwrap().unwrap();

        assert_eq!(run.helper.load_requests().len(), 1);
    }

    #[tokio::test]
    async fn failed_load_reports_the_last_exception() {
        let run = prepared_run();
        run.helper.script_load(vec![
            json!({"progress": {"stage": "Data Import", "current": 10, "total": 100}}),
            json!({"exceptionInfo": {"exception": {"code": 1045, "message": "Access denied"}}}),
            json!({"status": "ERROR", "returncode": 1}),
        ]);
        let (_dump_tx, dump_rx) = watch::channel(DumpStatus::Done);
        let stage = LoadStage::new(dump_rx);

        let err = stage.run(context(&run)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ImportFailed);
        assert_eq!(err.code(), Some(1045));
        assert_eq!(err.detail(), Some("Access denied"));
        assert_eq!(stage.status(), LoadStatus::Error);
        assert!(run.helper.sql().is_empty());
    }

    #[tokio::test]
    async fn status_stream_must_report_an_exit_code() {
        let run = prepared_run();
        run.helper.script_load(vec![json!({"progress": {"stage": "Data Import"}})]);
        let (_dump_tx, dump_rx) = watch::channel(DumpStatus::Done);
        let stage = LoadStage::new(dump_rx);

        let err = stage.run(context(&run)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ImportFailed);
        assert_eq!(run.helper.stopped_loads(), 0);
    }
}
