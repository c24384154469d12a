use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bail;
use crate::cloud::CloudProvider;
use crate::concurrency::shutdown::ShutdownResult;
use crate::error::{ErrorKind, MigrateError, MigrateResult};
use crate::failpoints::{EXPORT__BEFORE_LAUNCH, migrate_fail_point};
use crate::migrate_error;
use crate::stage::{Stage, StageContext, StageKind};
use crate::status::{Progress, Transition, WorkStatusInfo};
use crate::types::{StageId, WorkStatus};
use crate::workers::backoff::DecorrelatedJitter;
use crate::workers::policy::RetryPolicy;
use crate::workers::tool::{ExportRequest, ToolException, ToolMessage, ToolMessages, ToolProcess};

/// Generic error the export tool reports when one of its workers failed. It never replaces the
/// more specific error that caused it.
const WORKER_FAILED_CODE: i64 = 52006;

/// Phase of the export. Ordered: every phase compares greater than the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DumpStatus {
    Ready = 1,
    Starting = 3,
    Synchronizing = 4,
    DumpingSchema = 5,
    DumpingData = 6,
    Done = 7,
    Error = 10,
}

impl DumpStatus {
    pub fn name(self) -> &'static str {
        match self {
            DumpStatus::Ready => "READY",
            DumpStatus::Starting => "STARTING",
            DumpStatus::Synchronizing => "SYNCHRONIZING",
            DumpStatus::DumpingSchema => "DUMPING_SCHEMA",
            DumpStatus::DumpingData => "DUMPING_DATA",
            DumpStatus::Done => "DONE",
            DumpStatus::Error => "ERROR",
        }
    }
}

/// How one launch of the export tool ended.
#[derive(Debug)]
struct ExportOutcome {
    exit_code: i32,
    last_error: Option<ToolException>,
}

impl ExportOutcome {
    fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        self.last_error
            .as_ref()
            .is_some_and(|error| policy.should_retry_export(error.code, &error.message))
    }

    fn into_error(self, attempts: u32) -> MigrateError {
        let attempts = if attempts > 1 {
            format!(" (after {attempts} attempts)")
        } else {
            String::new()
        };

        if self.exit_code < 0 {
            return migrate_error!(
                ErrorKind::ExportFailed,
                "Export tool exited unexpectedly",
                format!(
                    "dump process has exited unexpectedly (exit code={}){attempts}",
                    self.exit_code
                )
            );
        }

        match self.last_error {
            Some(error) => migrate_error!(
                ErrorKind::ExportFailed,
                "Export of the source database failed",
                format!("{}{attempts}", error.message)
            )
            .with_code(error.code),
            None => migrate_error!(
                ErrorKind::ExportFailed,
                "Export of the source database failed",
                format!(
                    "dump process has failed with exit code {}{attempts}",
                    self.exit_code
                )
            ),
        }
    }
}

/// Exports the source database into the bucket, retrying network failures from scratch.
///
/// The phase of the export is published on a watch channel, which lets the import start as soon
/// as the schema has been written instead of waiting for the whole export.
#[derive(Debug)]
pub struct DumpStage {
    status: watch::Sender<DumpStatus>,
    delete_before_launch: AtomicBool,
}

impl DumpStage {
    pub fn new() -> Self {
        let (status, _) = watch::channel(DumpStatus::Ready);

        Self {
            status,
            delete_before_launch: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DumpStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> DumpStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: DumpStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            info!(from = previous.name(), to = status.name(), "export phase changed");
        }
    }

    async fn export(&self, ctx: &StageContext) -> MigrateResult<()> {
        let config = &ctx.run().config().export_retry;
        let policy = RetryPolicy::new(config.retry_on_not_found);
        let mut backoff = DecorrelatedJitter::from_config(config);

        self.set_status(DumpStatus::Starting);
        ctx.push_status(Transition::begin().with_message("Exporting the source database"))?;

        if self.delete_before_launch.swap(false, Ordering::SeqCst) {
            info!("import started in an earlier run, deleting the partial export");
            self.delete_partial_dump(ctx).await?;
        }

        let request = self.request(ctx).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            migrate_fail_point(EXPORT__BEFORE_LAUNCH)?;

            info!(attempt, "launching the export tool");
            let outcome = self.launch(ctx, &request).await?;
            if outcome.exit_code == 0 {
                break;
            }

            if attempt < config.max_attempts && outcome.is_retryable(&policy) {
                let delay = backoff.next_delay();
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = ?outcome.last_error,
                    "export failed with a retryable error, retrying"
                );

                self.set_status(DumpStatus::Starting);
                self.delete_partial_dump(ctx).await?;
                ctx.sleep(delay).await?;
                continue;
            }

            return Err(outcome.into_error(attempt));
        }

        self.set_status(DumpStatus::Done);
        ctx.push_status(Transition::end().with_message("Source database was exported"))?;

        Ok(())
    }

    async fn request(&self, ctx: &StageContext) -> MigrateResult<ExportRequest> {
        let run = ctx.run();
        let options = &run.config().options;

        let par = run.bucket_par(&ctx.shutdown_rx()).await?;
        let version = run
            .resources()
            .read(|resources| resources.db_system_version.clone());

        let threads = std::thread::available_parallelism()
            .map(|threads| threads.get() as u32)
            .unwrap_or(1);

        Ok(ExportRequest {
            source: options.source.clone(),
            output_uri: par.uri,
            threads,
            target_version: (!version.is_empty()).then_some(version),
            extra_args: Vec::new(),
        })
    }

    /// Runs the export tool once and maps its output onto the stage.
    async fn launch(
        &self,
        ctx: &StageContext,
        request: &ExportRequest,
    ) -> MigrateResult<ExportOutcome> {
        let ToolProcess {
            command_line,
            output,
            exit,
        } = ctx.run().export_tool().launch(request).await?;
        ctx.push_output(&command_line)?;

        let mut shutdown = ctx.shutdown_rx();
        let mut messages = ToolMessages::wrap(output);
        let mut last_error = None;

        loop {
            let next = match shutdown.run_until_shutdown(messages.next()).await {
                ShutdownResult::Ok(next) => next,
                ShutdownResult::Shutdown(()) => {
                    info!("export was cancelled, stopping the export tool");
                    bail!(ErrorKind::Aborted, "Export was cancelled");
                }
            };

            match next {
                Some(message) => self.on_message(ctx, message?, &mut last_error)?,
                None => break,
            }
        }

        let exit_code = match shutdown.run_until_shutdown(exit).await {
            ShutdownResult::Ok(exit_code) => exit_code?,
            ShutdownResult::Shutdown(()) => bail!(ErrorKind::Aborted, "Export was cancelled"),
        };
        info!(exit_code, "export tool exited");

        Ok(ExportOutcome {
            exit_code,
            last_error,
        })
    }

    fn on_message(
        &self,
        ctx: &StageContext,
        message: ToolMessage,
        last_error: &mut Option<ToolException>,
    ) -> MigrateResult<()> {
        if let Some(line) = message.output_line() {
            ctx.push_output(&line)?;
        }

        match message {
            ToolMessage::ThroughputProgressUpdate(progress) => {
                let eta = progress.eta_seconds.map(|eta| eta.max(0.0).round() as u64);
                ctx.push_progress(
                    "",
                    &Progress::new(progress.current, progress.total)
                        .with_eta(eta)
                        .with_info(&json!({ "stage": self.status().name() })),
                )?;
            }
            ToolMessage::Info(text) => {
                ctx.push_progress(&text, &Progress::default())?;
                if text.contains("Acquiring global read lock") {
                    self.set_status(DumpStatus::Synchronizing);
                } else if text.contains("Global read lock has been released") {
                    self.set_status(DumpStatus::DumpingSchema);
                }
            }
            ToolMessage::Status(text) => {
                if text.contains("Starting data dump") {
                    self.set_status(DumpStatus::DumpingData);
                }
            }
            ToolMessage::ExceptionInfo(info) => {
                if last_error.is_none() || info.exception.code != WORKER_FAILED_CODE {
                    *last_error = Some(info.exception);
                }
            }
            _ => {}
        }

        Ok(())
    }

    async fn delete_partial_dump(&self, ctx: &StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let prefix = &run.config().options.dump_prefix;
        let bucket = run.resources().read(|resources| resources.bucket_name.clone());
        if bucket.is_empty() {
            return Ok(());
        }

        let deleted = ctx.cloud().delete_objects(&bucket, prefix).await?;
        info!(bucket, prefix, deleted, "deleted partial export");

        Ok(())
    }
}

impl Default for DumpStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for DumpStage {
    fn id(&self) -> StageId {
        StageId::Dump
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    fn on_reset(&self, persisted: &WorkStatusInfo) {
        let status_of = |stage| persisted.stage(stage).map(|record| record.status);

        if status_of(StageId::Dump) == Some(WorkStatus::Finished) {
            self.set_status(DumpStatus::Done);
            self.delete_before_launch.store(false, Ordering::SeqCst);
            return;
        }

        self.set_status(DumpStatus::Ready);
        let load_started =
            status_of(StageId::Load).is_some_and(|status| status != WorkStatus::NotStarted);
        self.delete_before_launch.store(load_started, Ordering::SeqCst);
    }

    fn on_skipped(&self) {
        // The import waits on the export status and would otherwise never wake up.
        self.set_status(DumpStatus::Error);
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let result = self.export(&ctx).await;
        if result.is_err() {
            self.set_status(DumpStatus::Error);
        }

        result
    }
}
