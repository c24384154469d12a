//! Stages of a migration and the scheduler that walks their dependency graph.

use std::time::Duration;

use async_trait::async_trait;
use config::shared::MigrationOptions;
use serde_json::Value;
use tracing::error;

use crate::cloud::RetryingCloud;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{MigrateError, MigrateResult};
use crate::orchestrator::context::RunContext;
use crate::status::{Progress, Transition, WorkStatusInfo};
use crate::types::StageId;

pub mod graph;

pub use graph::{StageGraph, StageKey};

/// How the scheduler drives a stage once its dependencies finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Has no work of its own and finishes as soon as its dependencies did.
    Barrier,
    /// Runs [`Stage::run`] on its own task, exactly once per walk.
    Worker,
    /// Is started with [`Stage::on_start`] and then polled with [`Stage::poll`] until it reports
    /// completion, without a task of its own.
    Polled,
}

/// A node of the stage graph.
///
/// Stages hold their own domain state behind interior mutability, since the scheduler only hands
/// out shared references: the worker task, the polling walk and the orchestrator may all look at
/// a stage concurrently.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    fn kind(&self) -> StageKind;

    /// Whether the stage takes part in a run with `options`. Disabled stages finish without doing
    /// anything.
    fn enabled(&self, _options: &MigrationOptions) -> bool {
        true
    }

    /// How often dependents poll this stage while waiting for it.
    fn update_interval(&self) -> Option<Duration> {
        None
    }

    /// Called before every walk with the status persisted by previous walks.
    fn on_reset(&self, _persisted: &WorkStatusInfo) {}

    /// Called when the stage will not run in this walk because a dependency failed.
    fn on_skipped(&self) {}

    /// Called once its dependencies finished, for [`StageKind::Polled`] stages.
    async fn on_start(&self, _ctx: &StageContext) -> MigrateResult<()> {
        Ok(())
    }

    /// The body of a [`StageKind::Worker`] stage.
    async fn run(&self, _ctx: StageContext) -> MigrateResult<()> {
        Ok(())
    }

    /// Returns `true` once a [`StageKind::Polled`] stage completed.
    async fn poll(&self, _ctx: &StageContext) -> MigrateResult<bool> {
        Ok(true)
    }

    /// Called once after the stage completed, before dependents are released.
    async fn on_finish(&self, _ctx: &StageContext) -> MigrateResult<()> {
        Ok(())
    }
}

/// Handle given to a stage to reach the run and report what it is doing.
#[derive(Clone)]
pub struct StageContext {
    id: StageId,
    run: RunContext,
    shutdown: ShutdownRx,
}

impl StageContext {
    pub fn new(id: StageId, run: RunContext, shutdown: ShutdownRx) -> Self {
        Self { id, run, shutdown }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    pub fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown.clone()
    }

    /// The cloud provider of the run, retrying transient errors until the stage is stopped.
    pub fn cloud(&self) -> RetryingCloud {
        self.run.retrying_cloud(&self.shutdown)
    }

    /// Records a status transition and forwards it to the frontend.
    ///
    /// The frontend is notified even when the status could not be persisted.
    pub fn push_status(&self, transition: Transition) -> MigrateResult<()> {
        let result = self.run.status().log_transition(self.id, &transition);
        self.run.frontend().on_status(self.id, &transition);

        result
    }

    /// Like [`StageContext::push_status`], for paths that are already failing and can only log.
    pub(crate) fn push_status_or_log(&self, transition: Transition) {
        if let Err(err) = self.push_status(transition) {
            error!(stage = %self.id, error = %err, "failed to persist stage status");
        }
    }

    /// Records the terminal failure of the stage: `aborted` for cancellations, `error` with the
    /// structured error records otherwise.
    pub(crate) fn report_failure(&self, err: &MigrateError) {
        let transition = if err.is_aborted() {
            Transition::aborted()
        } else {
            Transition::error(err.to_stage_errors())
        };

        self.push_status_or_log(transition);
    }

    pub fn push_progress(&self, message: &str, progress: &Progress) -> MigrateResult<()> {
        let result = self.run.status().log_progress(self.id, message, progress);
        self.run.frontend().on_progress(self.id, message, progress);

        result
    }

    /// Records a line of output of an external tool.
    pub fn push_output(&self, line: &str) -> MigrateResult<()> {
        let result = self.run.status().record_output(self.id);
        self.run.frontend().on_output(self.id, line);

        result
    }

    /// Sends free form data to the frontend. Nothing is persisted.
    pub fn push_message(&self, data: &Value) {
        self.run.frontend().on_message(self.id, data);
    }

    /// Fails with [`crate::error::ErrorKind::Aborted`] when the run was cancelled.
    pub fn check_stop(&self) -> MigrateResult<()> {
        self.shutdown.check()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Sleeps for `duration`, failing early with an aborted error when the run is cancelled.
    pub async fn sleep(&self, duration: Duration) -> MigrateResult<()> {
        self.shutdown.clone().sleep_or_abort(duration).await
    }
}
