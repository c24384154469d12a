use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};
use crate::error::MigrateResult;
use crate::persist::{lock, read_json, write_json};
use crate::status::model::{Progress, Transition, WorkStatusInfo};
use crate::types::{StageId, WorkStatus, WorkStatusEvent};

/// Name of the status document inside the work directory.
pub const PROGRESS_FILE_NAME: &str = "progress.json";

/// Persisted record of the status of every stage of a run.
///
/// All mutations go through a single lock and the whole document is rewritten atomically before
/// the lock is released, so the file on disk never lags behind or interleaves updates. Readers
/// get deep copies through [`WorkStatusStore::snapshot`].
#[derive(Debug)]
pub struct WorkStatusStore {
    inner: Mutex<WorkStatusInfo>,
    path: Option<PathBuf>,
    changed: SignalTx,
}

impl WorkStatusStore {
    /// Opens the status document at `path`, creating a fresh one when it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> MigrateResult<Self> {
        let path = path.into();
        let info = match read_json::<WorkStatusInfo>(&path)? {
            Some(mut info) => {
                info.fill_missing_stages();
                info!(
                    path = %path.display(),
                    status = ?info.status,
                    "loaded persisted work status"
                );
                info
            }
            None => WorkStatusInfo::new(),
        };

        Ok(Self::with_info(info, Some(path)))
    }

    /// Creates a store that keeps the document in memory only.
    pub fn in_memory() -> Self {
        Self::with_info(WorkStatusInfo::new(), None)
    }

    fn with_info(info: WorkStatusInfo, path: Option<PathBuf>) -> Self {
        let (changed, _) = create_signal();

        Self {
            inner: Mutex::new(info),
            path,
            changed,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applies a status transition of `stage` and persists the document.
    ///
    /// A stage that already finished ignores everything but a repeated `end`: only
    /// [`WorkStatusStore::reset_unfinished`] moves a finished stage back.
    pub fn log_transition(&self, stage: StageId, transition: &Transition) -> MigrateResult<()> {
        self.mutate(|info| {
            if stage == StageId::Orchestration {
                info.status = match transition.event {
                    WorkStatusEvent::Begin => WorkStatus::InProgress,
                    WorkStatusEvent::End => WorkStatus::Finished,
                    WorkStatusEvent::Error => WorkStatus::Error,
                    WorkStatusEvent::Aborted => WorkStatus::Aborted,
                };
                info.errors.extend(transition.errors.iter().cloned());
                return;
            }

            if stage == StageId::Congrats && transition.event == WorkStatusEvent::Begin {
                info.status = WorkStatus::Ready;
            }

            let Some(record) = info.stage_mut(stage) else {
                warn!(%stage, "ignoring transition of a stage without a status record");
                return;
            };

            if record.status == WorkStatus::Finished && transition.event != WorkStatusEvent::End {
                warn!(
                    %stage,
                    event = %transition.event,
                    "ignoring transition of a finished stage"
                );
                return;
            }

            if !transition.message.is_empty() {
                record.message = transition.message.clone();
            }
            if !transition.info.is_empty() {
                record.info = transition.info.clone();
            }

            record.status = match transition.event {
                WorkStatusEvent::Begin => WorkStatus::InProgress,
                WorkStatusEvent::End => WorkStatus::Finished,
                WorkStatusEvent::Error => WorkStatus::Error,
                WorkStatusEvent::Aborted => WorkStatus::Aborted,
            };

            if transition.event == WorkStatusEvent::Error {
                if transition.message.is_empty() {
                    if let Some(first) = transition.errors.first() {
                        record.message = first.message.clone();
                    }
                }
                record.errors.extend(transition.errors.iter().cloned());
            }
        })
    }

    /// Updates the progress of `stage` without touching its status.
    pub fn log_progress(
        &self,
        stage: StageId,
        message: &str,
        progress: &Progress,
    ) -> MigrateResult<()> {
        self.mutate(|info| {
            let Some(record) = info.stage_mut(stage) else {
                return;
            };

            if !message.is_empty() {
                record.message = message.to_owned();
            }
            if !progress.is_empty() {
                record.current = progress.current;
                record.total = progress.total;
                record.eta = progress.eta;
                if !progress.info.is_empty() {
                    record.info = progress.info.clone();
                }
            }
        })
    }

    /// Counts one more line of tool output for `stage`.
    pub fn record_output(&self, stage: StageId) -> MigrateResult<()> {
        self.mutate(|info| {
            if let Some(record) = info.stage_mut(stage) {
                record.log_items += 1;
            }
        })
    }

    /// Records whether `stage` takes part in this run.
    pub fn set_enabled(&self, stage: StageId, enabled: bool) -> MigrateResult<()> {
        self.mutate(|info| {
            if let Some(record) = info.stage_mut(stage) {
                record.enabled = enabled;
            }
        })
    }

    /// Re-arms every stage that has not finished so that a new walk retries it.
    ///
    /// Finished stages keep their record. Error histories are kept for every stage.
    pub fn reset_unfinished(&self) -> MigrateResult<()> {
        self.mutate(|info| {
            for record in info.stages.iter_mut() {
                if record.status != WorkStatus::Finished {
                    debug!(
                        stage = %record.stage,
                        status = ?record.status,
                        "resetting stage status"
                    );
                    record.status = WorkStatus::NotStarted;
                }
                record.message.clear();
            }
        })
    }

    /// Returns a deep copy of the whole document.
    pub fn snapshot(&self) -> WorkStatusInfo {
        lock(&self.inner).clone()
    }

    /// Returns the overall status of the run.
    pub fn status(&self) -> WorkStatus {
        lock(&self.inner).status
    }

    /// Returns the status of `stage`, `None` for stages without a record.
    pub fn stage_status(&self, stage: StageId) -> Option<WorkStatus> {
        lock(&self.inner)
            .stage(stage)
            .map(|record| record.status)
    }

    /// Returns a receiver that is notified after every mutation.
    pub fn subscribe(&self) -> SignalRx {
        self.changed.subscribe()
    }

    fn mutate(&self, f: impl FnOnce(&mut WorkStatusInfo)) -> MigrateResult<()> {
        {
            let mut info = lock(&self.inner);
            f(&mut info);
            if let Some(path) = &self.path {
                write_json(path, &*info)?;
            }
        }

        self.changed.send_replace(());

        Ok(())
    }
}
