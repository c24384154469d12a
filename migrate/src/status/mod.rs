//! The work status store: persisted per stage status, progress and error history.

pub mod model;
pub mod store;

pub use model::{
    MigrationSummary, Progress, StageError, Transition, WorkStageInfo, WorkStatusInfo,
};
pub use store::{PROGRESS_FILE_NAME, WorkStatusStore};
