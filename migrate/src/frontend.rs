use serde_json::Value;

use crate::status::{Progress, Transition};
use crate::types::StageId;

/// Receiver of the events reported by stages, typically a UI.
///
/// Events of a single stage arrive in order. Events of different stages may interleave in any
/// order since stages report from their own tasks. Callbacks run on the reporting task and must
/// not block.
pub trait Frontend: Send + Sync {
    fn on_progress(&self, _stage: StageId, _message: &str, _progress: &Progress) {}

    fn on_status(&self, _stage: StageId, _transition: &Transition) {}

    fn on_message(&self, _stage: StageId, _data: &Value) {}

    /// A line of output of an external tool run by `stage`.
    fn on_output(&self, _stage: StageId, _line: &str) {}
}

/// A [`Frontend`] that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFrontend;

impl Frontend for NoopFrontend {}
