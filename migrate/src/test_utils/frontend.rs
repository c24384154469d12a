use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

use crate::frontend::Frontend;
use crate::persist::lock;
use crate::status::{Progress, Transition};
use crate::test_utils::notify::TimedNotify;
use crate::types::{StageId, WorkStatusEvent};

/// Something a stage reported to the frontend.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendEvent {
    Progress { message: String, progress: Progress },
    Status(Transition),
    Message(Value),
    Output(String),
}

type StatusCondition = (StageId, WorkStatusEvent, Arc<Notify>);

/// Frontend keeping every event in memory.
#[derive(Default)]
pub struct RecordingFrontend {
    events: Mutex<Vec<(StageId, FrontendEvent)>>,
    conditions: Mutex<Vec<StatusCondition>>,
}

impl RecordingFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a notification fired the next time `stage` reports `event`.
    pub fn notify_on_status(&self, stage: StageId, event: WorkStatusEvent) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        lock(&self.conditions).push((stage, event, notify.clone()));

        TimedNotify::new(notify)
    }

    pub fn events(&self, stage: StageId) -> Vec<FrontendEvent> {
        lock(&self.events)
            .iter()
            .filter(|(id, _)| *id == stage)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn progress_messages(&self, stage: StageId) -> Vec<String> {
        self.events(stage)
            .into_iter()
            .filter_map(|event| match event {
                FrontendEvent::Progress { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self, stage: StageId) -> Vec<WorkStatusEvent> {
        self.events(stage)
            .into_iter()
            .filter_map(|event| match event {
                FrontendEvent::Status(transition) => Some(transition.event),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self, stage: StageId) -> Vec<Value> {
        self.events(stage)
            .into_iter()
            .filter_map(|event| match event {
                FrontendEvent::Message(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn output(&self, stage: StageId) -> Vec<String> {
        self.events(stage)
            .into_iter()
            .filter_map(|event| match event {
                FrontendEvent::Output(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    fn record(&self, stage: StageId, event: FrontendEvent) {
        lock(&self.events).push((stage, event));
    }
}

impl Frontend for RecordingFrontend {
    fn on_progress(&self, stage: StageId, message: &str, progress: &Progress) {
        self.record(
            stage,
            FrontendEvent::Progress {
                message: message.to_owned(),
                progress: progress.clone(),
            },
        );
    }

    fn on_status(&self, stage: StageId, transition: &Transition) {
        self.record(stage, FrontendEvent::Status(transition.clone()));

        let mut conditions = lock(&self.conditions);
        conditions.retain(|(id, event, notify)| {
            let matches = *id == stage && *event == transition.event;
            if matches {
                notify.notify_one();
            }
            !matches
        });
    }

    fn on_message(&self, stage: StageId, data: &Value) {
        self.record(stage, FrontendEvent::Message(data.clone()));
    }

    fn on_output(&self, stage: StageId, line: &str) {
        self.record(stage, FrontendEvent::Output(line.to_owned()));
    }
}
