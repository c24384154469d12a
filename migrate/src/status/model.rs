use chrono::{DateTime, Utc};
use config::shared::{CloudConnectivity, MigrationType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{StageId, WorkStatus, WorkStatusEvent};

/// Structured record of an error, appended to the history of the stage it happened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub time: DateTime<Utc>,
}

impl StageError {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        detail: Option<String>,
        code: Option<i64>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail,
            code,
            time: Utc::now(),
        }
    }
}

/// Progress of a stage: counters plus free form information rendered by the frontend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Estimated seconds left.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub info: Map<String, Value>,
}

impl Progress {
    pub fn new(current: u64, total: u64) -> Self {
        Self {
            current: Some(current),
            total: Some(total),
            ..Default::default()
        }
    }

    pub fn with_eta(mut self, eta: Option<u64>) -> Self {
        self.eta = eta;
        self
    }

    /// Replaces the free form information with the fields of `info`.
    ///
    /// Values that do not serialize to a JSON object are stored under `value`.
    pub fn with_info<T: Serialize>(mut self, info: &T) -> Self {
        self.info = match serde_json::to_value(info) {
            Ok(Value::Object(map)) => map,
            Ok(value) => Map::from_iter([("value".to_owned(), value)]),
            Err(_) => Map::new(),
        };
        self
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.total.is_none() && self.eta.is_none() && self.info.is_empty()
    }
}

/// A status change reported by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: WorkStatusEvent,
    pub message: String,
    pub info: Map<String, Value>,
    pub errors: Vec<StageError>,
}

impl Transition {
    pub fn new(event: WorkStatusEvent) -> Self {
        Self {
            event,
            message: String::new(),
            info: Map::new(),
            errors: Vec::new(),
        }
    }

    pub fn begin() -> Self {
        Self::new(WorkStatusEvent::Begin)
    }

    pub fn end() -> Self {
        Self::new(WorkStatusEvent::End)
    }

    pub fn error(errors: Vec<StageError>) -> Self {
        Self {
            errors,
            ..Self::new(WorkStatusEvent::Error)
        }
    }

    pub fn aborted() -> Self {
        Self::new(WorkStatusEvent::Aborted)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }
}

/// Persisted record of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStageInfo {
    pub stage: StageId,
    pub caption: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub errors: Vec<StageError>,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub eta: Option<u64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub info: Map<String, Value>,
    #[serde(default)]
    pub log_items: u64,
}

impl WorkStageInfo {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            caption: stage.caption().to_owned(),
            enabled: false,
            status: WorkStatus::NotStarted,
            errors: Vec::new(),
            current: None,
            total: None,
            eta: None,
            message: String::new(),
            info: Map::new(),
            log_items: 0,
        }
    }
}

/// Resources and choices of the run, shown next to the stage table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub migration_type: MigrationType,
    pub cloud_connectivity: CloudConnectivity,
    pub region: String,
    pub compartment_name: String,
    pub db_system_name: String,
    pub db_system_id: String,
    #[serde(rename = "dbSystemIP")]
    pub db_system_ip: String,
    pub db_system_version: String,
    pub channel_id: String,
    pub jump_host_name: String,
    pub jump_host_id: String,
    #[serde(rename = "jumpHostPrivateIP")]
    pub jump_host_private_ip: String,
    #[serde(rename = "jumpHostPublicIP")]
    pub jump_host_public_ip: String,
    pub created_jump_host: bool,
    pub source_host: String,
    pub source_port: u16,
    pub bucket_namespace: String,
    pub bucket_name: String,
    pub created_bucket: bool,
}

/// The persisted status document of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStatusInfo {
    #[serde(default)]
    pub status: WorkStatus,
    pub stages: Vec<WorkStageInfo>,
    /// Errors that ended the whole run.
    #[serde(default)]
    pub errors: Vec<StageError>,
    #[serde(default)]
    pub summary: MigrationSummary,
}

impl WorkStatusInfo {
    /// Creates a document with one record per work stage.
    pub fn new() -> Self {
        Self {
            status: WorkStatus::NotStarted,
            stages: StageId::WORK_STAGES
                .into_iter()
                .map(WorkStageInfo::new)
                .collect(),
            errors: Vec::new(),
            summary: MigrationSummary::default(),
        }
    }

    pub fn stage(&self, stage: StageId) -> Option<&WorkStageInfo> {
        self.stages.iter().find(|info| info.stage == stage)
    }

    pub fn stage_mut(&mut self, stage: StageId) -> Option<&mut WorkStageInfo> {
        self.stages.iter_mut().find(|info| info.stage == stage)
    }

    /// Adds records for stages missing from a document written by an older version.
    pub(crate) fn fill_missing_stages(&mut self) {
        for id in StageId::WORK_STAGES {
            if self.stage(id).is_none() {
                self.stages.push(WorkStageInfo::new(id));
            }
        }
    }
}

impl Default for WorkStatusInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_has_one_record_per_work_stage() {
        let info = WorkStatusInfo::new();

        assert_eq!(info.stages.len(), StageId::WORK_STAGES.len());
        assert!(info.stage(StageId::Orchestration).is_none());
        assert_eq!(info.stage(StageId::Dump).unwrap().caption, "DUMP");
    }

    #[test]
    fn stage_records_use_camel_case() {
        let mut record = WorkStageInfo::new(StageId::Load);
        record.log_items = 3;

        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["stage"], 3020);
        assert_eq!(json["status"], "not_started");
        assert_eq!(json["logItems"], 3);
    }

    #[test]
    fn progress_info_flattens_objects() {
        #[derive(Serialize)]
        struct Phase {
            stage: &'static str,
        }

        let progress = Progress::new(5, 100).with_info(&Phase {
            stage: "DUMPING_DATA",
        });

        assert_eq!(progress.info["stage"], "DUMPING_DATA");
        assert!(!progress.is_empty());
        assert!(Progress::default().is_empty());
    }
}
