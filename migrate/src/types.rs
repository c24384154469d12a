//! Identifiers and status enums shared by the scheduler, the status store and the frontend.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, MigrateError};
use crate::migrate_error;

/// Stable identifier of a stage of the migration.
///
/// Ids are persisted as integers. Declaration order is the display order of the status
/// document and has no meaning for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum StageId {
    Orchestration = 0,

    ProvisionVcn = 2010,
    ProvisionCompartment = 2020,
    ProvisionCompute = 2030,
    ProvisionBucket = 2040,
    ProvisionHelper = 2050,
    ProvisionDbSystem = 2060,
    ProvisionHeatWaveCluster = 2070,

    Dump = 3010,
    Load = 3020,
    ConnectDbSystem = 3030,
    EnableCrashRecovery = 3040,
    EnableHa = 3050,

    CreateSshTunnel = 4010,
    CheckDirectNetwork = 4020,
    CreateChannel = 4030,

    Congrats = 5010,
    MonitorChannel = 5020,
    Cleanup = 5090,
    FinalSummary = 5100,
}

impl StageId {
    /// Stages that have a record in the status document, in display order.
    pub const WORK_STAGES: [StageId; 19] = [
        StageId::ProvisionVcn,
        StageId::ProvisionCompartment,
        StageId::ProvisionCompute,
        StageId::ProvisionBucket,
        StageId::ProvisionHelper,
        StageId::ProvisionDbSystem,
        StageId::ProvisionHeatWaveCluster,
        StageId::Dump,
        StageId::Load,
        StageId::ConnectDbSystem,
        StageId::EnableCrashRecovery,
        StageId::EnableHa,
        StageId::CreateSshTunnel,
        StageId::CheckDirectNetwork,
        StageId::CreateChannel,
        StageId::Congrats,
        StageId::MonitorChannel,
        StageId::Cleanup,
        StageId::FinalSummary,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn is_work_stage(self) -> bool {
        self.code() >= 2000
    }

    /// Upper snake case name used as the caption of the stage record.
    pub fn caption(self) -> &'static str {
        match self {
            StageId::Orchestration => "ORCHESTRATION",
            StageId::ProvisionVcn => "PROVISION_VCN",
            StageId::ProvisionCompartment => "PROVISION_COMPARTMENT",
            StageId::ProvisionCompute => "PROVISION_COMPUTE",
            StageId::ProvisionBucket => "PROVISION_BUCKET",
            StageId::ProvisionHelper => "PROVISION_HELPER",
            StageId::ProvisionDbSystem => "PROVISION_DBSYSTEM",
            StageId::ProvisionHeatWaveCluster => "PROVISION_HEATWAVE_CLUSTER",
            StageId::Dump => "DUMP",
            StageId::Load => "LOAD",
            StageId::ConnectDbSystem => "CONNECT_DBSYSTEM",
            StageId::EnableCrashRecovery => "ENABLE_CRASH_RECOVERY",
            StageId::EnableHa => "ENABLE_HA",
            StageId::CreateSshTunnel => "CREATE_SSH_TUNNEL",
            StageId::CheckDirectNetwork => "CHECK_DIRECT_NETWORK",
            StageId::CreateChannel => "CREATE_CHANNEL",
            StageId::Congrats => "CONGRATS",
            StageId::MonitorChannel => "MONITOR_CHANNEL",
            StageId::Cleanup => "CLEANUP",
            StageId::FinalSummary => "FINAL_SUMMARY",
        }
    }
}

impl From<StageId> for u16 {
    fn from(id: StageId) -> Self {
        id.code()
    }
}

impl TryFrom<u16> for StageId {
    type Error = MigrateError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        if code == 0 {
            return Ok(StageId::Orchestration);
        }

        StageId::WORK_STAGES
            .into_iter()
            .find(|id| id.code() == code)
            .ok_or_else(|| {
                migrate_error!(
                    ErrorKind::InvalidData,
                    "Unknown stage id",
                    format!("No stage has id {code}")
                )
            })
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.caption())
    }
}

/// Status of a stage, or of the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    NotStarted,
    InProgress,
    /// The migration finished but the target keeps replicating from the source.
    Ready,
    Finished,
    Aborted,
    Error,
}

impl WorkStatus {
    /// Returns `true` for statuses a run cannot leave without being reset.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStatus::Finished | WorkStatus::Aborted | WorkStatus::Error
        )
    }
}

/// Event a stage reports to the status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatusEvent {
    Begin,
    End,
    Error,
    Aborted,
}

impl fmt::Display for WorkStatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkStatusEvent::Begin => "begin",
            WorkStatusEvent::End => "end",
            WorkStatusEvent::Error => "error",
            WorkStatusEvent::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Health of the inbound replication channel as reported to the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    #[default]
    Stopped,
    Active,
    ReceiverError,
    ApplierError,
    Error,
}
