//! Interpretation of the replication channel status read from the target.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, MigrateError, MigrateResult};
use crate::gtid::{GtidSet, gtid_contains};
use crate::migrate_error;
use crate::source::SourceGtidState;
use crate::types::ReplicationStatus;

const APPLIER_ERROR_DETAILS: &str = "There are replication applier errors in the target DBSystem. \
     Remaining transactions from the source cannot be applied until resolved.";

const RECEIVER_ERROR_DETAILS: &str =
    "Target DBSystem is unable to connect to the source database.";

const DIVERGED_DETAILS: &str = "The source has purged transactions that were never applied to \
     the target DBSystem. Replication cannot catch up without reloading the data.";

/// A row of `performance_schema.replication_connection_status` or
/// `performance_schema.replication_applier_status_by_worker`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
struct WorkerRow {
    service_state: Option<String>,
    received_transaction_set: Option<String>,
    last_error_number: Option<i64>,
    last_error_message: Option<String>,
    last_error_timestamp: Option<String>,
    applying_transaction: Option<String>,
}

impl WorkerRow {
    fn has_error(&self) -> bool {
        self.last_error_number.is_some_and(|errno| errno != 0)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChannelStatus {
    gtid_executed: Option<String>,
    gtid_received: Option<String>,
    connection_status: Vec<WorkerRow>,
    applier_status_by_worker: Vec<WorkerRow>,
}

/// The channel cannot reach the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiverError {
    pub service_state: Option<String>,
    pub errno: i64,
    pub message: String,
    pub time: Option<String>,
}

/// A worker of the channel failed to apply `transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplierError {
    pub errno: i64,
    pub message: String,
    pub time: Option<String>,
    pub transaction: String,
}

/// The target side of the channel at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelObservation {
    pub observed_at: DateTime<Utc>,
    pub gtid_executed: String,
    pub gtid_received: String,
    pub receiver_error: Option<ReceiverError>,
    pub applier_errors: Vec<ApplierError>,
}

impl ChannelObservation {
    /// Builds an observation from the reply of the helper's `channel-status` command.
    pub fn analyze(status: &Value) -> MigrateResult<Self> {
        let raw: RawChannelStatus = serde_json::from_value(status.clone()).map_err(|err| {
            migrate_error!(
                ErrorKind::DeserializationError,
                "Replication channel status has an unexpected shape",
                source: err
            )
        })?;

        let mut gtid_received = raw.gtid_received.unwrap_or_default();

        // A single channel is expected per DB system.
        let receiver_error = raw
            .connection_status
            .into_iter()
            .find(WorkerRow::has_error)
            .map(|row| {
                if let Some(received) = row.received_transaction_set {
                    gtid_received = received;
                }

                ReceiverError {
                    service_state: row.service_state,
                    errno: row.last_error_number.unwrap_or_default(),
                    message: row.last_error_message.unwrap_or_default(),
                    time: row.last_error_timestamp,
                }
            });

        let applier_errors = raw
            .applier_status_by_worker
            .into_iter()
            .filter(WorkerRow::has_error)
            .map(|row| ApplierError {
                errno: row.last_error_number.unwrap_or_default(),
                message: row.last_error_message.unwrap_or_default(),
                time: row.last_error_timestamp,
                transaction: row.applying_transaction.unwrap_or_default(),
            })
            .collect();

        Ok(Self {
            observed_at: Utc::now(),
            gtid_executed: raw.gtid_executed.unwrap_or_default(),
            gtid_received,
            receiver_error,
            applier_errors,
        })
    }

    /// Returns `true` when both observations describe the same channel state, whenever they
    /// were taken.
    pub fn same_state(&self, other: &ChannelObservation) -> bool {
        self.gtid_executed == other.gtid_executed
            && self.gtid_received == other.gtid_received
            && self.receiver_error == other.receiver_error
            && self.applier_errors == other.applier_errors
    }

    pub fn has_errors(&self) -> bool {
        self.receiver_error.is_some() || !self.applier_errors.is_empty()
    }

    /// Returns `true` when every transaction that broke the applier has since been executed on
    /// the target, e.g. because it was skipped by hand.
    pub fn is_resolved(&self) -> bool {
        !self.applier_errors.is_empty()
            && self
                .applier_errors
                .iter()
                .all(|error| gtid_contains(&self.gtid_executed, &error.transaction))
    }

    /// Transactions that broke the applier, in the order the workers reported them.
    pub fn broken_transactions(&self) -> Vec<&str> {
        self.applier_errors
            .iter()
            .map(|error| error.transaction.as_str())
            .collect()
    }
}

/// Transactions executed at the source that the target still has to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlog {
    pub pending: GtidSet,
    /// Pending transactions the source no longer has in its binary log.
    pub lost: GtidSet,
}

impl Backlog {
    pub fn compute(source: &SourceGtidState, target_executed: &str) -> MigrateResult<Self> {
        let source_executed: GtidSet = source.gtid_executed.parse()?;
        let source_purged: GtidSet = source.gtid_purged.parse()?;
        let target_executed: GtidSet = target_executed.parse()?;

        let pending = source_executed.subtract(&target_executed);
        let lost = pending.subtract(&pending.subtract(&source_purged));

        Ok(Self { pending, lost })
    }

    pub fn size(&self) -> u64 {
        self.pending.count()
    }

    /// Fails when the target can never catch up because the source purged part of the backlog.
    pub fn check_divergence(&self) -> MigrateResult<()> {
        if self.lost.is_empty() {
            return Ok(());
        }

        Err(migrate_error!(
            ErrorKind::ReplicationDiverged,
            "Target can no longer catch up with the source",
            format!(
                "Transactions {} were purged at the source before the target applied them",
                self.lost
            )
        ))
    }
}

/// Consolidated health of the channel as shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub status: ReplicationStatus,
    pub details: String,
    pub errors: Vec<String>,
    pub gtid_backlog: String,
    pub gtid_backlog_size: Option<u64>,
}

impl ChannelStatus {
    /// Builds the report of `observation`, with the backlog when the source status is known.
    ///
    /// A receiver error takes precedence over applier errors. A diverged backlog is only
    /// reported while the channel itself is healthy.
    pub fn report(observation: &ChannelObservation, backlog: Option<&Backlog>) -> Self {
        let mut report = ChannelStatus {
            status: ReplicationStatus::Active,
            ..Default::default()
        };

        if let Some(backlog) = backlog {
            report.gtid_backlog = backlog.pending.to_string();
            report.gtid_backlog_size = Some(backlog.size());
        }

        if !observation.applier_errors.is_empty() {
            report.status = ReplicationStatus::ApplierError;
            report.details = APPLIER_ERROR_DETAILS.to_owned();
            report.errors = observation
                .applier_errors
                .iter()
                .map(|error| format!("{} (error={})", error.message, error.errno))
                .collect();
        }

        if let Some(error) = &observation.receiver_error {
            report.status = ReplicationStatus::ReceiverError;
            report.details = RECEIVER_ERROR_DETAILS.to_owned();
            report.errors = vec![format!("{} (error={})", error.message, error.errno)];
        }

        if report.status == ReplicationStatus::Active {
            if let Some(Err(err)) = backlog.map(Backlog::check_divergence) {
                report.mark_diverged(&err);
            }
        }

        report
    }

    fn mark_diverged(&mut self, err: &MigrateError) {
        self.status = ReplicationStatus::Error;
        self.details = DIVERGED_DETAILS.to_owned();
        self.errors = err
            .to_stage_errors()
            .into_iter()
            .map(|record| record.message)
            .collect();
    }
}
