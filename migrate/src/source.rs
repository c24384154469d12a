use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MigrateResult;

/// Facts about the source server that decide how replication is set up and observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_uuid: String,
    pub version: String,
    /// Whether the server runs with `gtid_mode=ON`.
    pub gtid_mode_on: bool,
}

/// GTID sets of the source at one point in time, in their textual form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGtidState {
    pub gtid_executed: String,
    pub gtid_purged: String,
}

/// Read-only access to the source database.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    async fn server_info(&self) -> MigrateResult<ServerInfo>;

    /// Reads `@@gtid_executed` and `@@gtid_purged`.
    async fn gtid_state(&self) -> MigrateResult<SourceGtidState>;
}
