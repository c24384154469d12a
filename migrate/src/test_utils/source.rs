use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::MigrateResult;
use crate::persist::lock;
use crate::source::{ServerInfo, SourceDatabase, SourceGtidState};

/// Server UUID the fake source reports unless told otherwise.
pub const SOURCE_SERVER_UUID: &str = "8e2fa3c4-52a5-11ee-9e7c-0200170217d1";

/// Source server answering with whatever the test configured.
pub struct FakeSource {
    info: Mutex<ServerInfo>,
    gtid_state: Mutex<SourceGtidState>,
    info_requests: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            info: Mutex::new(ServerInfo {
                server_uuid: SOURCE_SERVER_UUID.to_owned(),
                version: "8.0.36".to_owned(),
                gtid_mode_on: true,
            }),
            gtid_state: Mutex::new(SourceGtidState {
                gtid_executed: format!("{SOURCE_SERVER_UUID}:1-10"),
                gtid_purged: String::new(),
            }),
            info_requests: AtomicUsize::new(0),
        }
    }

    pub fn set_server_info(&self, info: ServerInfo) {
        *lock(&self.info) = info;
    }

    pub fn set_gtid_state(&self, state: SourceGtidState) {
        *lock(&self.gtid_state) = state;
    }

    /// Number of times the server was asked about itself.
    pub fn info_requests(&self) -> usize {
        self.info_requests.load(Ordering::SeqCst)
    }
}

impl Default for FakeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceDatabase for FakeSource {
    async fn server_info(&self) -> MigrateResult<ServerInfo> {
        self.info_requests.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.info).clone())
    }

    async fn gtid_state(&self) -> MigrateResult<SourceGtidState> {
        Ok(lock(&self.gtid_state).clone())
    }
}
