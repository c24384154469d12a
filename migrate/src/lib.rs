pub mod cloud;
pub mod concurrency;
pub mod error;
pub mod failpoints;
pub mod frontend;
pub mod gtid;
mod macros;
pub mod orchestrator;
pub mod persist;
pub mod remote;
pub mod replication;
pub mod resources;
pub mod source;
pub mod stage;
pub mod status;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
