//! Configuration types shared by the orchestrator and its stages.

mod helper;
mod migration;
mod monitor;
mod options;
mod retry;
mod scheduler;
mod work_request;

pub use helper::HelperConfig;
pub use migration::{MigrationConfig, ValidationError};
pub use monitor::MonitorConfig;
pub use options::{
    CloudConnectivity, DatabaseEndpoint, MigrationOptions, MigrationType, ResourceNames,
};
pub use retry::{CloudRetryConfig, ExportRetryConfig};
pub use scheduler::SchedulerConfig;
pub use work_request::{WorkRequestConfig, WorkRequestPolling};
