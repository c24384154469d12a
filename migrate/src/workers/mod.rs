//! Stages that move the data: the export of the source database and its import into the target.

pub mod backoff;
pub mod export;
pub mod import;
pub mod policy;
pub mod tool;

pub use backoff::DecorrelatedJitter;
pub use export::{DumpStage, DumpStatus};
pub use import::{LoadStage, LoadStatus};
pub use policy::RetryPolicy;
pub use tool::{ExportRequest, ExportTool, ShellExportTool, ToolMessage, ToolProcess};
