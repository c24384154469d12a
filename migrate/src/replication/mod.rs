//! Supervision of the inbound replication channel that keeps the target in sync with the source.

pub mod observation;
pub mod supervisor;

pub use observation::{ApplierError, Backlog, ChannelObservation, ChannelStatus, ReceiverError};
pub use supervisor::MonitorChannelStage;
