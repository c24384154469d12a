//! Command channel to the helper process running on the jump host.

pub mod client;
pub mod command;
pub mod dispatch;
pub mod stream;

pub use client::{
    DatabaseRole, HelperClient, HelperConnector, HelperReply, HelperTransport, LoadDumpRequest,
    ReplyChunks,
};
pub use command::HelperCommand;
pub use dispatch::CommandTable;
pub use stream::JsonLines;
