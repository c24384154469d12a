use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorKind, MigrateError};
use crate::migrate_error;

/// Commands understood by the remote helper running on the jump host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperCommand {
    ConnectMysql,
    LoadDump,
    LoadStatus,
    DumpInstance,
    DumpStatus,
    StopDumpInstance,
    StopLoadDump,
    EnableTunneling,
    TestTunnel,
    ChannelStatus,
    TargetRunSql,
    SelfStatus,
    Quit,
    SkipGtids,
}

impl HelperCommand {
    pub const ALL: [HelperCommand; 14] = [
        HelperCommand::ConnectMysql,
        HelperCommand::LoadDump,
        HelperCommand::LoadStatus,
        HelperCommand::DumpInstance,
        HelperCommand::DumpStatus,
        HelperCommand::StopDumpInstance,
        HelperCommand::StopLoadDump,
        HelperCommand::EnableTunneling,
        HelperCommand::TestTunnel,
        HelperCommand::ChannelStatus,
        HelperCommand::TargetRunSql,
        HelperCommand::SelfStatus,
        HelperCommand::Quit,
        HelperCommand::SkipGtids,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            HelperCommand::ConnectMysql => "connect-mysql",
            HelperCommand::LoadDump => "load-dump",
            HelperCommand::LoadStatus => "load-status",
            HelperCommand::DumpInstance => "dump-instance",
            HelperCommand::DumpStatus => "dump-status",
            HelperCommand::StopDumpInstance => "stop-dump-instance",
            HelperCommand::StopLoadDump => "stop-load-dump",
            HelperCommand::EnableTunneling => "enable-tunneling",
            HelperCommand::TestTunnel => "test-tunnel",
            HelperCommand::ChannelStatus => "channel-status",
            HelperCommand::TargetRunSql => "target-run-sql",
            HelperCommand::SelfStatus => "self-status",
            HelperCommand::Quit => "quit",
            HelperCommand::SkipGtids => "skip-gtids",
        }
    }

    /// Whether the command answers with a stream of newline delimited JSON items instead of a
    /// single object.
    pub fn is_stream(self) -> bool {
        matches!(self, HelperCommand::LoadStatus | HelperCommand::DumpStatus)
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for HelperCommand {
    type Err = MigrateError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        HelperCommand::ALL
            .into_iter()
            .find(|command| command.wire_name() == name)
            .ok_or_else(|| {
                migrate_error!(
                    ErrorKind::UnknownCommand,
                    "Unknown remote helper command",
                    format!("'{name}' is not a remote helper command")
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back() {
        for command in HelperCommand::ALL {
            assert_eq!(command.wire_name().parse::<HelperCommand>().unwrap(), command);
        }
    }

    #[test]
    fn unknown_names_are_typed_errors() {
        let err = "drop-database".parse::<HelperCommand>().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert_eq!(err.detail(), Some("'drop-database' is not a remote helper command"));
    }

    #[test]
    fn only_status_commands_stream() {
        let streaming: Vec<_> = HelperCommand::ALL
            .into_iter()
            .filter(|command| command.is_stream())
            .collect();

        assert_eq!(
            streaming,
            vec![HelperCommand::LoadStatus, HelperCommand::DumpStatus]
        );
    }
}
