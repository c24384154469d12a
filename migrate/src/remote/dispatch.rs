use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, MigrateResult};
use crate::remote::client::{HelperReply, HelperTransport};
use crate::remote::command::HelperCommand;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, MigrateResult<HelperReply>> + Send + Sync>;

/// Explicit mapping from helper commands to their handlers.
///
/// Incoming wire names are parsed into [`HelperCommand`] first, so a name that is not a command
/// and a command without a handler both fail with [`ErrorKind::UnknownCommand`].
#[derive(Default, Clone)]
pub struct CommandTable {
    handlers: HashMap<HelperCommand, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `command`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, command: HelperCommand, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MigrateResult<HelperReply>> + Send + 'static,
    {
        self.handlers
            .insert(command, Arc::new(move |args| handler(args).boxed()));
        self
    }

    pub fn handles(&self, command: HelperCommand) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Checks that every command in `required` has a handler.
    pub fn validate(&self, required: &[HelperCommand]) -> MigrateResult<()> {
        let missing: Vec<&str> = required
            .iter()
            .filter(|command| !self.handles(**command))
            .map(|command| command.wire_name())
            .collect();

        if !missing.is_empty() {
            bail!(
                ErrorKind::UnknownCommand,
                "Command table is missing handlers",
                format!("No handler for: {}", missing.join(", "))
            );
        }

        Ok(())
    }

    /// Runs the handler registered for the wire name `name`.
    pub async fn dispatch(&self, name: &str, args: Value) -> MigrateResult<HelperReply> {
        let command: HelperCommand = name.parse()?;
        self.call(command, args).await
    }

    async fn call(&self, command: HelperCommand, args: Value) -> MigrateResult<HelperReply> {
        let Some(handler) = self.handlers.get(&command) else {
            bail!(
                ErrorKind::UnknownCommand,
                "Remote helper command has no handler",
                format!("'{command}' is not handled")
            );
        };

        handler(args).await
    }
}

#[async_trait]
impl HelperTransport for CommandTable {
    async fn send(&self, command: HelperCommand, args: Value) -> MigrateResult<HelperReply> {
        self.call(command, args).await
    }
}
