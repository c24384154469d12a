use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use config::shared::{DatabaseEndpoint, HelperConfig};
use futures::stream::BoxStream;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, MigrateResult};
use crate::remote::command::HelperCommand;
use crate::remote::stream::JsonLines;

/// Raw text chunks of a streaming reply.
pub type ReplyChunks = BoxStream<'static, MigrateResult<String>>;

/// What the helper answered to a command.
pub enum HelperReply {
    Object(Value),
    Stream(ReplyChunks),
    /// The helper is up but not ready to take the command yet.
    NotReady,
}

impl fmt::Debug for HelperReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperReply::Object(value) => f.debug_tuple("Object").field(value).finish(),
            HelperReply::Stream(_) => f.write_str("Stream(..)"),
            HelperReply::NotReady => f.write_str("NotReady"),
        }
    }
}

/// Delivers commands to a remote helper.
#[async_trait]
pub trait HelperTransport: Send + Sync {
    async fn send(&self, command: HelperCommand, args: Value) -> MigrateResult<HelperReply>;
}

/// Opens a transport to the helper running on `host`.
///
/// Fails with [`ErrorKind::RemoteHelperTransient`] while the helper cannot be reached yet.
#[async_trait]
pub trait HelperConnector: Send + Sync {
    async fn connect(&self, host: &str) -> MigrateResult<Arc<dyn HelperTransport>>;
}

/// Which database a helper side connection points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseRole {
    Source,
    Target,
}

impl fmt::Display for DatabaseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseRole::Source => f.write_str("source"),
            DatabaseRole::Target => f.write_str("target"),
        }
    }
}

/// Arguments of the `load-dump` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadDumpRequest {
    /// Pre-authenticated URI of the dump location.
    pub dump_uri: String,
    pub threads: u32,
    pub options: Value,
}

/// Typed commands on top of a [`HelperTransport`].
#[derive(Clone)]
pub struct HelperClient {
    transport: Arc<dyn HelperTransport>,
    config: HelperConfig,
    shutdown: ShutdownRx,
}

impl std::fmt::Debug for HelperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperClient").finish_non_exhaustive()
    }
}

impl HelperClient {
    pub fn new(
        transport: Arc<dyn HelperTransport>,
        config: HelperConfig,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            transport,
            config,
            shutdown,
        }
    }

    /// Sends `command`, repeating it while the helper answers "not ready".
    async fn send(&self, command: HelperCommand, args: Value) -> MigrateResult<HelperReply> {
        let mut attempts = 0;

        loop {
            self.shutdown.check()?;

            match self.transport.send(command, args.clone()).await? {
                HelperReply::NotReady => {
                    attempts += 1;
                    if attempts >= self.config.not_ready_max_attempts {
                        bail!(
                            ErrorKind::RemoteHelperNotReady,
                            "Remote helper did not become ready",
                            format!("'{command}' was refused {attempts} times")
                        );
                    }

                    warn!(%command, attempts, "remote helper is not ready, retrying");
                    self.shutdown
                        .clone()
                        .sleep_or_abort(self.config.not_ready_retry_delay())
                        .await?;
                }
                reply => {
                    debug!(%command, "remote helper replied");
                    return Ok(reply);
                }
            }
        }
    }

    /// Sends a command answered by a single object. A `fail` status is an error.
    pub async fn command(&self, command: HelperCommand, args: Value) -> MigrateResult<Value> {
        match self.send(command, args).await? {
            HelperReply::Object(reply) => {
                if status(&reply) == Some("fail") {
                    bail!(
                        ErrorKind::RemoteHelperFailed,
                        "Remote helper command failed",
                        format!("Remote helper error: {}", error_text(&reply))
                    );
                }
                Ok(reply)
            }
            reply => bail!(
                ErrorKind::RemoteHelperFailed,
                "Remote helper sent an unexpected reply",
                format!("'{command}' answered with {reply:?}")
            ),
        }
    }

    /// Sends a command answered by a stream of status items.
    pub async fn stream(
        &self,
        command: HelperCommand,
        args: Value,
    ) -> MigrateResult<JsonLines<ReplyChunks>> {
        match self.send(command, args).await? {
            HelperReply::Stream(chunks) => Ok(JsonLines::wrap(chunks)),
            HelperReply::Object(reply) if status(&reply) == Some("fail") => bail!(
                ErrorKind::RemoteHelperFailed,
                "Remote helper command failed",
                format!("Remote helper error: {}", error_text(&reply))
            ),
            reply => bail!(
                ErrorKind::RemoteHelperFailed,
                "Remote helper sent an unexpected reply",
                format!("'{command}' answered with {reply:?} instead of a stream")
            ),
        }
    }

    /// Opens the helper's connection to the `role` database.
    pub async fn connect_mysql(
        &self,
        role: DatabaseRole,
        endpoint: &DatabaseEndpoint,
    ) -> MigrateResult<()> {
        let reply = self
            .command(
                HelperCommand::ConnectMysql,
                json!({
                    "connection": role,
                    "host": endpoint.host,
                    "port": endpoint.port,
                    "user": endpoint.user,
                    "password": endpoint.password.as_ref().map(|p| p.expose_secret().as_str()),
                }),
            )
            .await?;

        if status(&reply) != Some("ok") {
            bail!(
                ErrorKind::RemoteHelperFailed,
                "Remote helper could not connect to the database",
                format!(
                    "Could not connect to the {role} database at {}:{}: {}",
                    endpoint.host,
                    endpoint.port,
                    error_text(&reply)
                )
            );
        }

        Ok(())
    }

    pub async fn load_dump(&self, request: &LoadDumpRequest) -> MigrateResult<()> {
        let reply = self
            .command(HelperCommand::LoadDump, serde_json::to_value(request)?)
            .await?;
        expect_ok(&reply, "Remote helper could not start the import")
    }

    /// Streams the status items of the running import.
    pub async fn load_status(&self) -> MigrateResult<JsonLines<ReplyChunks>> {
        self.stream(HelperCommand::LoadStatus, json!({})).await
    }

    pub async fn stop_load_dump(&self) -> MigrateResult<()> {
        self.command(HelperCommand::StopLoadDump, json!({})).await?;
        Ok(())
    }

    /// Starts the helper side of the SSH tunnel towards the source at `host:port`.
    pub async fn enable_tunneling(&self, host: &str, port: u16) -> MigrateResult<()> {
        let reply = self
            .command(
                HelperCommand::EnableTunneling,
                json!({ "host": host, "port": port }),
            )
            .await?;

        if status(&reply) == Some("error") {
            bail!(
                ErrorKind::RemoteHelperFailed,
                "Could not enable SSH tunneling at jump host",
                error_text(&reply)
            );
        }

        Ok(())
    }

    /// Returns whether the source is reachable through the tunnel with the given credentials.
    pub async fn test_tunnel(&self, endpoint: &DatabaseEndpoint) -> MigrateResult<bool> {
        let reply = self
            .command(
                HelperCommand::TestTunnel,
                json!({
                    "user": endpoint.user,
                    "password": endpoint.password.as_ref().map(|p| p.expose_secret().as_str()),
                }),
            )
            .await?;

        match status(&reply) {
            Some("error") => bail!(
                ErrorKind::RemoteHelperFailed,
                "SSH tunnel test failed",
                error_text(&reply)
            ),
            Some("ok") => Ok(true),
            _ => Ok(false),
        }
    }

    /// Returns the receiver and applier status of the inbound channel on the target.
    pub async fn channel_status(&self, channel: &str) -> MigrateResult<Value> {
        let mut reply = self
            .command(HelperCommand::ChannelStatus, json!({ "channel": channel }))
            .await?;

        if status(&reply) == Some("error") {
            bail!(
                ErrorKind::RemoteHelperFailed,
                "Could not read the replication channel status",
                error_text(&reply)
            );
        }

        Ok(reply
            .get_mut("channel")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Runs `sql` with positional `args` on the target database.
    pub async fn target_run_sql(&self, sql: &str, args: Vec<Value>) -> MigrateResult<Value> {
        let mut reply = self
            .command(
                HelperCommand::TargetRunSql,
                json!({ "sql": sql, "args": args }),
            )
            .await?;

        if status(&reply) == Some("error") {
            bail!(
                ErrorKind::RemoteHelperFailed,
                "SQL statement failed on the target database",
                format!("{sql}: {}", error_text(&reply))
            );
        }

        Ok(reply
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Injects empty transactions for `gtids` on the target so the channel skips them.
    pub async fn skip_gtids(&self, gtids: &[String]) -> MigrateResult<()> {
        let reply = self
            .command(
                HelperCommand::SkipGtids,
                json!({ "gtids": gtids.join(",") }),
            )
            .await?;
        expect_ok(&reply, "Remote helper could not skip transactions")
    }

    pub async fn self_status(&self) -> MigrateResult<Value> {
        let reply = self.command(HelperCommand::SelfStatus, json!({})).await?;
        expect_ok(&reply, "Remote helper reported an unhealthy status")?;

        Ok(reply)
    }

    pub async fn quit(&self) -> MigrateResult<()> {
        self.command(HelperCommand::Quit, json!({})).await?;
        Ok(())
    }
}

fn status(reply: &Value) -> Option<&str> {
    reply.get("status").and_then(Value::as_str)
}

fn error_text(reply: &Value) -> String {
    match reply.get("error") {
        Some(Value::String(error)) => error.clone(),
        Some(error) => error.to_string(),
        None => reply.to_string(),
    }
}

fn expect_ok(reply: &Value, description: &'static str) -> MigrateResult<()> {
    if status(reply) == Some("error") {
        bail!(ErrorKind::RemoteHelperFailed, description, error_text(reply));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::{StreamExt, stream};

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;

    /// Replays canned replies and records what was sent.
    struct Scripted {
        replies: Mutex<Vec<HelperReply>>,
        sent: Mutex<Vec<(HelperCommand, Value)>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<HelperReply>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HelperTransport for Scripted {
        async fn send(&self, command: HelperCommand, args: Value) -> MigrateResult<HelperReply> {
            self.sent.lock().unwrap().push((command, args));
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(HelperReply::Object(json!({"status": "ok"}))))
        }
    }

    fn fast_config() -> HelperConfig {
        HelperConfig {
            not_ready_retry_delay_ms: 1,
            not_ready_max_attempts: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn not_ready_replies_are_retried() {
        let transport = Scripted::new(vec![
            HelperReply::NotReady,
            HelperReply::NotReady,
            HelperReply::Object(json!({"status": "ok", "uptime": 3})),
        ]);
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport.clone(), fast_config(), rx);

        let reply = client.self_status().await.unwrap();

        assert_eq!(reply["uptime"], 3);
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_configured_attempts() {
        let transport = Scripted::new((0..5).map(|_| HelperReply::NotReady).collect());
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport.clone(), fast_config(), rx);

        let err = client.self_status().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteHelperNotReady);
        assert_eq!(transport.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fail_status_is_an_error() {
        let transport = Scripted::new(vec![HelperReply::Object(
            json!({"status": "fail", "error": "permission denied"}),
        )]);
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport, fast_config(), rx);

        let err = client.quit().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteHelperFailed);
        assert_eq!(err.detail(), Some("Remote helper error: permission denied"));
    }

    #[tokio::test]
    async fn tunnel_test_distinguishes_errors_from_not_yet() {
        let transport = Scripted::new(vec![
            HelperReply::Object(json!({"status": "pending"})),
            HelperReply::Object(json!({"status": "ok"})),
            HelperReply::Object(json!({"status": "error", "error": "access denied"})),
        ]);
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport, fast_config(), rx);
        let endpoint = DatabaseEndpoint::default();

        assert!(!client.test_tunnel(&endpoint).await.unwrap());
        assert!(client.test_tunnel(&endpoint).await.unwrap());
        assert!(client.test_tunnel(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn skip_gtids_sends_a_joined_list() {
        let transport = Scripted::new(vec![]);
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport.clone(), fast_config(), rx);

        client
            .skip_gtids(&["u:7".to_owned(), "u:9".to_owned()])
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].0, HelperCommand::SkipGtids);
        assert_eq!(sent[0].1, json!({"gtids": "u:7,u:9"}));
    }

    #[tokio::test]
    async fn load_status_decodes_the_stream() {
        let chunks: ReplyChunks = stream::iter(vec![
            Ok("{\"progress\": {\"stage\": \"Data Import\"}}\n{\"status\": ".to_owned()),
            Ok("\"DONE\", \"returncode\": 0}\n".to_owned()),
        ])
        .boxed();
        let transport = Scripted::new(vec![HelperReply::Stream(chunks)]);
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport, fast_config(), rx);

        let items: Vec<_> = client.load_status().await.unwrap().collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap()["returncode"], 0);
    }

    #[tokio::test]
    async fn channel_status_unwraps_the_channel() {
        let transport = Scripted::new(vec![HelperReply::Object(
            json!({"status": "ok", "channel": {"gtid_executed": "u:1-3"}}),
        )]);
        let (_tx, rx) = create_shutdown_channel();
        let client = HelperClient::new(transport, fast_config(), rx);

        let channel = client.channel_status("replication").await.unwrap();

        assert_eq!(channel, json!({"gtid_executed": "u:1-3"}));
    }
}
