use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::{Value, json};

use crate::error::{ErrorKind, MigrateResult};
use crate::migrate_error;
use crate::persist::lock;
use crate::remote::{CommandTable, HelperCommand, HelperConnector, HelperReply, HelperTransport};
use crate::test_utils::source::SOURCE_SERVER_UUID;

/// Status items of an import that goes through every phase and succeeds.
pub fn successful_load_items() -> Vec<Value> {
    vec![
        json!({"progress": {"stage": "Executing schema DDL", "current": 1, "total": 1}}),
        json!({"progress": {"stage": "Executing table DDL", "current": 4, "total": 4}}),
        json!({"progress": {"stage": "Data Import", "current": 512, "total": 1024, "eta": 2}}),
        json!({"progress": {"stage": "Data Import", "current": 1024, "total": 1024}}),
        json!({"progress": {"stage": "Building indexes", "current": 4, "total": 4}}),
        json!({"Dump_metadata": {
            "Binlog_file": "binlog.000042",
            "Binlog_position": 1337,
            "Executed_GTID_set": format!("{SOURCE_SERVER_UUID}:1-10"),
        }}),
        json!({"status": "DONE", "returncode": 0}),
    ]
}

/// Streams `items` as newline delimited JSON.
fn stream_reply(items: &[Value]) -> HelperReply {
    let chunks: Vec<MigrateResult<String>> =
        items.iter().map(|item| Ok(format!("{item}\n"))).collect();

    HelperReply::Stream(stream::iter(chunks).boxed())
}

/// Replies a scripted sequence, repeating its last entry once exhausted.
struct Script<T> {
    entries: Vec<T>,
    next: usize,
}

impl<T: Clone> Script<T> {
    fn new(entries: Vec<T>) -> Self {
        Self { entries, next: 0 }
    }

    fn next(&mut self) -> Option<T> {
        let entry = self
            .entries
            .get(self.next)
            .or_else(|| self.entries.last())
            .cloned();
        self.next = (self.next + 1).min(self.entries.len());
        entry
    }
}

/// State shared by the helper and every transport it handed out.
struct HelperState {
    load_items: Mutex<Vec<Value>>,
    tunnel_replies: Mutex<Script<Value>>,
    channel: Mutex<Value>,
    connections: Mutex<Vec<(String, String)>>,
    load_requests: Mutex<Vec<Value>>,
    tunnels: Mutex<Vec<(String, u16)>>,
    sql: Mutex<Vec<(String, Value)>>,
    skipped: Mutex<Vec<String>>,
    stopped_loads: AtomicUsize,
}

/// Remote helper answering every command from memory.
///
/// Connections succeed unless told to fail with [`FakeHelper::fail_connects`]. All transports
/// share the state of the helper, so a reconnect sees the same scripts and records.
pub struct FakeHelper {
    state: Arc<HelperState>,
    failing_connects: AtomicU32,
    connected_hosts: Mutex<Vec<String>>,
}

impl FakeHelper {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HelperState {
                load_items: Mutex::new(successful_load_items()),
                tunnel_replies: Mutex::new(Script::new(vec![json!({"status": "ok"})])),
                channel: Mutex::new(Value::Null),
                connections: Mutex::new(Vec::new()),
                load_requests: Mutex::new(Vec::new()),
                tunnels: Mutex::new(Vec::new()),
                sql: Mutex::new(Vec::new()),
                skipped: Mutex::new(Vec::new()),
                stopped_loads: AtomicUsize::new(0),
            }),
            failing_connects: AtomicU32::new(0),
            connected_hosts: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `count` connection attempts fail as if the helper was still booting.
    pub fn fail_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts, failed ones included.
    pub fn connects(&self) -> usize {
        lock(&self.connected_hosts).len()
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        lock(&self.connected_hosts).clone()
    }

    pub fn script_successful_load(&self) {
        self.script_load(successful_load_items());
    }

    /// Sets the status items streamed by every following `load-status`.
    pub fn script_load(&self, items: Vec<Value>) {
        *lock(&self.state.load_items) = items;
    }

    /// Sets the replies to `test-tunnel`. The last one repeats.
    pub fn script_tunnel(&self, replies: Vec<Value>) {
        *lock(&self.state.tunnel_replies) = Script::new(replies);
    }

    /// Sets the channel reported by `channel-status`.
    pub fn set_channel_status(&self, channel: Value) {
        *lock(&self.state.channel) = channel;
    }

    /// Databases the helper was asked to connect to, as `(role, host)`.
    pub fn database_connections(&self) -> Vec<(String, String)> {
        lock(&self.state.connections).clone()
    }

    pub fn load_requests(&self) -> Vec<Value> {
        lock(&self.state.load_requests).clone()
    }

    pub fn stopped_loads(&self) -> usize {
        self.state.stopped_loads.load(Ordering::SeqCst)
    }

    pub fn tunnels(&self) -> Vec<(String, u16)> {
        lock(&self.state.tunnels).clone()
    }

    /// Statements run on the target, with their arguments.
    pub fn sql(&self) -> Vec<(String, Value)> {
        lock(&self.state.sql).clone()
    }

    /// Arguments of every `skip-gtids` command.
    pub fn skipped_gtids(&self) -> Vec<String> {
        lock(&self.state.skipped).clone()
    }

    fn transport(&self) -> CommandTable {
        fn ok() -> MigrateResult<HelperReply> {
            Ok(HelperReply::Object(json!({"status": "ok"})))
        }

        let mut table = CommandTable::new();

        let state = self.state.clone();
        table.register(HelperCommand::ConnectMysql, move |args| {
            let role = args["connection"].as_str().unwrap_or_default().to_owned();
            let host = args["host"].as_str().unwrap_or_default().to_owned();
            lock(&state.connections).push((role, host));
            async { ok() }
        });

        let state = self.state.clone();
        table.register(HelperCommand::LoadDump, move |args| {
            lock(&state.load_requests).push(args);
            async { ok() }
        });

        let state = self.state.clone();
        table.register(HelperCommand::LoadStatus, move |_| {
            let reply = stream_reply(&lock(&state.load_items));
            async move { Ok(reply) }
        });

        let state = self.state.clone();
        table.register(HelperCommand::StopLoadDump, move |_| {
            state.stopped_loads.fetch_add(1, Ordering::SeqCst);
            async { ok() }
        });

        let state = self.state.clone();
        table.register(HelperCommand::EnableTunneling, move |args| {
            let host = args["host"].as_str().unwrap_or_default().to_owned();
            let port = args["port"].as_u64().unwrap_or_default() as u16;
            lock(&state.tunnels).push((host, port));
            async { ok() }
        });

        let state = self.state.clone();
        table.register(HelperCommand::TestTunnel, move |_| {
            let reply = lock(&state.tunnel_replies)
                .next()
                .unwrap_or_else(|| json!({"status": "ok"}));
            async move { Ok(HelperReply::Object(reply)) }
        });

        let state = self.state.clone();
        table.register(HelperCommand::ChannelStatus, move |_| {
            let channel = lock(&state.channel).clone();
            async move { Ok(HelperReply::Object(json!({"status": "ok", "channel": channel}))) }
        });

        let state = self.state.clone();
        table.register(HelperCommand::TargetRunSql, move |args| {
            let sql = args["sql"].as_str().unwrap_or_default().to_owned();
            lock(&state.sql).push((sql, args["args"].clone()));
            async { Ok(HelperReply::Object(json!({"status": "ok", "result": []}))) }
        });

        let state = self.state.clone();
        table.register(HelperCommand::SkipGtids, move |args| {
            let gtids = args["gtids"].as_str().unwrap_or_default().to_owned();
            lock(&state.skipped).push(gtids);
            async { ok() }
        });

        table
            .register(HelperCommand::SelfStatus, |_| async {
                Ok(HelperReply::Object(json!({"status": "ok", "uptime": 1})))
            })
            .register(HelperCommand::Quit, |_| async { ok() })
            .register(HelperCommand::DumpInstance, |_| async { ok() })
            .register(HelperCommand::StopDumpInstance, |_| async { ok() })
            .register(HelperCommand::DumpStatus, |_| async {
                Ok(stream_reply(&[json!({"status": "DONE", "returncode": 0})]))
            });

        table
    }
}

impl Default for FakeHelper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HelperConnector for FakeHelper {
    async fn connect(&self, host: &str) -> MigrateResult<Arc<dyn HelperTransport>> {
        lock(&self.connected_hosts).push(host.to_owned());

        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(migrate_error!(
                ErrorKind::RemoteHelperTransient,
                "Remote helper is not reachable",
                format!("Connection to {host} was refused")
            ));
        }

        let table = self.transport();
        table.validate(&HelperCommand::ALL)?;

        Ok(Arc::new(table))
    }
}
