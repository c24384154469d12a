//! Messages emitted by the dump and load tools, and the process running the export.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use config::shared::DatabaseEndpoint;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt, ready, stream};
use pin_project_lite::pin_project;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::{ErrorKind, MigrateError, MigrateResult};
use crate::migrate_error;
use crate::resources::ReplicationCoordinates;

/// Progress of the export, in bytes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputProgress {
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericProgress {
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total_known: bool,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub description: String,
}

/// Progress of one phase of the import.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadProgress {
    pub stage: String,
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub eta: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolException {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExceptionInfo {
    pub exception: ToolException,
}

/// One message written by the dump or load tool.
///
/// Messages are JSON objects keyed by their kind. An object carrying several known keys decodes
/// into several messages, see [`ToolMessage::decode`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolMessage {
    ThroughputProgressUpdate(ThroughputProgress),
    NumericProgressUpdate(NumericProgress),
    Progress(LoadProgress),
    #[serde(rename = "Dump_metadata")]
    DumpMetadata(ReplicationCoordinates),
    ExceptionInfo(ExceptionInfo),
    Status(String),
    Info(String),
    Note(String),
    Warning(String),
    Error(String),
    /// End of a status stream with the exit code of the tool.
    #[serde(skip)]
    Done { status: String, returncode: i64 },
}

/// Keys of the messages the tools emit, in the order they are handled.
const MESSAGE_KEYS: [&str; 10] = [
    "throughputProgressUpdate",
    "numericProgressUpdate",
    "progress",
    "Dump_metadata",
    "status",
    "info",
    "note",
    "warning",
    "error",
    "exceptionInfo",
];

impl ToolMessage {
    /// Decodes every known message carried by `value`. Unknown keys are ignored.
    pub fn decode(value: Value) -> MigrateResult<Vec<ToolMessage>> {
        let Value::Object(mut object) = value else {
            return Ok(Vec::new());
        };

        if let Some(returncode) = object.get("returncode").and_then(Value::as_i64) {
            let status = object
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("DONE")
                .to_owned();
            return Ok(vec![ToolMessage::Done { status, returncode }]);
        }

        let mut messages = Vec::new();
        for key in MESSAGE_KEYS {
            let Some(payload) = object.remove(key) else {
                continue;
            };

            let mut single = Map::new();
            single.insert(key.to_owned(), payload);
            messages.push(serde_json::from_value(Value::Object(single))?);
        }

        if messages.is_empty() {
            debug!(keys = ?object.keys().collect::<Vec<_>>(), "ignoring unknown tool message");
        }

        Ok(messages)
    }

    /// Text to show in the output log of the stage, if the message has any.
    pub fn output_line(&self) -> Option<String> {
        match self {
            ToolMessage::Status(text) | ToolMessage::Info(text) => Some(text.clone()),
            ToolMessage::Note(text) => Some(format!("NOTE: {text}")),
            ToolMessage::Warning(text) => Some(format!("WARNING: {text}")),
            ToolMessage::Error(text) => Some(format!("ERROR: {text}")),
            _ => None,
        }
    }
}

pin_project! {
    /// Decodes [`ToolMessage`]s from raw output chunks.
    ///
    /// JSON values may span chunk and line boundaries. Text that is not JSON is surfaced as
    /// [`ToolMessage::Info`] one line at a time.
    #[must_use = "streams do nothing unless polled"]
    pub struct ToolMessages<S> {
        #[pin]
        chunks: S,
        buffer: Vec<u8>,
        decoded: Vec<ToolMessage>,
        chunks_done: bool,
    }
}

impl<S> ToolMessages<S> {
    pub fn wrap(chunks: S) -> Self {
        Self {
            chunks,
            buffer: Vec::new(),
            decoded: Vec::new(),
            chunks_done: false,
        }
    }
}

/// Decodes the complete values at the front of `buffer`, leaving an incomplete tail in place.
fn drain_values(buffer: &mut Vec<u8>, eof: bool) -> MigrateResult<Vec<ToolMessage>> {
    let mut messages = Vec::new();
    let mut consumed = 0;

    loop {
        let rest = &buffer[consumed..];
        let skipped = rest
            .iter()
            .take_while(|byte| byte.is_ascii_whitespace())
            .count();
        consumed += skipped;
        let rest = &buffer[consumed..];
        if rest.is_empty() {
            break;
        }

        if rest[0] != b'{' {
            // Plain text line.
            let Some(end) = rest.iter().position(|byte| *byte == b'\n') else {
                if eof {
                    let text = String::from_utf8_lossy(rest).trim().to_owned();
                    consumed = buffer.len();
                    messages.push(ToolMessage::Info(text));
                }
                break;
            };
            let text = String::from_utf8_lossy(&rest[..end]).trim().to_owned();
            consumed += end + 1;
            messages.push(ToolMessage::Info(text));
            continue;
        }

        let mut values = serde_json::Deserializer::from_slice(rest).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                consumed += values.byte_offset();
                messages.extend(ToolMessage::decode(value)?);
            }
            Some(Err(err)) if err.is_eof() && !eof => break,
            Some(Err(err)) => {
                return Err(migrate_error!(
                    ErrorKind::DeserializationError,
                    "Tool output is not valid JSON",
                    err.to_string(),
                    source: err
                ));
            }
            None => break,
        }
    }

    buffer.drain(..consumed);

    Ok(messages)
}

impl<S> Stream for ToolMessages<S>
where
    S: Stream<Item = MigrateResult<String>>,
{
    type Item = MigrateResult<ToolMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if !this.decoded.is_empty() {
                return Poll::Ready(Some(Ok(this.decoded.remove(0))));
            }

            if *this.chunks_done {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                match drain_values(this.buffer, true) {
                    Ok(messages) => {
                        this.buffer.clear();
                        *this.decoded = messages;
                        if this.decoded.is_empty() {
                            return Poll::Ready(None);
                        }
                        continue;
                    }
                    Err(err) => {
                        this.buffer.clear();
                        return Poll::Ready(Some(Err(err)));
                    }
                }
            }

            match ready!(this.chunks.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.buffer.extend_from_slice(chunk.as_bytes());
                    match drain_values(this.buffer, false) {
                        Ok(messages) => *this.decoded = messages,
                        Err(err) => {
                            this.buffer.clear();
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => *this.chunks_done = true,
            }
        }
    }
}

/// What the export tool is asked to do.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub source: DatabaseEndpoint,
    /// Pre-authenticated URI of the location the dump is written to.
    pub output_uri: String,
    pub threads: u32,
    /// Server version the dump has to be compatible with, when already known.
    pub target_version: Option<String>,
    pub extra_args: Vec<String>,
}

/// A running export.
///
/// Dropping it terminates the tool.
pub struct ToolProcess {
    /// Command line with credentials and pre-authenticated URIs redacted.
    pub command_line: String,
    pub output: BoxStream<'static, MigrateResult<String>>,
    /// Resolves to the exit code once the tool exited. Negative codes mean it was killed by a
    /// signal.
    pub exit: BoxFuture<'static, MigrateResult<i32>>,
}

/// Launches the external dump tool.
#[async_trait]
pub trait ExportTool: Send + Sync {
    async fn launch(&self, request: &ExportRequest) -> MigrateResult<ToolProcess>;
}

/// Runs the export as a local MySQL Shell `util.dumpInstance` with JSON output.
#[derive(Debug, Clone)]
pub struct ShellExportTool {
    program: PathBuf,
}

impl ShellExportTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn arguments(request: &ExportRequest) -> Vec<String> {
        let source = &request.source;
        let mut args = vec![
            "--json=raw".to_owned(),
            "--passwords-from-stdin".to_owned(),
            format!("--uri={}@{}:{}", source.user, source.host, source.port),
            "--".to_owned(),
            "util".to_owned(),
            "dump-instance".to_owned(),
            request.output_uri.clone(),
            format!("--threads={}", request.threads),
            "--ocimds=true".to_owned(),
            "--showProgress=true".to_owned(),
        ];
        if let Some(version) = &request.target_version {
            args.push(format!("--targetVersion={version}"));
        }
        args.extend(request.extra_args.iter().cloned());

        args
    }
}

#[async_trait]
impl ExportTool for ShellExportTool {
    async fn launch(&self, request: &ExportRequest) -> MigrateResult<ToolProcess> {
        let args = Self::arguments(request);
        let command_line = redact_par_uris(&format!(
            "{} {}",
            self.program.display(),
            args.join(" ")
        ));

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            migrate_error!(
                ErrorKind::ExternalToolFailed,
                "Export tool could not be started",
                format!("{}: {err}", self.program.display()),
                source: err
            )
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            let password = request
                .source
                .password
                .as_ref()
                .map(|password| password.expose_secret().as_str())
                .unwrap_or_default();
            stdin.write_all(format!("{password}\n").as_bytes()).await?;
        }

        let Some(stdout) = child.stdout.take() else {
            return Err(migrate_error!(
                ErrorKind::ExternalToolFailed,
                "Export tool has no output"
            ));
        };

        let lines = BufReader::new(stdout).lines();
        let output = stream::unfold(lines, |mut lines| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(format!("{line}\n")), lines)),
                Ok(None) => None,
                Err(err) => Some((Err(MigrateError::from(err)), lines)),
            }
        })
        .boxed();

        let exit = async move {
            let status = child.wait().await?;
            Ok::<_, MigrateError>(exit_code(status))
        }
        .boxed();

        Ok(ToolProcess {
            command_line,
            output,
            exit,
        })
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Replaces the token of pre-authenticated request URIs (`.../p/<token>/n/...`).
pub fn redact_par_uris(text: &str) -> String {
    let mut redacted = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("/p/") {
        let token_start = start + 3;
        redacted.push_str(&rest[..token_start]);
        let after = &rest[token_start..];
        match after.find('/') {
            Some(end) if end > 0 => {
                redacted.push_str("<redacted>");
                rest = &after[end..];
            }
            _ => {
                rest = after;
            }
        }
    }
    redacted.push_str(rest);

    redacted
}
