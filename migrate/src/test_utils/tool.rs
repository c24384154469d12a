use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt, stream};
use serde_json::json;

use crate::error::MigrateResult;
use crate::persist::lock;
use crate::workers::{ExportRequest, ExportTool, ToolProcess};

/// Output and exit code of one launch of the export tool.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl ScriptedRun {
    /// Output of an export that goes through every phase and succeeds.
    pub fn success() -> Self {
        Self {
            lines: vec![
                json!({"info": "Acquiring global read lock"}).to_string(),
                json!({"info": "Global read lock has been released"}).to_string(),
                json!({"status": "Starting data dump"}).to_string(),
                json!({"throughputProgressUpdate": {"current": 100, "total": 100}}).to_string(),
                json!({"info": "Dump finished"}).to_string(),
            ],
            exit_code: 0,
        }
    }
}

/// Export tool replaying scripted runs, one per launch.
///
/// Launches past the end of the script succeed.
#[derive(Default)]
pub struct ScriptedExportTool {
    runs: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<ExportRequest>>,
}

impl ScriptedExportTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_run(&self, lines: Vec<String>, exit_code: i32) {
        lock(&self.runs).push_back(ScriptedRun { lines, exit_code });
    }

    pub fn script_success(&self) {
        lock(&self.runs).push_back(ScriptedRun::success());
    }

    pub fn launches(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<ExportRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ExportTool for ScriptedExportTool {
    async fn launch(&self, request: &ExportRequest) -> MigrateResult<ToolProcess> {
        lock(&self.requests).push(request.clone());
        let run = lock(&self.runs)
            .pop_front()
            .unwrap_or_else(ScriptedRun::success);

        let lines = run.lines.into_iter().map(|line| Ok(format!("{line}\n")));
        let exit_code = run.exit_code;

        Ok(ToolProcess {
            command_line: format!("mysqlsh util dump-instance --threads={}", request.threads),
            output: stream::iter(lines).boxed(),
            exit: async move { Ok(exit_code) }.boxed(),
        })
    }
}
