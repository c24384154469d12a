use std::sync::Arc;
use std::time::Duration;

use config::shared::MigrationOptions;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, MigrateError, MigrateResult};
use crate::failpoints::{migrate_fail_point, stage_worker_fail_point};
use crate::orchestrator::context::RunContext;
use crate::stage::{Stage, StageContext, StageKind};
use crate::status::{Transition, WorkStatusInfo};
use crate::types::{StageId, WorkStatus};
use crate::{bail, migrate_error};

/// Index of a stage inside a [`StageGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageKey(usize);

struct Node {
    stage: Arc<dyn Stage>,
    deps: Vec<StageKey>,
    enabled: bool,
    started: bool,
    finished: bool,
    /// The work of the stage completed, in this walk or in an earlier one.
    done: bool,
    /// The stage was found finished in the persisted status of an earlier run.
    restored: bool,
    fatal_error: Option<MigrateError>,
    /// Whether `fatal_error` was already handed to a dependent.
    error_reported: bool,
    worker: Option<JoinHandle<MigrateResult<()>>>,
}

impl Node {
    /// Returns the error dependents see for this stage.
    ///
    /// The original failure is handed out once, so that it reaches the top of the walk a single
    /// time. Later dependents get a [`ErrorKind::DependencyFailed`] error. Cancellations are
    /// always handed out as they are.
    fn propagate_error(&mut self, err: MigrateError) -> MigrateError {
        if err.is_aborted() || !self.error_reported {
            self.error_reported = true;
            return err;
        }

        dependency_failed(self.stage.id())
    }

    fn record_failure(&mut self, err: &MigrateError) {
        self.fatal_error = Some(err.clone());
        self.error_reported = true;
    }
}

fn dependency_failed(id: StageId) -> MigrateError {
    migrate_error!(
        ErrorKind::DependencyFailed,
        "A dependency of the stage failed",
        format!("Stage {id} cannot complete because one of its dependencies failed")
    )
}

/// Settings of one walk of the graph.
struct Walk<'a> {
    run: &'a RunContext,
    shutdown: &'a ShutdownRx,
    min_poll_interval: Duration,
    default_update_interval: Duration,
    max_poll_interval: Option<Duration>,
    stage_timeout: Option<Duration>,
}

impl<'a> Walk<'a> {
    fn new(run: &'a RunContext, shutdown: &'a ShutdownRx) -> Self {
        let scheduler = &run.config().scheduler;

        Self {
            run,
            shutdown,
            min_poll_interval: scheduler.min_poll_interval(),
            default_update_interval: scheduler.default_update_interval(),
            max_poll_interval: scheduler.max_poll_interval(),
            stage_timeout: scheduler.stage_timeout(),
        }
    }

    fn context(&self, id: StageId) -> StageContext {
        StageContext::new(id, self.run.clone(), self.shutdown.clone())
    }
}

/// A static, acyclic graph of stages.
///
/// Dependencies can only point to stages that were added before, so the graph is acyclic by
/// construction. A walk starts the root, which recursively starts its dependencies depth first,
/// waits for them by polling, and then launches its own work. Stage workers run on their own
/// tasks while the walk itself runs on a single task that owns the graph.
pub struct StageGraph {
    nodes: Vec<Node>,
    root: Option<StageKey>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Adds `stage` depending on `deps`, in the order they should be started.
    pub fn add_stage(
        &mut self,
        stage: Arc<dyn Stage>,
        deps: &[StageKey],
    ) -> MigrateResult<StageKey> {
        if let Some(dep) = deps.iter().find(|dep| dep.0 >= self.nodes.len()) {
            bail!(
                ErrorKind::InvalidState,
                "Stage dependency is not part of the graph",
                format!("Stage {} depends on unknown stage key {}", stage.id(), dep.0)
            );
        }

        let key = StageKey(self.nodes.len());
        self.nodes.push(Node {
            stage,
            deps: deps.to_vec(),
            enabled: true,
            started: false,
            finished: false,
            done: false,
            restored: false,
            fatal_error: None,
            error_reported: false,
            worker: None,
        });

        Ok(key)
    }

    /// Sets the stage the walk starts from.
    pub fn set_root(&mut self, key: StageKey) {
        self.root = Some(key);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stage(&self, key: StageKey) -> Option<&Arc<dyn Stage>> {
        self.nodes.get(key.0).map(|node| &node.stage)
    }

    pub fn find(&self, id: StageId) -> Option<StageKey> {
        self.nodes
            .iter()
            .position(|node| node.stage.id() == id)
            .map(StageKey)
    }

    pub fn dependencies(&self, key: StageKey) -> &[StageKey] {
        self.nodes
            .get(key.0)
            .map(|node| node.deps.as_slice())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, key: StageKey) -> bool {
        self.nodes.get(key.0).is_some_and(|node| node.enabled)
    }

    pub fn is_finished(&self, key: StageKey) -> bool {
        self.nodes.get(key.0).is_some_and(|node| node.finished)
    }

    /// Computes which stages take part in a run with `options`.
    ///
    /// Returns the enablement of every stage, in insertion order.
    pub fn prepare(&mut self, options: &MigrationOptions) -> Vec<(StageId, bool)> {
        self.nodes
            .iter_mut()
            .map(|node| {
                node.enabled = node.stage.enabled(options);
                (node.stage.id(), node.enabled)
            })
            .collect()
    }

    /// Re-arms the graph for a new walk.
    ///
    /// Stages that finished, in this process or according to `persisted`, are kept finished and
    /// their work is never run again. Everything else is cleared.
    pub fn reset(&mut self, persisted: &WorkStatusInfo) {
        for node in self.nodes.iter_mut() {
            let id = node.stage.id();
            node.stage.on_reset(persisted);

            node.fatal_error = None;
            node.error_reported = false;
            if let Some(worker) = node.worker.take() {
                worker.abort();
            }

            if node.finished {
                continue;
            }

            let persisted_finished = persisted
                .stage(id)
                .is_some_and(|info| info.status == WorkStatus::Finished);

            node.started = false;
            node.done = persisted_finished;
            node.restored = persisted_finished;

            if persisted_finished {
                debug!(stage = %id, "stage finished in an earlier run");
            }
        }
    }

    /// Walks the graph from its root until every enabled stage finished, one of them failed or
    /// the walk is cancelled through `shutdown`.
    ///
    /// A failure stops the branches that depend on the failed stage while independent branches
    /// keep running to completion. All failures are returned together.
    pub async fn walk(&mut self, run: &RunContext, shutdown: &ShutdownRx) -> MigrateResult<()> {
        let Some(root) = self.root else {
            bail!(ErrorKind::InvalidState, "Stage graph has no root");
        };

        let walk = Walk::new(run, shutdown);

        let result = match self.start(root, &walk, Vec::new()).await {
            Ok(_) if self.nodes[root.0].finished => Ok(()),
            Ok(_) => self.wait_dependencies(vec![root], &walk).await,
            Err(err) => Err(err),
        };

        self.drain().await;

        result
    }

    /// Starts the stage at `key` once its dependencies finished.
    ///
    /// Returns `true` when this call launched the stage and `false` when it was already started
    /// along another path.
    fn start<'a>(
        &'a mut self,
        key: StageKey,
        walk: &'a Walk<'a>,
        path: Vec<StageId>,
    ) -> BoxFuture<'a, MigrateResult<bool>> {
        async move {
            if self.nodes[key.0].started {
                return Ok(false);
            }

            walk.shutdown.check()?;

            let id = self.nodes[key.0].stage.id();
            let mut path = path;
            path.push(id);
            debug!(stage = %id, ?path, "starting stage");

            self.nodes[key.0].started = true;

            let mut errors = Vec::new();
            let mut pending = Vec::new();
            let deps = self.nodes[key.0].deps.clone();
            for dep in deps {
                match self.start(dep, walk, path.clone()).await {
                    Ok(_) if !self.nodes[dep.0].finished => pending.push(dep),
                    Ok(_) => {}
                    Err(err) => errors.push(err),
                }
            }

            // We wait for every dependency that started fine even if a sibling failed, so that
            // independent branches run to completion.
            if let Err(err) = self.wait_dependencies(pending, walk).await {
                errors.push(err);
            }

            if !errors.is_empty() {
                let err = MigrateError::from(errors);
                let node = &mut self.nodes[key.0];

                if err.is_aborted() {
                    if node.enabled && !node.done && id.is_work_stage() {
                        walk.context(id).push_status_or_log(Transition::aborted());
                    }
                    node.fatal_error = Some(err.clone());
                } else {
                    node.stage.on_skipped();
                    node.fatal_error = Some(dependency_failed(id));
                }
                node.error_reported = true;

                return Err(err);
            }

            self.launch(key, walk).await?;

            Ok(true)
        }
        .boxed()
    }

    async fn launch(&mut self, key: StageKey, walk: &Walk<'_>) -> MigrateResult<()> {
        let node = &mut self.nodes[key.0];
        let id = node.stage.id();

        if !node.enabled {
            info!(stage = %id, "skipping disabled stage");
            node.done = true;
            return Ok(());
        }

        if node.restored {
            info!(stage = %id, "skipping stage that finished in an earlier run");
            return Ok(());
        }

        match node.stage.kind() {
            StageKind::Barrier => {}
            StageKind::Worker => {
                let stage = Arc::clone(&node.stage);
                let ctx = walk.context(id);
                node.worker = Some(tokio::spawn(run_worker(stage, ctx, walk.stage_timeout)));

                info!(stage = %id, "launched stage worker");
            }
            StageKind::Polled => {
                let ctx = walk.context(id);
                if let Err(err) = node.stage.on_start(&ctx).await {
                    error!(stage = %id, error = %err, "stage failed to start");
                    ctx.report_failure(&err);
                    node.record_failure(&err);

                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Polls `pending` until all of them finished or failed.
    ///
    /// Between rounds the walk sleeps for the largest polling interval among the stages still
    /// pending, bounded below by the configured minimum. Cancellation interrupts the sleep.
    async fn wait_dependencies(
        &mut self,
        mut pending: Vec<StageKey>,
        walk: &Walk<'_>,
    ) -> MigrateResult<()> {
        let mut errors = Vec::new();
        let mut shutdown = walk.shutdown.clone();

        while !pending.is_empty() {
            let mut delay = walk.min_poll_interval;
            let mut still_pending = Vec::with_capacity(pending.len());

            for dep in pending {
                match self.update(dep, walk).await {
                    Ok(true) => {
                        if let Err(err) = self.finish(dep, walk).await {
                            errors.push(err);
                        }
                    }
                    Ok(false) => {
                        let interval = self.nodes[dep.0]
                            .stage
                            .update_interval()
                            .unwrap_or(walk.default_update_interval);
                        delay = delay.max(interval);
                        still_pending.push(dep);
                    }
                    Err(err) => errors.push(err),
                }
            }

            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            if let Some(max) = walk.max_poll_interval {
                delay = delay.min(max.max(walk.min_poll_interval));
            }

            if shutdown.sleep(delay).await.should_shutdown() {
                debug!("stopped waiting for dependencies, walk was cancelled");
                errors.push(migrate_error!(
                    ErrorKind::Aborted,
                    "Stage graph walk was cancelled"
                ));
                break;
            }
        }

        if errors.is_empty() {
            return Ok(());
        }

        Err(errors.into())
    }

    /// Returns whether the stage at `key` completed, or the error it failed with.
    async fn update(&mut self, key: StageKey, walk: &Walk<'_>) -> MigrateResult<bool> {
        let node = &mut self.nodes[key.0];
        let id = node.stage.id();

        if let Some(err) = node.fatal_error.clone() {
            return Err(node.propagate_error(err));
        }

        if node.finished || node.done {
            return Ok(true);
        }

        match node.stage.kind() {
            StageKind::Barrier => Ok(true),
            StageKind::Worker => {
                let Some(worker) = node.worker.as_mut() else {
                    bail!(
                        ErrorKind::InvalidState,
                        "Stage worker was never launched",
                        format!("Stage {id} is waited on but has no worker")
                    );
                };

                if !worker.is_finished() {
                    return Ok(false);
                }

                let result = worker.await;
                node.worker = None;

                match result {
                    Ok(Ok(())) => {
                        node.done = true;
                        Ok(true)
                    }
                    Ok(Err(err)) => {
                        node.record_failure(&err);
                        Err(err)
                    }
                    Err(join_err) => {
                        let err = MigrateError::from(join_err);
                        error!(stage = %id, error = %err, "stage worker panicked");
                        walk.context(id).report_failure(&err);
                        node.record_failure(&err);

                        Err(err)
                    }
                }
            }
            StageKind::Polled => {
                let ctx = walk.context(id);
                match node.stage.poll(&ctx).await {
                    Ok(true) => {
                        node.done = true;
                        Ok(true)
                    }
                    Ok(false) => Ok(false),
                    Err(err) => {
                        if !err.is_aborted() {
                            error!(stage = %id, error = %err, "stage failed while polled");
                        }
                        ctx.report_failure(&err);
                        node.record_failure(&err);

                        Err(err)
                    }
                }
            }
        }
    }

    /// Marks a completed stage finished, releasing its dependents.
    async fn finish(&mut self, key: StageKey, walk: &Walk<'_>) -> MigrateResult<()> {
        let node = &mut self.nodes[key.0];
        if node.finished {
            return Ok(());
        }

        let id = node.stage.id();
        if node.enabled && !node.restored {
            let ctx = walk.context(id);
            if let Err(err) = node.stage.on_finish(&ctx).await {
                error!(stage = %id, error = %err, "stage failed to finish");
                ctx.report_failure(&err);
                node.record_failure(&err);

                return Err(err);
            }
        }

        node.finished = true;
        debug!(stage = %id, "stage finished");

        Ok(())
    }

    /// Waits for workers still running after the walk ended, which only happens when the walk
    /// was cancelled.
    async fn drain(&mut self) {
        for node in self.nodes.iter_mut() {
            let Some(worker) = node.worker.take() else {
                continue;
            };

            let id = node.stage.id();
            debug!(stage = %id, "waiting for stage worker to stop");

            match worker.await {
                Ok(Ok(())) => node.done = true,
                Ok(Err(err)) => {
                    if !err.is_aborted() {
                        warn!(
                            stage = %id,
                            error = %err,
                            "stage worker failed after the walk ended"
                        );
                    }
                    node.record_failure(&err);
                }
                Err(join_err) => {
                    let err = MigrateError::from(join_err);
                    warn!(stage = %id, error = %err, "stage worker panicked after the walk ended");
                    node.record_failure(&err);
                }
            }
        }
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the task of a [`StageKind::Worker`] stage.
///
/// This is the single place where worker failures are recorded in the status store.
async fn run_worker(
    stage: Arc<dyn Stage>,
    ctx: StageContext,
    timeout: Option<Duration>,
) -> MigrateResult<()> {
    let id = stage.id();

    let result = async {
        migrate_fail_point(&stage_worker_fail_point(id))?;

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, stage.run(ctx.clone())).await {
                Ok(result) => result,
                Err(_) => Err(migrate_error!(
                    ErrorKind::StageTimeout,
                    "Stage did not complete in time",
                    format!("Stage {id} did not complete within {limit:?}")
                )),
            },
            None => stage.run(ctx.clone()).await,
        }
    }
    .await;

    match &result {
        Ok(()) => debug!(stage = %id, "stage worker completed"),
        Err(err) if err.is_aborted() => info!(stage = %id, "stage worker aborted"),
        Err(err) => error!(stage = %id, error = %err, "stage worker failed"),
    }

    if let Err(err) = &result {
        ctx.report_failure(err);
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use config::shared::MigrationType;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::run::{TestRun, fast_config};

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        Fail,
        Panic,
        RunUntilStopped,
    }

    struct TestStage {
        id: StageId,
        kind: StageKind,
        outcome: Outcome,
        hot_only: bool,
        runs: AtomicUsize,
        polls: AtomicUsize,
        finished: AtomicBool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl TestStage {
        fn new(
            id: StageId,
            kind: StageKind,
            outcome: Outcome,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Self::build(id, kind, outcome, false, log)
        }

        fn hot_only(id: StageId, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Self::build(id, StageKind::Worker, Outcome::Succeed, true, log)
        }

        fn build(
            id: StageId,
            kind: StageKind,
            outcome: Outcome,
            hot_only: bool,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                id,
                kind,
                outcome,
                hot_only,
                runs: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
                log: Arc::clone(log),
            })
        }

        fn record(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{event}", self.id));
        }
    }

    #[async_trait]
    impl Stage for TestStage {
        fn id(&self) -> StageId {
            self.id
        }

        fn kind(&self) -> StageKind {
            self.kind
        }

        fn enabled(&self, options: &MigrationOptions) -> bool {
            !self.hot_only || options.is_hot()
        }

        async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.record("run");
            ctx.push_status(Transition::begin())?;

            match self.outcome {
                Outcome::Succeed => {}
                Outcome::Fail => bail!(ErrorKind::ExportFailed, "Export failed", "boom"),
                Outcome::Panic => panic!("stage worker panicked on purpose"),
                Outcome::RunUntilStopped => loop {
                    ctx.sleep(Duration::from_millis(10)).await?;
                },
            }

            ctx.push_status(Transition::end())?;
            self.record("done");

            Ok(())
        }

        async fn poll(&self, _ctx: &StageContext) -> MigrateResult<bool> {
            Ok(self.polls.fetch_add(1, Ordering::SeqCst) >= 2)
        }

        async fn on_finish(&self, _ctx: &StageContext) -> MigrateResult<()> {
            self.finished.store(true, Ordering::SeqCst);
            self.record("finish");
            Ok(())
        }
    }

    fn index_of(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing log entry {entry} in {log:?}"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dependencies_finish_before_dependents_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let compartment = TestStage::new(
            StageId::ProvisionCompartment,
            StageKind::Worker,
            Outcome::Succeed,
            &log,
        );
        let bucket = TestStage::new(
            StageId::ProvisionBucket,
            StageKind::Worker,
            Outcome::Succeed,
            &log,
        );
        let dump = TestStage::new(StageId::Dump, StageKind::Worker, Outcome::Succeed, &log);
        let root = TestStage::new(
            StageId::Orchestration,
            StageKind::Barrier,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let compartment_key = graph.add_stage(compartment.clone(), &[]).unwrap();
        let bucket_key = graph.add_stage(bucket.clone(), &[compartment_key]).unwrap();
        let dump_key = graph.add_stage(dump.clone(), &[bucket_key]).unwrap();
        let root_key = graph.add_stage(root, &[dump_key]).unwrap();
        graph.set_root(root_key);

        let run = TestRun::new(fast_config());
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        graph.walk(&run.context(), &shutdown_rx).await.unwrap();

        let log = log.lock().unwrap().clone();
        assert!(
            index_of(&log, "PROVISION_COMPARTMENT:finish") < index_of(&log, "PROVISION_BUCKET:run")
        );
        assert!(index_of(&log, "PROVISION_BUCKET:finish") < index_of(&log, "DUMP:run"));
        assert!(graph.is_finished(root_key));
        assert_eq!(
            run.context().status().stage_status(StageId::Dump),
            Some(WorkStatus::Finished)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_stages_finish_without_running() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let channel = TestStage::hot_only(StageId::CreateChannel, &log);
        let congrats = TestStage::new(StageId::Congrats, StageKind::Worker, Outcome::Succeed, &log);
        let root = TestStage::new(
            StageId::Orchestration,
            StageKind::Barrier,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let channel_key = graph.add_stage(channel.clone(), &[]).unwrap();
        let congrats_key = graph.add_stage(congrats.clone(), &[channel_key]).unwrap();
        let root_key = graph.add_stage(root, &[congrats_key]).unwrap();
        graph.set_root(root_key);

        let mut config = fast_config();
        config.options.migration_type = MigrationType::Cold;
        let enablement = graph.prepare(&config.options);
        assert!(enablement.contains(&(StageId::CreateChannel, false)));

        let run = TestRun::new(config);
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        graph.walk(&run.context(), &shutdown_rx).await.unwrap();

        assert_eq!(channel.runs.load(Ordering::SeqCst), 0);
        assert!(!channel.finished.load(Ordering::SeqCst));
        assert_eq!(congrats.runs.load(Ordering::SeqCst), 1);
        assert!(graph.is_finished(channel_key));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_stage_stops_dependents_but_not_siblings() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dump = TestStage::new(StageId::Dump, StageKind::Worker, Outcome::Fail, &log);
        let db_system = TestStage::new(
            StageId::ProvisionDbSystem,
            StageKind::Worker,
            Outcome::Succeed,
            &log,
        );
        let crash_recovery = TestStage::new(
            StageId::EnableCrashRecovery,
            StageKind::Worker,
            Outcome::Succeed,
            &log,
        );
        let congrats = TestStage::new(StageId::Congrats, StageKind::Worker, Outcome::Succeed, &log);
        let root = TestStage::new(
            StageId::Orchestration,
            StageKind::Barrier,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let dump_key = graph.add_stage(dump.clone(), &[]).unwrap();
        let db_system_key = graph.add_stage(db_system.clone(), &[]).unwrap();
        let crash_key = graph
            .add_stage(crash_recovery.clone(), &[dump_key, db_system_key])
            .unwrap();
        let congrats_key = graph.add_stage(congrats.clone(), &[crash_key]).unwrap();
        let root_key = graph.add_stage(root, &[crash_key, congrats_key]).unwrap();
        graph.set_root(root_key);

        let run = TestRun::new(fast_config());
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let err = graph.walk(&run.context(), &shutdown_rx).await.unwrap_err();

        // The original failure reaches the top exactly once, other paths see a dependency failure.
        let kinds = err.kinds();
        assert_eq!(
            kinds.iter().filter(|kind| **kind == ErrorKind::ExportFailed).count(),
            1
        );
        assert!(kinds.iter().all(|kind| matches!(
            kind,
            ErrorKind::ExportFailed | ErrorKind::DependencyFailed
        )));

        assert_eq!(db_system.runs.load(Ordering::SeqCst), 1);
        assert!(graph.is_finished(db_system_key));
        assert_eq!(crash_recovery.runs.load(Ordering::SeqCst), 0);
        assert_eq!(congrats.runs.load(Ordering::SeqCst), 0);

        let snapshot = run.context().status().snapshot();
        let dump_info = snapshot.stage(StageId::Dump).unwrap();
        assert_eq!(dump_info.status, WorkStatus::Error);
        assert_eq!(dump_info.errors.len(), 1);
        assert_eq!(dump_info.message, "boom");
        assert_eq!(
            snapshot.stage(StageId::EnableCrashRecovery).unwrap().status,
            WorkStatus::NotStarted
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_skips_stages_that_already_finished() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bucket = TestStage::new(
            StageId::ProvisionBucket,
            StageKind::Worker,
            Outcome::Succeed,
            &log,
        );
        let dump = TestStage::new(StageId::Dump, StageKind::Worker, Outcome::Succeed, &log);
        let root = TestStage::new(
            StageId::Orchestration,
            StageKind::Barrier,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let bucket_key = graph.add_stage(bucket.clone(), &[]).unwrap();
        let dump_key = graph.add_stage(dump.clone(), &[bucket_key]).unwrap();
        let root_key = graph.add_stage(root, &[dump_key]).unwrap();
        graph.set_root(root_key);

        let run = TestRun::new(fast_config());
        let status = run.context().status().clone();
        status
            .log_transition(StageId::ProvisionBucket, &Transition::end())
            .unwrap();
        status
            .log_transition(StageId::Dump, &Transition::error(vec![]))
            .unwrap();

        graph.reset(&status.snapshot());
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        graph.walk(&run.context(), &shutdown_rx).await.unwrap();

        assert_eq!(bucket.runs.load(Ordering::SeqCst), 0);
        assert!(!bucket.finished.load(Ordering::SeqCst));
        assert_eq!(dump.runs.load(Ordering::SeqCst), 1);

        // A second walk after a reset has nothing left to do.
        graph.reset(&status.snapshot());
        graph.walk(&run.context(), &shutdown_rx).await.unwrap();
        assert_eq!(dump.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_aborts_running_and_waiting_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dump = TestStage::new(StageId::Dump, StageKind::Worker, Outcome::RunUntilStopped, &log);
        let load = TestStage::new(StageId::Load, StageKind::Worker, Outcome::Succeed, &log);
        let root = TestStage::new(
            StageId::Orchestration,
            StageKind::Barrier,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let dump_key = graph.add_stage(dump.clone(), &[]).unwrap();
        let load_key = graph.add_stage(load.clone(), &[dump_key]).unwrap();
        let root_key = graph.add_stage(root, &[load_key]).unwrap();
        graph.set_root(root_key);

        let run = TestRun::new(fast_config());
        let context = run.context();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let walk = tokio::spawn(async move {
            let result = graph.walk(&context, &shutdown_rx).await;
            (graph, result)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.shutdown();

        let (graph, result) = walk.await.unwrap();
        assert!(result.unwrap_err().is_aborted());
        assert!(!graph.is_finished(load_key));
        assert_eq!(load.runs.load(Ordering::SeqCst), 0);

        let status = run.context().status().clone();
        assert_eq!(status.stage_status(StageId::Dump), Some(WorkStatus::Aborted));
        assert_eq!(status.stage_status(StageId::Load), Some(WorkStatus::Aborted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_worker_is_reported_as_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dump = TestStage::new(StageId::Dump, StageKind::Worker, Outcome::Panic, &log);
        let root = TestStage::new(
            StageId::Orchestration,
            StageKind::Barrier,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let dump_key = graph.add_stage(dump, &[]).unwrap();
        let root_key = graph.add_stage(root, &[dump_key]).unwrap();
        graph.set_root(root_key);

        let run = TestRun::new(fast_config());
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let err = graph.walk(&run.context(), &shutdown_rx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StagePanic);
        assert_eq!(
            run.context().status().stage_status(StageId::Dump),
            Some(WorkStatus::Error)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn polled_stages_run_until_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tunnel = TestStage::new(
            StageId::CreateSshTunnel,
            StageKind::Polled,
            Outcome::Succeed,
            &log,
        );
        let channel = TestStage::new(
            StageId::CreateChannel,
            StageKind::Worker,
            Outcome::Succeed,
            &log,
        );

        let mut graph = StageGraph::new();
        let tunnel_key = graph.add_stage(tunnel.clone(), &[]).unwrap();
        let channel_key = graph.add_stage(channel.clone(), &[tunnel_key]).unwrap();
        graph.set_root(channel_key);

        let run = TestRun::new(fast_config());
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        graph.walk(&run.context(), &shutdown_rx).await.unwrap();

        assert_eq!(tunnel.polls.load(Ordering::SeqCst), 3);
        assert!(tunnel.finished.load(Ordering::SeqCst));
        assert_eq!(channel.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dependencies_must_exist() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = StageGraph::new();
        let mut other = StageGraph::new();
        let foreign = other
            .add_stage(
                TestStage::new(StageId::Dump, StageKind::Worker, Outcome::Succeed, &log),
                &[],
            )
            .unwrap();

        let err = graph
            .add_stage(
                TestStage::new(StageId::Load, StageKind::Worker, Outcome::Succeed, &log),
                &[foreign],
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
