use std::sync::Arc;

use config::shared::{CloudConnectivity, MigrationConfig, MigrationType, WorkRequestPolling};
use secrecy::SecretString;

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::MigrateResult;
use crate::orchestrator::{Collaborators, RunContext};
use crate::test_utils::cloud::FakeCloud;
use crate::test_utils::frontend::RecordingFrontend;
use crate::test_utils::helper::FakeHelper;
use crate::test_utils::source::FakeSource;
use crate::test_utils::tool::ScriptedExportTool;

/// Host of the source database in the test configurations.
pub const SOURCE_HOST: &str = "db.example.com";

/// Cold migration configuration with every interval and delay cut to a few milliseconds.
pub fn fast_config() -> MigrationConfig {
    let mut config = MigrationConfig::default();

    config.scheduler.min_poll_interval_ms = 1;
    config.scheduler.default_update_interval_ms = 5;
    config.scheduler.max_poll_interval_ms = Some(5);

    config.export_retry.base_delay_ms = 1;
    config.export_retry.max_delay_ms = 5;

    config.cloud_retry.base_delay_ms = 1;
    config.cloud_retry.max_delay_ms = 5;

    config.monitor.update_interval_ms = 5;
    config.monitor.error_update_interval_ms = 5;

    config.helper.not_ready_retry_delay_ms = 1;
    config.helper.connect_retry_delay_ms = 1;

    config.work_request.polling = WorkRequestPolling::Fixed;
    config.work_request.poll_interval_ms = 1;

    let options = &mut config.options;
    options.migration_type = MigrationType::Cold;
    options.source.host = SOURCE_HOST.to_owned();
    options.source.port = 3306;
    options.source.user = "root".to_owned();
    options.source.password = Some(SecretString::new("source-secret".to_owned()));
    options.target.user = "admin".to_owned();
    options.target.password = Some(SecretString::new("target-secret".to_owned()));

    config
}

/// Hot migration over a site-to-site network, on top of [`fast_config`].
pub fn hot_config() -> MigrationConfig {
    let mut config = fast_config();
    config.options.migration_type = MigrationType::Hot;
    config.options.cloud_connectivity = CloudConnectivity::SiteToSite;

    config
}

/// A run wired to in-memory fakes of every external system.
///
/// Every call to [`TestRun::context`] returns the same run, so stages run one after the other
/// see what earlier ones recorded.
pub struct TestRun {
    pub cloud: Arc<FakeCloud>,
    pub helper: Arc<FakeHelper>,
    pub tool: Arc<ScriptedExportTool>,
    pub source: Arc<FakeSource>,
    pub frontend: Arc<RecordingFrontend>,
    config: MigrationConfig,
    context: RunContext,
    shutdown_tx: ShutdownTx,
}

impl TestRun {
    /// Creates a run that persists nothing.
    pub fn new(config: MigrationConfig) -> Self {
        let fakes = Fakes::default();
        let context = RunContext::in_memory(config.clone(), fakes.collaborators());

        fakes.into_run(config, context)
    }

    /// Creates a run persisting its documents in `config.work_dir`.
    pub fn persistent(config: MigrationConfig) -> MigrateResult<Self> {
        let fakes = Fakes::default();
        let context = RunContext::new(config.clone(), fakes.collaborators())?;

        Ok(fakes.into_run(config, context))
    }

    /// Replaces the run by a new one reading the same work directory, as a restarted process
    /// would. The fakes are kept.
    pub fn restart(&mut self) -> MigrateResult<()> {
        self.context = RunContext::new(self.config.clone(), self.collaborators())?;
        self.shutdown_tx = create_shutdown_channel().0;

        Ok(())
    }

    pub fn context(&self) -> RunContext {
        self.context.clone()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cloud: self.cloud.clone(),
            helpers: self.helper.clone(),
            export_tool: self.tool.clone(),
            source: self.source.clone(),
            frontend: self.frontend.clone(),
        }
    }

    pub fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_tx.subscribe()
    }

    /// Cancels every stage that was given a receiver from [`TestRun::shutdown_rx`].
    pub fn shutdown(&self) {
        self.shutdown_tx.shutdown();
    }
}

#[derive(Default)]
struct Fakes {
    cloud: Arc<FakeCloud>,
    helper: Arc<FakeHelper>,
    tool: Arc<ScriptedExportTool>,
    source: Arc<FakeSource>,
    frontend: Arc<RecordingFrontend>,
}

impl Fakes {
    fn collaborators(&self) -> Collaborators {
        Collaborators {
            cloud: self.cloud.clone(),
            helpers: self.helper.clone(),
            export_tool: self.tool.clone(),
            source: self.source.clone(),
            frontend: self.frontend.clone(),
        }
    }

    fn into_run(self, config: MigrationConfig, context: RunContext) -> TestRun {
        let (shutdown_tx, _) = create_shutdown_channel();

        TestRun {
            cloud: self.cloud,
            helper: self.helper,
            tool: self.tool,
            source: self.source,
            frontend: self.frontend,
            config,
            context,
            shutdown_tx,
        }
    }
}
