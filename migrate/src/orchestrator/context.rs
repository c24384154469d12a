use std::fmt;
use std::sync::Arc;

use config::shared::MigrationConfig;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cloud::{CloudProvider, RetryingCloud};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, MigrateResult};
use crate::frontend::Frontend;
use crate::remote::{HelperClient, HelperConnector, HelperTransport};
use crate::resources::{
    BucketPar, COORDINATES_FILE_NAME, CoordinatesDocument, RESOURCES_FILE_NAME, ResourceDocument,
};
use crate::source::{ServerInfo, SourceDatabase};
use crate::status::{MigrationSummary, PROGRESS_FILE_NAME, WorkStatusStore};
use crate::workers::ExportTool;
use crate::{bail, migrate_error};

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cloud: Arc<dyn CloudProvider>,
    pub helpers: Arc<dyn HelperConnector>,
    pub export_tool: Arc<dyn ExportTool>,
    pub source: Arc<dyn SourceDatabase>,
    pub frontend: Arc<dyn Frontend>,
}

struct RunInner {
    run_id: Uuid,
    config: MigrationConfig,
    status: Arc<WorkStatusStore>,
    resources: Arc<ResourceDocument>,
    coordinates: Arc<CoordinatesDocument>,
    collaborators: Collaborators,
    /// Transport to the remote helper, shared by every stage of the run once connected.
    helper: Mutex<Option<Arc<dyn HelperTransport>>>,
    bucket_par: Mutex<()>,
    source_info: OnceCell<ServerInfo>,
}

/// State shared by every stage of one run.
///
/// Cheap to clone. Resource identifiers and replication coordinates live in watched documents
/// that are persisted on every write, so a run restarted from the same work directory sees
/// everything earlier attempts discovered or created.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunInner>,
}

impl RunContext {
    /// Creates the context of a run persisting its documents in `config.work_dir`.
    pub fn new(config: MigrationConfig, collaborators: Collaborators) -> MigrateResult<Self> {
        std::fs::create_dir_all(&config.work_dir)?;

        let status = WorkStatusStore::open(config.work_dir.join(PROGRESS_FILE_NAME))?;
        let resources = ResourceDocument::open(config.work_dir.join(RESOURCES_FILE_NAME))?;
        let coordinates = CoordinatesDocument::open(config.work_dir.join(COORDINATES_FILE_NAME))?;

        Ok(Self::build(config, collaborators, status, resources, coordinates))
    }

    /// Creates the context of a run that persists nothing.
    pub fn in_memory(config: MigrationConfig, collaborators: Collaborators) -> Self {
        Self::build(
            config,
            collaborators,
            WorkStatusStore::in_memory(),
            ResourceDocument::in_memory(Default::default()),
            CoordinatesDocument::in_memory(None),
        )
    }

    fn build(
        config: MigrationConfig,
        collaborators: Collaborators,
        status: WorkStatusStore,
        resources: ResourceDocument,
        coordinates: CoordinatesDocument,
    ) -> Self {
        let run_id = Uuid::new_v4();
        info!(%run_id, work_dir = %config.work_dir.display(), "created run context");

        Self {
            inner: Arc::new(RunInner {
                run_id,
                config,
                status: Arc::new(status),
                resources: Arc::new(resources),
                coordinates: Arc::new(coordinates),
                collaborators,
                helper: Mutex::new(None),
                bucket_par: Mutex::new(()),
                source_info: OnceCell::new(),
            }),
        }
    }

    /// Identifies this process' attempt at the migration in logs.
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.inner.config
    }

    pub fn status(&self) -> &Arc<WorkStatusStore> {
        &self.inner.status
    }

    pub fn resources(&self) -> &Arc<ResourceDocument> {
        &self.inner.resources
    }

    pub fn coordinates(&self) -> &Arc<CoordinatesDocument> {
        &self.inner.coordinates
    }

    /// The cloud provider as supplied, without retries. See [`RunContext::retrying_cloud`].
    pub fn cloud(&self) -> &Arc<dyn CloudProvider> {
        &self.inner.collaborators.cloud
    }

    /// The cloud provider retrying transient errors as configured, waits ending on `shutdown`.
    pub fn retrying_cloud(&self, shutdown: &ShutdownRx) -> RetryingCloud {
        RetryingCloud::new(
            self.cloud().clone(),
            self.inner.config.cloud_retry.clone(),
            shutdown.clone(),
        )
    }

    pub fn export_tool(&self) -> &Arc<dyn ExportTool> {
        &self.inner.collaborators.export_tool
    }

    pub fn source(&self) -> &Arc<dyn SourceDatabase> {
        &self.inner.collaborators.source
    }

    pub fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.inner.collaborators.frontend
    }

    /// Returns a client of the remote helper on the jump host, connecting on first use.
    ///
    /// While the helper is still booting the connection is retried up to
    /// `helper.connect_attempts` times. Commands sent through the client give up when `shutdown`
    /// is signalled.
    pub async fn helper(&self, shutdown: &ShutdownRx) -> MigrateResult<HelperClient> {
        let config = &self.inner.config.helper;
        let mut cached = self.inner.helper.lock().await;

        if let Some(transport) = cached.as_ref() {
            return Ok(HelperClient::new(
                Arc::clone(transport),
                config.clone(),
                shutdown.clone(),
            ));
        }

        let host = self.inner.resources.read(|resources| {
            if resources.compute_public_ip.is_empty() {
                resources.compute_private_ip.clone()
            } else {
                resources.compute_public_ip.clone()
            }
        });
        if host.is_empty() {
            bail!(
                ErrorKind::MissingResource,
                "Jump host address is not known",
                "The jump host must be provisioned before the remote helper can be reached"
            );
        }

        let mut attempt = 0;
        let transport = loop {
            attempt += 1;
            shutdown.check()?;

            match self.inner.collaborators.helpers.connect(&host).await {
                Ok(transport) => break transport,
                Err(err)
                    if err.kind() == ErrorKind::RemoteHelperTransient
                        && attempt < config.connect_attempts =>
                {
                    warn!(
                        %host,
                        attempt,
                        error = %err,
                        "remote helper is not reachable yet, retrying"
                    );
                    shutdown
                        .clone()
                        .sleep_or_abort(config.connect_retry_delay())
                        .await?;
                }
                Err(err) => return Err(err),
            }
        };

        info!(%host, attempt, "connected to remote helper");
        *cached = Some(Arc::clone(&transport));

        Ok(HelperClient::new(transport, config.clone(), shutdown.clone()))
    }

    /// Drops the cached helper connection, so that the next use reconnects.
    pub async fn disconnect_helper(&self) {
        if self.inner.helper.lock().await.take().is_some() {
            info!("dropped remote helper connection");
        }
    }

    /// Returns the pre-authenticated request to the dump location, creating it on first use.
    ///
    /// The request is kept in memory only: every process creates its own.
    pub async fn bucket_par(&self, shutdown: &ShutdownRx) -> MigrateResult<BucketPar> {
        let _guard = self.inner.bucket_par.lock().await;

        let (bucket, par) = self
            .inner
            .resources
            .read(|resources| (resources.bucket_name.clone(), resources.bucket_par.clone()));
        if let Some(par) = par {
            return Ok(par);
        }

        if bucket.is_empty() {
            return Err(migrate_error!(
                ErrorKind::MissingResource,
                "Bucket is not known",
                "The bucket must be provisioned before the dump location can be accessed"
            ));
        }

        let prefix = &self.inner.config.options.dump_prefix;
        let par = self
            .retrying_cloud(shutdown)
            .create_bucket_par(&bucket, prefix)
            .await?;
        info!(%bucket, %prefix, par_id = %par.id, "created pre-authenticated request");

        self.inner
            .resources
            .update(|resources| resources.bucket_par = Some(par.clone()))?;

        Ok(par)
    }

    /// Returns what the source server reported about itself, asking it once per run.
    pub async fn source_info(&self) -> MigrateResult<ServerInfo> {
        self.inner
            .source_info
            .get_or_try_init(|| self.inner.collaborators.source.server_info())
            .await
            .cloned()
    }

    /// Summarizes the choices and resources of the run for the status document.
    pub fn summary(&self) -> MigrationSummary {
        let options = &self.inner.config.options;

        self.inner.resources.read(|resources| MigrationSummary {
            migration_type: options.migration_type,
            cloud_connectivity: options.cloud_connectivity,
            region: options.region.clone(),
            compartment_name: resources.compartment_name.clone(),
            db_system_name: options.names.db_system.clone(),
            db_system_id: resources.db_system_id.clone(),
            db_system_ip: resources.db_system_ip.clone(),
            db_system_version: resources.db_system_version.clone(),
            channel_id: resources.channel_id.clone(),
            jump_host_name: resources.compute_name.clone(),
            jump_host_id: resources.compute_id.clone(),
            jump_host_private_ip: resources.compute_private_ip.clone(),
            jump_host_public_ip: resources.compute_public_ip.clone(),
            created_jump_host: resources.compute_created,
            source_host: options.source.host.clone(),
            source_port: options.source.port,
            bucket_namespace: resources.bucket_namespace.clone(),
            bucket_name: resources.bucket_name.clone(),
            created_bucket: resources.bucket_created,
        })
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.inner.run_id)
            .field("work_dir", &self.inner.config.work_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::run::{TestRun, fast_config};

    #[tokio::test]
    async fn helper_connection_is_retried_and_shared() {
        let run = TestRun::new(fast_config());
        run.context()
            .resources()
            .update(|resources| resources.compute_private_ip = "10.0.0.4".to_owned())
            .unwrap();
        run.helper.fail_connects(2);

        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        run.context().helper(&shutdown_rx).await.unwrap();
        run.context().helper(&shutdown_rx).await.unwrap();

        assert_eq!(run.helper.connects(), 3);
        assert_eq!(run.helper.connected_hosts(), vec!["10.0.0.4"; 3]);
    }

    #[tokio::test]
    async fn helper_connection_gives_up_after_the_configured_attempts() {
        let mut config = fast_config();
        config.helper.connect_attempts = 2;
        let run = TestRun::new(config);
        run.context()
            .resources()
            .update(|resources| resources.compute_public_ip = "203.0.113.7".to_owned())
            .unwrap();
        run.helper.fail_connects(5);

        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let err = run.context().helper(&shutdown_rx).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteHelperTransient);
        assert_eq!(run.helper.connects(), 2);
    }

    #[tokio::test]
    async fn bucket_par_is_created_once_per_run() {
        let run = TestRun::new(fast_config());
        run.context()
            .resources()
            .update(|resources| resources.bucket_name = "migration-bucket".to_owned())
            .unwrap();

        let first = run.context().bucket_par(&run.shutdown_rx()).await.unwrap();
        let second = run.context().bucket_par(&run.shutdown_rx()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(run.cloud.pars_created(), 1);
    }

    #[tokio::test]
    async fn bucket_par_needs_a_bucket() {
        let run = TestRun::new(fast_config());

        let err = run.context().bucket_par(&run.shutdown_rx()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingResource);
    }

    #[tokio::test]
    async fn summary_reflects_the_resources() {
        let run = TestRun::new(fast_config());
        run.context()
            .resources()
            .update(|resources| {
                resources.db_system_id = "ocid1.mysqldbsystem".to_owned();
                resources.compute_created = true;
            })
            .unwrap();

        let summary = run.context().summary();

        assert_eq!(summary.db_system_id, "ocid1.mysqldbsystem");
        assert!(summary.created_jump_host);
        assert_eq!(summary.source_port, 3306);
    }
}
