//! Stages that discover or create the cloud resources of the migration.
//!
//! Every stage follows the same re-entry discipline: a resource id persisted by an earlier
//! attempt is verified first, then the resource is looked up by its deterministic name, and only
//! then created. The id of a created resource is persisted before its work request is awaited,
//! so a crash while waiting never leads to a second creation.

use std::time::Duration;

use async_trait::async_trait;
use config::shared::MigrationOptions;
use futures::FutureExt;
use tracing::info;

use crate::cloud::{
    CloudProvider, ComputeSpec, Created, DbSystem, DbSystemSpec, Ensured, ensure_resource,
    wait_work_request,
};
use crate::error::{ErrorKind, MigrateResult};
use crate::migrate_error;
use crate::remote::DatabaseRole;
use crate::stage::{Stage, StageContext, StageKind};
use crate::status::{Progress, Transition};
use crate::types::StageId;

/// Cloud operations take minutes, there is no point in polling them often.
const PROVISION_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Waits for the work request of a resource this attempt created, if any.
async fn settle<T>(ctx: &StageContext, ensured: &Ensured<T>, context: &str) -> MigrateResult<()> {
    if let Ensured::Created(Created {
        work_request: Some(id),
        ..
    }) = ensured
    {
        wait_work_request(ctx, id, context).await?;
    }

    Ok(())
}

/// Returns the persisted value of a required resource id, failing when an earlier stage did not
/// record it.
fn required(value: String, what: &'static str) -> MigrateResult<String> {
    if value.is_empty() {
        return Err(migrate_error!(
            ErrorKind::MissingResource,
            "A required resource is not known",
            format!("The {what} must be provisioned first")
        ));
    }

    Ok(value)
}

#[derive(Debug, Default)]
pub struct CompartmentStage;

#[async_trait]
impl Stage for CompartmentStage {
    fn id(&self) -> StageId {
        StageId::ProvisionCompartment
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(PROVISION_UPDATE_INTERVAL)
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let cloud = &ctx.cloud();
        let options = &run.config().options;

        ctx.push_status(Transition::begin().with_message("Preparing the compartment"))?;

        // A compartment chosen by the user is never created, only verified.
        let ensured = if let Some(id) = options.compartment_id.clone() {
            let compartment = cloud.get_compartment(&id).await?.ok_or_else(|| {
                migrate_error!(
                    ErrorKind::MissingResource,
                    "Compartment does not exist",
                    format!("Compartment {id} was not found")
                )
            })?;
            Ensured::Existing(compartment)
        } else {
            let persisted = run.resources().read(|resources| resources.compartment_id.clone());
            let name = options.names.compartment.as_str();

            ensure_resource(
                "compartment",
                Some(persisted),
                |id| async move { cloud.get_compartment(&id).await }.boxed(),
                || async move { cloud.find_compartment(name).await }.boxed(),
                || async move { cloud.create_compartment(name).await }.boxed(),
            )
            .await?
        };

        let compartment = ensured.resource().clone();
        run.resources().update(|resources| {
            resources.compartment_id = compartment.id.clone();
            resources.compartment_name = compartment.name.clone();
            resources.network_compartment_id = compartment.id.clone();
            resources.network_compartment_name = compartment.name.clone();
        })?;
        settle(&ctx, &ensured, "Compartment creation").await?;

        ctx.push_status(
            Transition::end().with_message(format!("Compartment {} is ready", compartment.name)),
        )?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct VcnStage;

#[async_trait]
impl Stage for VcnStage {
    fn id(&self) -> StageId {
        StageId::ProvisionVcn
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(PROVISION_UPDATE_INTERVAL)
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let cloud = &ctx.cloud();
        let name = run.config().options.names.vcn.as_str();

        ctx.push_status(Transition::begin().with_message("Preparing the network"))?;

        let (persisted, compartment_id) = run.resources().read(|resources| {
            (
                resources.vcn_id.clone(),
                resources.network_compartment_id.clone(),
            )
        });
        let compartment_id = required(compartment_id, "compartment")?;
        let compartment = compartment_id.as_str();

        let ensured = ensure_resource(
            "vcn",
            Some(persisted),
            |id| async move { cloud.get_vcn(&id).await }.boxed(),
            || async move { cloud.find_vcn(compartment, name).await }.boxed(),
            || async move { cloud.create_vcn(compartment, name).await }.boxed(),
        )
        .await?;

        let vcn_id = ensured.resource().id.clone();
        run.resources()
            .update(|resources| resources.vcn_id = vcn_id.clone())?;
        settle(&ctx, &ensured, "VCN creation").await?;

        ctx.push_status(Transition::end().with_message(format!("Network {name} is ready")))?;

        Ok(())
    }
}

/// Launches the jump host the remote helper runs on.
#[derive(Debug, Default)]
pub struct ComputeStage;

#[async_trait]
impl Stage for ComputeStage {
    fn id(&self) -> StageId {
        StageId::ProvisionCompute
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(PROVISION_UPDATE_INTERVAL)
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let cloud = &ctx.cloud();

        ctx.push_status(Transition::begin().with_message("Preparing the jump host"))?;

        let (persisted, compartment_id, vcn_id) = run.resources().read(|resources| {
            (
                resources.compute_id.clone(),
                resources.compartment_id.clone(),
                resources.vcn_id.clone(),
            )
        });
        let spec = ComputeSpec {
            compartment_id: required(compartment_id, "compartment")?,
            vcn_id: required(vcn_id, "network")?,
            name: run.config().options.names.jump_host.clone(),
        };
        let spec = &spec;

        // Instances that failed or are being terminated cannot be reused.
        let ensured = ensure_resource(
            "compute instance",
            Some(persisted),
            |id| {
                async move {
                    let instance = cloud.get_instance(&id).await?;
                    Ok(instance.filter(|instance| !instance.state.is_gone()))
                }
                .boxed()
            },
            || {
                async move {
                    let instance = cloud.find_instance(&spec.compartment_id, &spec.name).await?;
                    Ok(instance.filter(|instance| !instance.state.is_gone()))
                }
                .boxed()
            },
            || async move { cloud.launch_instance(spec).await }.boxed(),
        )
        .await?;

        let instance_id = ensured.resource().id.clone();
        let created = ensured.was_created();
        run.resources().update(|resources| {
            resources.compute_id = instance_id.clone();
            resources.compute_name = spec.name.clone();
            resources.compute_created |= created;
        })?;
        settle(&ctx, &ensured, "Jump host creation").await?;

        // Addresses are only assigned once the instance is running.
        let instance = cloud.get_instance(&instance_id).await?.ok_or_else(|| {
            migrate_error!(
                ErrorKind::MissingResource,
                "Jump host disappeared",
                format!("Compute instance {instance_id} was not found after its creation")
            )
        })?;
        run.resources().update(|resources| {
            resources.compute_public_ip = instance.public_ip.clone();
            resources.compute_private_ip = instance.private_ip.clone();
        })?;

        ctx.push_status(
            Transition::end()
                .with_message(format!("Jump host {} is running", spec.name))
                .with_info("publicIP", instance.public_ip)
                .with_info("privateIP", instance.private_ip),
        )?;

        Ok(())
    }
}

/// Waits until the remote helper on the jump host answers.
#[derive(Debug, Default)]
pub struct HelperStage;

#[async_trait]
impl Stage for HelperStage {
    fn id(&self) -> StageId {
        StageId::ProvisionHelper
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        ctx.push_status(
            Transition::begin().with_message("Waiting for the remote helper to start"),
        )?;

        let helper = ctx.run().helper(&ctx.shutdown_rx()).await?;
        let status = helper.self_status().await?;
        info!(?status, "remote helper is up");

        ctx.push_status(Transition::end().with_message("Remote helper is running"))?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BucketStage;

#[async_trait]
impl Stage for BucketStage {
    fn id(&self) -> StageId {
        StageId::ProvisionBucket
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(1))
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let cloud = &ctx.cloud();
        let name = run.config().options.names.bucket.as_str();

        ctx.push_status(Transition::begin().with_message("Preparing the object storage bucket"))?;

        let (persisted, compartment_id) = run.resources().read(|resources| {
            (
                resources.bucket_name.clone(),
                resources.compartment_id.clone(),
            )
        });
        let compartment_id = required(compartment_id, "compartment")?;
        let compartment = compartment_id.as_str();

        // Buckets are addressed by name, their creation completes synchronously.
        let ensured = ensure_resource(
            "bucket",
            Some(persisted),
            |name| async move { cloud.get_bucket(&name).await }.boxed(),
            || async move { cloud.get_bucket(name).await }.boxed(),
            || {
                async move {
                    let bucket = cloud.create_bucket(compartment, name).await?;
                    Ok(Created::ready(bucket))
                }
                .boxed()
            },
        )
        .await?;

        let bucket = ensured.resource().clone();
        let created = ensured.was_created();
        run.resources().update(|resources| {
            resources.bucket_name = bucket.name.clone();
            resources.bucket_namespace = bucket.namespace.clone();
            resources.bucket_created |= created;
        })?;

        ctx.push_status(
            Transition::end().with_message(format!("Bucket {} is ready", bucket.name)),
        )?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DbSystemStage;

impl DbSystemStage {
    fn record(ctx: &StageContext, db_system: &DbSystem) -> MigrateResult<()> {
        ctx.run().resources().update(|resources| {
            resources.db_system_id = db_system.id.clone();
            resources.db_system_ip = db_system.ip.clone();
            resources.db_system_version = db_system.version.clone();
        })
    }
}

#[async_trait]
impl Stage for DbSystemStage {
    fn id(&self) -> StageId {
        StageId::ProvisionDbSystem
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let cloud = &ctx.cloud();
        let options = &run.config().options;

        ctx.push_status(Transition::begin().with_message("Preparing the target DB System"))?;

        let (persisted, compartment_id, vcn_id) = run.resources().read(|resources| {
            (
                resources.db_system_id.clone(),
                resources.compartment_id.clone(),
                resources.vcn_id.clone(),
            )
        });
        let spec = DbSystemSpec {
            compartment_id: required(compartment_id, "compartment")?,
            vcn_id: required(vcn_id, "network")?,
            name: options.names.db_system.clone(),
            shape: options.target_shape.clone(),
            admin_user: options.target.user.clone(),
            admin_password: options.target.password.clone(),
        };
        let spec = &spec;

        let ensured = ensure_resource(
            "DB System",
            Some(persisted),
            |id| {
                async move {
                    let db_system = cloud.get_db_system(&id).await?;
                    Ok(db_system.filter(|db_system| !db_system.state.is_gone()))
                }
                .boxed()
            },
            || {
                async move {
                    let db_system = cloud
                        .find_db_system(&spec.compartment_id, &spec.name)
                        .await?;
                    Ok(db_system.filter(|db_system| !db_system.state.is_gone()))
                }
                .boxed()
            },
            || async move { cloud.create_db_system(spec).await }.boxed(),
        )
        .await?;

        let created = ensured.was_created();
        Self::record(&ctx, ensured.resource())?;
        run.resources()
            .update(|resources| resources.db_system_created |= created)?;
        settle(&ctx, &ensured, "DB System creation").await?;

        let db_system_id = ensured.resource().id.clone();
        let db_system = cloud.get_db_system(&db_system_id).await?.ok_or_else(|| {
            migrate_error!(
                ErrorKind::MissingResource,
                "DB System disappeared",
                format!("DB System {db_system_id} was not found after its creation")
            )
        })?;
        Self::record(&ctx, &db_system)?;

        ctx.push_status(
            Transition::end()
                .with_message(format!("DB System {} is ready", db_system.name))
                .with_info("version", db_system.version),
        )?;

        Ok(())
    }
}

/// Looks up the DB System recorded by [`DbSystemStage`].
async fn current_db_system(ctx: &StageContext) -> MigrateResult<DbSystem> {
    let id = ctx
        .run()
        .resources()
        .read(|resources| resources.db_system_id.clone());
    let id = required(id, "DB System")?;

    ctx.cloud().get_db_system(&id).await?.ok_or_else(|| {
        migrate_error!(
            ErrorKind::MissingResource,
            "DB System no longer exists",
            format!("DB System {id} was not found")
        )
    })
}

/// Opens the helper's connection to the target once both the DB System and the helper are up.
#[derive(Debug, Default)]
pub struct ConnectDbSystemStage;

#[async_trait]
impl Stage for ConnectDbSystemStage {
    fn id(&self) -> StageId {
        StageId::ConnectDbSystem
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();

        ctx.push_status(Transition::begin().with_message("Connecting to the target DB System"))?;

        let ip = run.resources().read(|resources| resources.db_system_ip.clone());
        let mut endpoint = run.config().options.target.clone();
        endpoint.host = required(ip, "DB System")?;

        let helper = run.helper(&ctx.shutdown_rx()).await?;
        helper.connect_mysql(DatabaseRole::Target, &endpoint).await?;

        ctx.push_status(
            Transition::end().with_message(format!(
                "Connected to {}:{}",
                endpoint.host, endpoint.port
            )),
        )?;

        Ok(())
    }
}

/// Turns crash recovery back on once the data is loaded.
#[derive(Debug, Default)]
pub struct CrashRecoveryStage;

#[async_trait]
impl Stage for CrashRecoveryStage {
    fn id(&self) -> StageId {
        StageId::EnableCrashRecovery
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(PROVISION_UPDATE_INTERVAL)
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        ctx.push_status(Transition::begin().with_message("Enabling crash recovery"))?;

        let db_system = current_db_system(&ctx).await?;
        if db_system.crash_recovery_enabled {
            info!(db_system = %db_system.id, "crash recovery is already enabled");
        } else if let Some(request) = ctx
            .cloud()
            .enable_crash_recovery(&db_system.id)
            .await?
        {
            wait_work_request(&ctx, &request, "Enabling crash recovery").await?;
        }

        ctx.push_status(Transition::end().with_message("Crash recovery is enabled"))?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct HighAvailabilityStage;

#[async_trait]
impl Stage for HighAvailabilityStage {
    fn id(&self) -> StageId {
        StageId::EnableHa
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn enabled(&self, options: &MigrationOptions) -> bool {
        options.enable_ha
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        ctx.push_status(Transition::begin().with_message("Enabling high availability"))?;

        let db_system = current_db_system(&ctx).await?;
        if !db_system.ha_enabled {
            if let Some(request) = ctx
                .cloud()
                .enable_high_availability(&db_system.id)
                .await?
            {
                wait_work_request(&ctx, &request, "Enabling high availability").await?;
            }
        }
        ctx.run()
            .resources()
            .update(|resources| resources.ha_enabled = true)?;

        ctx.push_status(Transition::end().with_message("High availability is enabled"))?;

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct HeatWaveStage;

#[async_trait]
impl Stage for HeatWaveStage {
    fn id(&self) -> StageId {
        StageId::ProvisionHeatWaveCluster
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn enabled(&self, options: &MigrationOptions) -> bool {
        options.enable_heatwave
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        ctx.push_status(Transition::begin().with_message("Adding a HeatWave cluster"))?;

        let db_system = current_db_system(&ctx).await?;
        if db_system.heat_wave_cluster {
            info!(db_system = %db_system.id, "HeatWave cluster already exists");
        } else {
            ctx.push_progress("Requesting the HeatWave cluster", &Progress::default())?;
            if let Some(request) = ctx
                .cloud()
                .add_heat_wave_cluster(&db_system.id)
                .await?
            {
                wait_work_request(&ctx, &request, "HeatWave cluster creation").await?;
            }
            ctx.run()
                .resources()
                .update(|resources| resources.heat_wave_cluster_created = true)?;
        }

        ctx.push_status(Transition::end().with_message("HeatWave cluster is ready"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::LifecycleState;
    use crate::test_utils::run::{TestRun, fast_config};
    use crate::types::WorkStatus;

    fn context(run: &TestRun, id: StageId) -> StageContext {
        StageContext::new(id, run.context(), run.shutdown_rx())
    }

    #[tokio::test]
    async fn compartment_is_created_once_and_reused_after_a_restart() {
        let run = TestRun::new(fast_config());

        CompartmentStage
            .run(context(&run, StageId::ProvisionCompartment))
            .await
            .unwrap();
        let first = run.context().resources().get();

        // A second attempt finds the persisted id and creates nothing.
        CompartmentStage
            .run(context(&run, StageId::ProvisionCompartment))
            .await
            .unwrap();

        assert_eq!(run.cloud.created("compartment"), 1);
        assert_eq!(run.context().resources().get().compartment_id, first.compartment_id);
        assert_eq!(
            run.context().status().stage_status(StageId::ProvisionCompartment),
            Some(WorkStatus::Finished)
        );
    }

    #[tokio::test]
    async fn resources_are_found_by_name_when_the_id_was_lost() {
        let run = TestRun::new(fast_config());
        CompartmentStage
            .run(context(&run, StageId::ProvisionCompartment))
            .await
            .unwrap();
        VcnStage.run(context(&run, StageId::ProvisionVcn)).await.unwrap();

        // Simulates a crash between the creation and the write of its id.
        run.context()
            .resources()
            .update(|resources| resources.vcn_id.clear())
            .unwrap();
        VcnStage.run(context(&run, StageId::ProvisionVcn)).await.unwrap();

        assert_eq!(run.cloud.created("vcn"), 1);
        assert!(!run.context().resources().get().vcn_id.is_empty());
    }

    #[tokio::test]
    async fn jump_host_records_its_addresses() {
        let run = TestRun::new(fast_config());
        CompartmentStage
            .run(context(&run, StageId::ProvisionCompartment))
            .await
            .unwrap();
        VcnStage.run(context(&run, StageId::ProvisionVcn)).await.unwrap();
        ComputeStage
            .run(context(&run, StageId::ProvisionCompute))
            .await
            .unwrap();

        let resources = run.context().resources().get();
        assert!(resources.compute_created);
        assert!(!resources.compute_public_ip.is_empty());
        assert!(!resources.compute_private_ip.is_empty());
    }

    #[tokio::test]
    async fn failed_db_system_is_replaced() {
        let run = TestRun::new(fast_config());
        CompartmentStage
            .run(context(&run, StageId::ProvisionCompartment))
            .await
            .unwrap();
        VcnStage.run(context(&run, StageId::ProvisionVcn)).await.unwrap();
        DbSystemStage
            .run(context(&run, StageId::ProvisionDbSystem))
            .await
            .unwrap();

        let first = run.context().resources().get().db_system_id;
        run.cloud.set_db_system_state(&first, LifecycleState::Failed);

        DbSystemStage
            .run(context(&run, StageId::ProvisionDbSystem))
            .await
            .unwrap();

        assert_eq!(run.cloud.created("db_system"), 2);
        assert_ne!(run.context().resources().get().db_system_id, first);
    }

    #[tokio::test]
    async fn stages_need_the_resources_of_their_dependencies() {
        let run = TestRun::new(fast_config());

        let err = VcnStage
            .run(context(&run, StageId::ProvisionVcn))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingResource);
    }
}
