//! Stages that connect the target to the source and set up inbound replication.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use config::shared::MigrationOptions;
use futures::FutureExt;
use serde_json::json;
use tracing::{info, warn};

use crate::cloud::{
    ChannelSpec, CloudProvider, GtidOffHandling, ensure_resource, wait_work_request,
};
use crate::error::{ErrorKind, MigrateResult};
use crate::migrate_error;
use crate::persist::lock;
use crate::remote::DatabaseRole;
use crate::stage::{Stage, StageContext, StageKind};
use crate::status::Transition;
use crate::types::StageId;

/// Port the helper forwards to the source on its private address.
const TUNNEL_PORT: u16 = 3306;

/// Opens an SSH tunnel from the jump host to the source and waits until the source answers
/// through it.
///
/// The tunnel is started by the user's machine, so the stage can only keep testing it.
#[derive(Debug, Default)]
pub struct SshTunnelStage {
    attempts: Mutex<u32>,
}

impl SshTunnelStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for SshTunnelStage {
    fn id(&self) -> StageId {
        StageId::CreateSshTunnel
    }

    fn kind(&self) -> StageKind {
        StageKind::Polled
    }

    fn enabled(&self, options: &MigrationOptions) -> bool {
        options.is_hot() && options.cloud_connectivity.uses_ssh_tunnel()
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(2))
    }

    async fn on_start(&self, ctx: &StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let source = &run.config().options.source;

        let helper = run.helper(&ctx.shutdown_rx()).await?;
        helper.enable_tunneling(&source.host, source.port).await?;

        let (jump_host, private_ip) = run.resources().read(|resources| {
            (
                resources.compute_public_ip.clone(),
                resources.compute_private_ip.clone(),
            )
        });
        let command = format!(
            "ssh -N -R {private_ip}:{TUNNEL_PORT}:{}:{} opc@{jump_host}",
            source.host, source.port
        );

        ctx.push_status(
            Transition::begin()
                .with_message("Waiting for the SSH tunnel from the source to the jump host")
                .with_info("sshCommand", command)
                .with_info("jumpHost", jump_host),
        )?;

        Ok(())
    }

    async fn poll(&self, ctx: &StageContext) -> MigrateResult<bool> {
        let attempt = {
            let mut attempts = lock(&self.attempts);
            *attempts += 1;
            *attempts
        };

        let run = ctx.run();
        let helper = run.helper(&ctx.shutdown_rx()).await?;

        match helper.test_tunnel(&run.config().options.source).await {
            Ok(connected) => Ok(connected),
            Err(err) if err.is_aborted() => Err(err),
            Err(err) => {
                // Expected until the user opened the tunnel.
                warn!(attempt, error = %err, "source is not reachable through the tunnel yet");
                Ok(false)
            }
        }
    }

    async fn on_finish(&self, ctx: &StageContext) -> MigrateResult<()> {
        info!(attempts = *lock(&self.attempts), "ssh tunnel is up");
        ctx.push_status(Transition::end().with_message("SSH tunnel is ready and connectable"))
    }
}

/// Verifies that the jump host reaches the source over a site-to-site network.
#[derive(Debug, Default)]
pub struct DirectNetworkStage;

#[async_trait]
impl Stage for DirectNetworkStage {
    fn id(&self) -> StageId {
        StageId::CheckDirectNetwork
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn enabled(&self, options: &MigrationOptions) -> bool {
        options.is_hot() && !options.cloud_connectivity.uses_ssh_tunnel()
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let source = &run.config().options.source;

        ctx.push_status(Transition::begin().with_message(format!(
            "Checking network connectivity to {}:{}",
            source.host, source.port
        )))?;

        let helper = run.helper(&ctx.shutdown_rx()).await?;
        helper.connect_mysql(DatabaseRole::Source, source).await?;

        ctx.push_status(Transition::end().with_message("Source database is reachable"))?;

        Ok(())
    }
}

/// Creates the inbound replication channel of the target, starting at the coordinates of the
/// export.
#[derive(Debug, Default)]
pub struct CreateChannelStage;

impl CreateChannelStage {
    async fn spec(&self, ctx: &StageContext) -> MigrateResult<ChannelSpec> {
        let run = ctx.run();
        let options = &run.config().options;

        let (compartment_id, db_system_id, private_ip) = run.resources().read(|resources| {
            (
                resources.compartment_id.clone(),
                resources.db_system_id.clone(),
                resources.compute_private_ip.clone(),
            )
        });
        if db_system_id.is_empty() {
            return Err(migrate_error!(
                ErrorKind::MissingResource,
                "DB System is not known",
                "The DB System must be provisioned before the channel can be created"
            ));
        }

        // Through a tunnel the source is reached on the jump host.
        let (source_host, source_port) = if options.cloud_connectivity.uses_ssh_tunnel() {
            (private_ip, TUNNEL_PORT)
        } else {
            (options.source.host.clone(), options.source.port)
        };

        let source_info = run.source_info().await?;
        let gtid_off_handling = if source_info.gtid_mode_on {
            None
        } else {
            let coordinates = run.coordinates().get().ok_or_else(|| {
                migrate_error!(
                    ErrorKind::MissingResource,
                    "Replication coordinates are missing",
                    "The source runs without GTIDs and the export did not record its binlog position"
                )
            })?;

            Some(GtidOffHandling {
                binlog_file: coordinates.binlog_file,
                binlog_position: coordinates.binlog_position,
                uuid: source_info.server_uuid,
            })
        };

        Ok(ChannelSpec {
            compartment_id,
            db_system_id,
            name: options.names.channel.clone(),
            source_host,
            source_port,
            source_user: options.source.user.clone(),
            source_password: options.source.password.clone(),
            gtid_off_handling,
        })
    }
}

#[async_trait]
impl Stage for CreateChannelStage {
    fn id(&self) -> StageId {
        StageId::CreateChannel
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    fn enabled(&self, options: &MigrationOptions) -> bool {
        options.is_hot()
    }

    fn update_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let cloud = &ctx.cloud();

        ctx.push_status(Transition::begin().with_message("Creating the replication channel"))?;

        let spec = self.spec(&ctx).await?;
        let spec = &spec;
        let persisted = run.resources().read(|resources| resources.channel_id.clone());

        // A deleted or failed channel is replaced by a new one.
        let ensured = ensure_resource(
            "channel",
            Some(persisted),
            |id| {
                async move {
                    let channel = cloud.get_channel(&id).await?;
                    Ok(channel.filter(|channel| !channel.state.is_gone()))
                }
                .boxed()
            },
            || {
                async move {
                    let channel = cloud.find_channel(&spec.db_system_id, &spec.name).await?;
                    Ok(channel.filter(|channel| !channel.state.is_gone()))
                }
                .boxed()
            },
            || async move { cloud.create_channel(spec).await }.boxed(),
        )
        .await?;

        let channel_id = ensured.resource().id.clone();
        run.resources()
            .update(|resources| resources.channel_id = channel_id.clone())?;

        if let crate::cloud::Ensured::Created(created) = &ensured {
            if let Some(request) = &created.work_request {
                wait_work_request(&ctx, request, "Channel creation").await?;
            }
        }

        ctx.push_status(
            Transition::end()
                .with_message(format!("Replication channel {} is created", spec.name))
                .with_info("channelId", channel_id),
        )?;

        Ok(())
    }
}

/// Tells the user the target is ready.
#[derive(Debug, Default)]
pub struct CongratsStage;

#[async_trait]
impl Stage for CongratsStage {
    fn id(&self) -> StageId {
        StageId::Congrats
    }

    fn kind(&self) -> StageKind {
        StageKind::Worker
    }

    async fn run(&self, ctx: StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let message = if run.config().options.is_hot() {
            "The DB System is ready and replicating from the source. Complete the sync once \
             the applications were switched over."
        } else {
            "The DB System is ready. Applications can be switched over to it."
        };

        let (host, name) = run.resources().read(|resources| {
            (resources.db_system_ip.clone(), run.config().options.names.db_system.clone())
        });
        ctx.push_status(Transition::begin().with_message(message))?;
        ctx.push_message(&json!({ "dbSystemName": name, "dbSystemIP": host }));
        ctx.push_status(Transition::end())?;

        Ok(())
    }
}
