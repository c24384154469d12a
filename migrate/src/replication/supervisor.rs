use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use config::shared::MigrationOptions;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cloud::{
    Channel, CloudProvider, LifecycleState, retry_transient, wait_work_request,
};
use crate::error::{ErrorKind, MigrateResult};
use crate::failpoints::{SUPERVISOR__BEFORE_CYCLE, migrate_fail_point};
use crate::migrate_error;
use crate::persist::lock;
use crate::remote::HelperClient;
use crate::replication::observation::{Backlog, ChannelObservation, ChannelStatus};
use crate::source::ServerInfo;
use crate::stage::{Stage, StageContext, StageKind};
use crate::status::{Progress, Transition};
use crate::types::{ReplicationStatus, StageId};

/// Supervises the inbound replication channel of the target until the user completes the sync.
///
/// Every cycle reads the channel from the cloud and its receiver and applier status from the
/// target. A channel stopped by applier errors is resumed automatically once every transaction
/// that broke it has been executed on the target, typically after the user asked to skip them
/// with [`MonitorChannelStage::skip_gtids`]. Anything else is reported and left for a human.
#[derive(Debug)]
pub struct MonitorChannelStage {
    skip_queue: Mutex<Vec<String>>,
    sync_complete: watch::Sender<bool>,
    last_report: Mutex<Option<ChannelStatus>>,
}

impl MonitorChannelStage {
    pub fn new() -> Self {
        let (sync_complete, _) = watch::channel(false);

        Self {
            skip_queue: Mutex::new(Vec::new()),
            sync_complete,
            last_report: Mutex::new(None),
        }
    }

    /// Queues `gtids` to be skipped on the target on the next cycle.
    pub fn skip_gtids(&self, gtids: impl Into<String>) {
        let gtids = gtids.into();
        info!(%gtids, "queued transactions to skip");
        lock(&self.skip_queue).push(gtids);
    }

    /// Ends supervision at the end of the current cycle, or right away when it is sleeping.
    pub fn complete_sync(&self) {
        info!("replication sync completed by the user");
        self.sync_complete.send_replace(true);
    }

    /// Returns the last status reported for the channel.
    pub fn last_report(&self) -> Option<ChannelStatus> {
        lock(&self.last_report).clone()
    }

    async fn supervise(&self, ctx: &StageContext) -> MigrateResult<()> {
        let run = ctx.run();
        let monitor = &run.config().monitor;

        let channel_id = run.resources().read(|resources| resources.channel_id.clone());
        if channel_id.is_empty() {
            return Err(migrate_error!(
                ErrorKind::MissingResource,
                "Replication channel is not known",
                "The channel must be created before it can be monitored"
            ));
        }

        let helper = run.helper(&ctx.shutdown_rx()).await?;
        let source_info = run.source_info().await?;

        let mut sync_complete = self.sync_complete.subscribe();
        let mut previous: Option<ChannelObservation> = None;

        loop {
            if *sync_complete.borrow_and_update() {
                break;
            }
            ctx.check_stop()?;
            migrate_fail_point(SUPERVISOR__BEFORE_CYCLE)?;

            let channel = self.channel(ctx, &channel_id).await?;
            // The control plane notices replication problems later than the server itself.
            debug!(
                channel = %channel.id,
                state = ?channel.state,
                details = %channel.lifecycle_details,
                "channel lifecycle"
            );

            self.drain_skip_queue(&helper).await?;

            let raw = retry_transient(
                &run.config().cloud_retry,
                &ctx.shutdown_rx(),
                "channel_status",
                || helper.channel_status(&channel.name),
            )
            .await?;
            let observation = ChannelObservation::analyze(&raw)?;

            let changed = previous
                .as_ref()
                .is_none_or(|previous| !previous.same_state(&observation));
            if changed {
                info!(
                    gtid_executed = %observation.gtid_executed,
                    receiver_error = ?observation.receiver_error,
                    applier_errors = observation.applier_errors.len(),
                    "channel status changed"
                );
                previous = Some(observation.clone());
            }

            if channel.state == LifecycleState::NeedsAttention && observation.is_resolved() {
                info!(
                    gtid_executed = %observation.gtid_executed,
                    transactions = %observation.broken_transactions().join(","),
                    "every transaction that broke the applier was applied, resuming the channel"
                );
                self.resume(ctx, &channel_id).await?;
                continue;
            }

            if changed {
                self.report(ctx, &source_info, &observation).await?;
            }

            let delay = if channel.state == LifecycleState::Active {
                monitor.update_interval()
            } else {
                monitor.error_update_interval()
            };
            self.pause(ctx, &mut sync_complete, delay).await;
        }

        info!("replication monitoring finished");

        Ok(())
    }

    async fn channel(&self, ctx: &StageContext, channel_id: &str) -> MigrateResult<Channel> {
        ctx.cloud()
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| {
                migrate_error!(
                    ErrorKind::MissingResource,
                    "Replication channel no longer exists",
                    format!("Channel {channel_id} was not found")
                )
            })
    }

    async fn drain_skip_queue(&self, helper: &HelperClient) -> MigrateResult<()> {
        let gtids = std::mem::take(&mut *lock(&self.skip_queue));
        if gtids.is_empty() {
            return Ok(());
        }

        info!(gtids = %gtids.join(","), "skipping transactions on the target");
        helper.skip_gtids(&gtids).await
    }

    /// Restarts the channel: an `ACTIVE` channel with broken replication is disabled and enabled
    /// again, a channel that needs attention is resumed.
    async fn resume(&self, ctx: &StageContext, channel_id: &str) -> MigrateResult<()> {
        let cloud = ctx.cloud();
        let channel = self.channel(ctx, channel_id).await?;

        match channel.state {
            LifecycleState::Active => {
                info!(channel = channel_id, "disabling channel");
                if let Some(request) = cloud.set_channel_enabled(channel_id, false).await? {
                    wait_work_request(ctx, &request, "Channel update").await?;
                }

                info!(channel = channel_id, "re-enabling channel");
                if let Some(request) = cloud.set_channel_enabled(channel_id, true).await? {
                    wait_work_request(ctx, &request, "Channel update").await?;
                }
            }
            LifecycleState::NeedsAttention => {
                info!(channel = channel_id, "resuming channel");
                if let Some(request) = cloud.resume_channel(channel_id).await? {
                    wait_work_request(ctx, &request, "Channel resume").await?;
                }
            }
            state => warn!(channel = channel_id, ?state, "channel cannot be resumed in its state"),
        }

        Ok(())
    }

    async fn report(
        &self,
        ctx: &StageContext,
        source_info: &ServerInfo,
        observation: &ChannelObservation,
    ) -> MigrateResult<()> {
        let backlog = if source_info.gtid_mode_on {
            let state = ctx.run().source().gtid_state().await?;
            Some(Backlog::compute(&state, &observation.gtid_executed)?)
        } else {
            None
        };

        let report = ChannelStatus::report(observation, backlog.as_ref());
        if report.status == ReplicationStatus::Error {
            error!(errors = ?report.errors, "replication can no longer catch up");
        }

        ctx.push_progress(&report.details, &Progress::default().with_info(&report))?;
        ctx.push_message(&serde_json::to_value(&report)?);
        *lock(&self.last_report) = Some(report);

        Ok(())
    }

    /// Sleeps until the next cycle. Cancellation and sync completion cut the sleep short and are
    /// acted upon at the top of the loop.
    async fn pause(
        &self,
        ctx: &StageContext,
        sync_complete: &mut watch::Receiver<bool>,
        delay: Duration,
    ) {
        let mut shutdown = ctx.shutdown_rx();

        tokio::select! {
            _ = shutdown.wait_for_shutdown() => {}
            _ = sync_complete.changed() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

impl Default for MonitorChannelStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stage for MonitorChannelStage {
    fn id(&self) -> StageId {
        StageId::MonitorChannel
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
        ctx.push_status(Transition::begin().with_message("Monitoring the replication channel"))?;
        self.supervise(&ctx).await?;
        ctx.push_status(Transition::end().with_message("Replication sync completed"))?;

        Ok(())
    }
}
