//! The fixed stage graph of a migration.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MigrateResult;
use crate::orchestrator::provision::{
    BucketStage, CompartmentStage, ComputeStage, ConnectDbSystemStage, CrashRecoveryStage,
    DbSystemStage, HeatWaveStage, HelperStage, HighAvailabilityStage, VcnStage,
};
use crate::orchestrator::sync::{
    CongratsStage, CreateChannelStage, DirectNetworkStage, SshTunnelStage,
};
use crate::replication::MonitorChannelStage;
use crate::stage::{Stage, StageGraph, StageKind};
use crate::types::StageId;
use crate::workers::{DumpStage, LoadStage};

/// Root of the graph: finishes once the whole migration did.
#[derive(Debug, Default)]
struct MigrationDone;

#[async_trait]
impl Stage for MigrationDone {
    fn id(&self) -> StageId {
        StageId::Orchestration
    }

    fn kind(&self) -> StageKind {
        StageKind::Barrier
    }
}

/// Builds the graph of every stage a migration may run.
///
/// Stages that do not apply to a run stay in the graph and pass through once disabled by
/// [`StageGraph::prepare`], so the topology is the same for every combination of options.
pub fn build_graph(monitor: Arc<MonitorChannelStage>) -> MigrateResult<StageGraph> {
    let mut graph = StageGraph::new();

    let compartment = graph.add_stage(Arc::new(CompartmentStage), &[])?;
    let vcn = graph.add_stage(Arc::new(VcnStage), &[compartment])?;
    let bucket = graph.add_stage(Arc::new(BucketStage), &[compartment])?;
    let compute = graph.add_stage(Arc::new(ComputeStage), &[compartment, vcn])?;
    let helper = graph.add_stage(Arc::new(HelperStage), &[compute])?;
    let db_system = graph.add_stage(Arc::new(DbSystemStage), &[compartment, vcn])?;
    let connect = graph.add_stage(Arc::new(ConnectDbSystemStage), &[db_system, helper])?;

    let dump_stage = Arc::new(DumpStage::new());
    let load_stage = Arc::new(LoadStage::new(dump_stage.subscribe()));
    let dump = graph.add_stage(dump_stage, &[bucket])?;
    let load = graph.add_stage(load_stage, &[connect])?;

    let crash_recovery = graph.add_stage(Arc::new(CrashRecoveryStage), &[dump, load])?;
    let ha = graph.add_stage(Arc::new(HighAvailabilityStage), &[crash_recovery])?;
    let heat_wave = graph.add_stage(Arc::new(HeatWaveStage), &[ha])?;

    let direct = graph.add_stage(Arc::new(DirectNetworkStage), &[db_system])?;
    let tunnel = graph.add_stage(Arc::new(SshTunnelStage::new()), &[heat_wave])?;
    let channel = graph.add_stage(Arc::new(CreateChannelStage), &[tunnel, direct])?;

    let monitor = graph.add_stage(monitor, &[channel])?;
    let congrats = graph.add_stage(Arc::new(CongratsStage), &[channel])?;

    let root = graph.add_stage(Arc::new(MigrationDone), &[monitor, congrats])?;
    graph.set_root(root);

    Ok(graph)
}
