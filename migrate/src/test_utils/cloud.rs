use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cloud::{
    Bucket, Channel, ChannelSpec, CloudProvider, Compartment, ComputeInstance, ComputeSpec,
    Created, DbSystem, DbSystemSpec, LifecycleState, Vcn, WorkRequest, WorkRequestStatus,
};
use crate::error::{ErrorKind, MigrateResult};
use crate::migrate_error;
use crate::persist::lock;
use crate::resources::BucketPar;

const BUCKET_NAMESPACE: &str = "migration-tenancy";

/// Replays scripted work requests. The last state repeats once the script is exhausted.
struct ScriptedRequest {
    states: Vec<WorkRequest>,
    next: usize,
}

#[derive(Default)]
struct CloudState {
    sequence: usize,
    compartments: Vec<Compartment>,
    vcns: Vec<Vcn>,
    instances: Vec<(String, ComputeInstance)>,
    buckets: Vec<Bucket>,
    db_systems: Vec<(String, DbSystem)>,
    channels: Vec<Channel>,
    channel_specs: Vec<ChannelSpec>,
    work_requests: HashMap<String, ScriptedRequest>,
    created: HashMap<&'static str, usize>,
    pars: Vec<BucketPar>,
    deleted_prefixes: Vec<(String, String)>,
    calls: HashMap<&'static str, usize>,
    transient_failures: HashMap<String, usize>,
}

impl CloudState {
    /// Returns a fresh number for ids and addresses.
    fn next_sequence(&mut self) -> usize {
        self.sequence += 1;
        self.sequence
    }

    /// Counts a creation of `kind` and returns the id of the work request tracking it.
    fn created(&mut self, kind: &'static str) -> String {
        *self.created.entry(kind).or_default() += 1;
        format!("ocid1.workrequest.{}", self.next_sequence())
    }

    fn call(&mut self, name: &'static str) -> String {
        *self.calls.entry(name).or_default() += 1;
        format!("ocid1.workrequest.{}", self.next_sequence())
    }

    /// Counts a call of `name` without allocating a work request.
    fn record_call(&mut self, name: &'static str) {
        *self.calls.entry(name).or_default() += 1;
    }

    /// Fails with a transient error while failures scripted for `name` remain.
    fn transient_failure(&mut self, name: &str) -> MigrateResult<()> {
        if let Some(remaining) = self.transient_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(migrate_error!(
                    ErrorKind::CloudApiTransient,
                    "Cloud request was throttled",
                    format!("{name} returned 429 TooManyRequests")
                ));
            }
        }

        Ok(())
    }

    fn db_system_mut(&mut self, id: &str) -> MigrateResult<&mut DbSystem> {
        self.db_systems
            .iter_mut()
            .map(|(_, db_system)| db_system)
            .find(|db_system| db_system.id == id)
            .ok_or_else(|| not_found("DB System", id))
    }

    fn channel_mut(&mut self, id: &str) -> MigrateResult<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|channel| channel.id == id)
            .ok_or_else(|| not_found("Channel", id))
    }
}

fn not_found(kind: &str, id: &str) -> crate::error::MigrateError {
    migrate_error!(
        ErrorKind::CloudApiFailed,
        "Cloud resource not found",
        format!("{kind} {id} does not exist")
    )
}

/// Cloud provider keeping every resource in memory.
///
/// Resources are active as soon as they are created. Their work requests succeed on the first
/// poll unless scripted with [`FakeCloud::script_work_request`]. Lookups by name return the most
/// recent resource with that name, whatever its state.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the states reported for the work request `id`.
    pub fn script_work_request(&self, id: &str, states: Vec<WorkRequest>) {
        lock(&self.state)
            .work_requests
            .insert(id.to_owned(), ScriptedRequest { states, next: 0 });
    }

    /// Makes the next `times` calls of `operation` fail with a transient error.
    ///
    /// Supported for `get_work_request` and `get_channel`.
    pub fn fail_transiently(&self, operation: &str, times: usize) {
        lock(&self.state)
            .transient_failures
            .insert(operation.to_owned(), times);
    }

    /// Number of resources of `kind` created so far: `compartment`, `vcn`, `instance`, `bucket`,
    /// `db_system` or `channel`.
    pub fn created(&self, kind: &str) -> usize {
        lock(&self.state)
            .created
            .iter()
            .find(|(created, _)| **created == kind)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Number of calls of an operation other than a creation, e.g. `resume_channel`.
    ///
    /// Reads are only counted for `get_work_request` and `get_channel`.
    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .find(|(name, _)| **name == operation)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    pub fn set_db_system_state(&self, id: &str, state: LifecycleState) {
        if let Ok(db_system) = lock(&self.state).db_system_mut(id) {
            db_system.state = state;
        }
    }

    /// Adds a channel as if it was left behind by an earlier run.
    pub fn add_channel(&self, id: &str, state: LifecycleState) {
        lock(&self.state).channels.push(Channel {
            id: id.to_owned(),
            name: "migration-channel".to_owned(),
            db_system_id: String::new(),
            state,
            lifecycle_details: String::new(),
            enabled: true,
        });
    }

    pub fn set_channel_state(&self, id: &str, state: LifecycleState) {
        if let Ok(channel) = lock(&self.state).channel_mut(id) {
            channel.state = state;
        }
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        lock(&self.state)
            .channels
            .iter()
            .find(|channel| channel.id == id)
            .cloned()
    }

    pub fn last_channel_spec(&self) -> Option<ChannelSpec> {
        lock(&self.state).channel_specs.last().cloned()
    }

    pub fn pars_created(&self) -> usize {
        lock(&self.state).pars.len()
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        lock(&self.state)
            .buckets
            .iter()
            .any(|bucket| bucket.name == name)
    }

    pub fn has_instance(&self, id: &str) -> bool {
        lock(&self.state)
            .instances
            .iter()
            .any(|(_, instance)| instance.id == id)
    }

    /// `(bucket, prefix)` of every deletion of objects.
    pub fn deleted_prefixes(&self) -> Vec<(String, String)> {
        lock(&self.state).deleted_prefixes.clone()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn get_compartment(&self, id: &str) -> MigrateResult<Option<Compartment>> {
        let state = lock(&self.state);
        Ok(state.compartments.iter().find(|c| c.id == id).cloned())
    }

    async fn find_compartment(&self, name: &str) -> MigrateResult<Option<Compartment>> {
        let state = lock(&self.state);
        Ok(state.compartments.iter().rev().find(|c| c.name == name).cloned())
    }

    async fn create_compartment(&self, name: &str) -> MigrateResult<Created<Compartment>> {
        let mut state = lock(&self.state);
        let work_request = state.created("compartment");
        let compartment = Compartment {
            id: format!("ocid1.compartment.{}", state.next_sequence()),
            name: name.to_owned(),
        };
        state.compartments.push(compartment.clone());

        Ok(Created {
            resource: compartment,
            work_request: Some(work_request),
        })
    }

    async fn get_vcn(&self, id: &str) -> MigrateResult<Option<Vcn>> {
        let state = lock(&self.state);
        Ok(state.vcns.iter().find(|vcn| vcn.id == id).cloned())
    }

    async fn find_vcn(&self, compartment_id: &str, name: &str) -> MigrateResult<Option<Vcn>> {
        let state = lock(&self.state);
        Ok(state
            .vcns
            .iter()
            .rev()
            .find(|vcn| vcn.compartment_id == compartment_id && vcn.name == name)
            .cloned())
    }

    async fn create_vcn(&self, compartment_id: &str, name: &str) -> MigrateResult<Created<Vcn>> {
        let mut state = lock(&self.state);
        let work_request = state.created("vcn");
        let vcn = Vcn {
            id: format!("ocid1.vcn.{}", state.next_sequence()),
            name: name.to_owned(),
            compartment_id: compartment_id.to_owned(),
        };
        state.vcns.push(vcn.clone());

        Ok(Created {
            resource: vcn,
            work_request: Some(work_request),
        })
    }

    async fn get_instance(&self, id: &str) -> MigrateResult<Option<ComputeInstance>> {
        let state = lock(&self.state);
        Ok(state
            .instances
            .iter()
            .map(|(_, instance)| instance)
            .find(|instance| instance.id == id)
            .cloned())
    }

    async fn find_instance(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> MigrateResult<Option<ComputeInstance>> {
        let state = lock(&self.state);
        Ok(state
            .instances
            .iter()
            .rev()
            .find(|(compartment, instance)| compartment == compartment_id && instance.name == name)
            .map(|(_, instance)| instance.clone()))
    }

    async fn launch_instance(&self, spec: &ComputeSpec) -> MigrateResult<Created<ComputeInstance>> {
        let mut state = lock(&self.state);
        let work_request = state.created("instance");
        let sequence = state.next_sequence();
        let instance = ComputeInstance {
            id: format!("ocid1.instance.{sequence}"),
            name: spec.name.clone(),
            public_ip: format!("203.0.113.{}", sequence % 250 + 1),
            private_ip: format!("10.0.0.{}", sequence % 250 + 1),
            state: LifecycleState::Active,
        };
        state
            .instances
            .push((spec.compartment_id.clone(), instance.clone()));

        Ok(Created {
            resource: instance,
            work_request: Some(work_request),
        })
    }

    async fn terminate_instance(&self, id: &str) -> MigrateResult<Option<String>> {
        let mut state = lock(&self.state);
        let before = state.instances.len();
        state.instances.retain(|(_, instance)| instance.id != id);
        if state.instances.len() == before {
            state.record_call("terminate_instance");
            return Ok(None);
        }

        Ok(Some(state.call("terminate_instance")))
    }

    async fn get_bucket(&self, name: &str) -> MigrateResult<Option<Bucket>> {
        let state = lock(&self.state);
        Ok(state.buckets.iter().find(|bucket| bucket.name == name).cloned())
    }

    async fn create_bucket(&self, _compartment_id: &str, name: &str) -> MigrateResult<Bucket> {
        let mut state = lock(&self.state);
        state.created("bucket");
        let bucket = Bucket {
            namespace: BUCKET_NAMESPACE.to_owned(),
            name: name.to_owned(),
        };
        state.buckets.push(bucket.clone());

        Ok(bucket)
    }

    async fn create_bucket_par(&self, bucket: &str, prefix: &str) -> MigrateResult<BucketPar> {
        let mut state = lock(&self.state);
        let sequence = state.next_sequence();
        let par = BucketPar {
            id: format!("par-{sequence}"),
            uri: format!(
                "https://objectstorage.example.com/p/token-{sequence}/n/{BUCKET_NAMESPACE}/b/{bucket}/o/{prefix}"
            ),
        };
        state.pars.push(par.clone());

        Ok(par)
    }

    async fn delete_objects(&self, bucket: &str, prefix: &str) -> MigrateResult<usize> {
        lock(&self.state)
            .deleted_prefixes
            .push((bucket.to_owned(), prefix.to_owned()));

        Ok(0)
    }

    async fn delete_bucket(&self, name: &str) -> MigrateResult<bool> {
        let mut state = lock(&self.state);
        state.record_call("delete_bucket");
        let before = state.buckets.len();
        state.buckets.retain(|bucket| bucket.name != name);

        Ok(state.buckets.len() < before)
    }

    async fn get_db_system(&self, id: &str) -> MigrateResult<Option<DbSystem>> {
        let state = lock(&self.state);
        Ok(state
            .db_systems
            .iter()
            .map(|(_, db_system)| db_system)
            .find(|db_system| db_system.id == id)
            .cloned())
    }

    async fn find_db_system(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> MigrateResult<Option<DbSystem>> {
        let state = lock(&self.state);
        Ok(state
            .db_systems
            .iter()
            .rev()
            .find(|(compartment, db_system)| {
                compartment == compartment_id && db_system.name == name
            })
            .map(|(_, db_system)| db_system.clone()))
    }

    async fn create_db_system(&self, spec: &DbSystemSpec) -> MigrateResult<Created<DbSystem>> {
        let mut state = lock(&self.state);
        let work_request = state.created("db_system");
        let sequence = state.next_sequence();
        let db_system = DbSystem {
            id: format!("ocid1.mysqldbsystem.{sequence}"),
            name: spec.name.clone(),
            ip: format!("10.0.1.{}", sequence % 250 + 1),
            version: "8.4.3".to_owned(),
            state: LifecycleState::Active,
            crash_recovery_enabled: false,
            ha_enabled: false,
            heat_wave_cluster: false,
        };
        state
            .db_systems
            .push((spec.compartment_id.clone(), db_system.clone()));

        Ok(Created {
            resource: db_system,
            work_request: Some(work_request),
        })
    }

    async fn enable_crash_recovery(&self, db_system_id: &str) -> MigrateResult<Option<String>> {
        let mut state = lock(&self.state);
        state.db_system_mut(db_system_id)?.crash_recovery_enabled = true;

        Ok(Some(state.call("enable_crash_recovery")))
    }

    async fn enable_high_availability(&self, db_system_id: &str) -> MigrateResult<Option<String>> {
        let mut state = lock(&self.state);
        state.db_system_mut(db_system_id)?.ha_enabled = true;

        Ok(Some(state.call("enable_high_availability")))
    }

    async fn add_heat_wave_cluster(&self, db_system_id: &str) -> MigrateResult<Option<String>> {
        let mut state = lock(&self.state);
        state.db_system_mut(db_system_id)?.heat_wave_cluster = true;

        Ok(Some(state.call("add_heat_wave_cluster")))
    }

    async fn get_channel(&self, id: &str) -> MigrateResult<Option<Channel>> {
        let mut state = lock(&self.state);
        state.record_call("get_channel");
        state.transient_failure("get_channel")?;

        Ok(state.channels.iter().find(|channel| channel.id == id).cloned())
    }

    async fn find_channel(
        &self,
        db_system_id: &str,
        name: &str,
    ) -> MigrateResult<Option<Channel>> {
        let state = lock(&self.state);
        Ok(state
            .channels
            .iter()
            .rev()
            .find(|channel| channel.db_system_id == db_system_id && channel.name == name)
            .cloned())
    }

    async fn create_channel(&self, spec: &ChannelSpec) -> MigrateResult<Created<Channel>> {
        let mut state = lock(&self.state);
        let work_request = state.created("channel");
        let channel = Channel {
            id: format!("ocid1.channel.{}", state.next_sequence()),
            name: spec.name.clone(),
            db_system_id: spec.db_system_id.clone(),
            state: LifecycleState::Active,
            lifecycle_details: String::new(),
            enabled: true,
        };
        state.channels.push(channel.clone());
        state.channel_specs.push(spec.clone());

        Ok(Created {
            resource: channel,
            work_request: Some(work_request),
        })
    }

    async fn set_channel_enabled(
        &self,
        channel_id: &str,
        enabled: bool,
    ) -> MigrateResult<Option<String>> {
        let mut state = lock(&self.state);
        state.channel_mut(channel_id)?.enabled = enabled;

        Ok(Some(state.call("set_channel_enabled")))
    }

    async fn resume_channel(&self, channel_id: &str) -> MigrateResult<Option<String>> {
        let mut state = lock(&self.state);
        let channel = state.channel_mut(channel_id)?;
        channel.state = LifecycleState::Active;
        channel.lifecycle_details.clear();

        Ok(Some(state.call("resume_channel")))
    }

    async fn get_work_request(&self, id: &str) -> MigrateResult<WorkRequest> {
        let mut state = lock(&self.state);
        state.record_call("get_work_request");
        state.transient_failure("get_work_request")?;

        if let Some(script) = state.work_requests.get_mut(id) {
            let request = script
                .states
                .get(script.next)
                .or_else(|| script.states.last())
                .cloned();
            script.next = (script.next + 1).min(script.states.len());
            if let Some(request) = request {
                return Ok(request);
            }
        }

        Ok(WorkRequest {
            id: id.to_owned(),
            operation_type: "UNSCRIPTED".to_owned(),
            status: WorkRequestStatus::Succeeded,
            percent_complete: 100.0,
            errors: Vec::new(),
        })
    }
}
