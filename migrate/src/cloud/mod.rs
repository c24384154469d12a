//! Narrow interface to the cloud provisioning backend.
//!
//! Calls either return a terminal result or the id of an asynchronous work request that is
//! polled with [`work_request::wait_work_request`]. Creation calls are only ever issued through
//! [`ensure_resource`], which looks for a resource left behind by an earlier attempt first.

use futures::future::BoxFuture;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MigrateResult;
use crate::resources::BucketPar;

pub mod retry;
pub mod work_request;

pub use retry::{RetryingCloud, retry_transient};
pub use work_request::wait_work_request;

/// Lifecycle state shared by the managed resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Creating,
    Active,
    Updating,
    Inactive,
    NeedsAttention,
    Deleting,
    Deleted,
    Failed,
}

impl LifecycleState {
    /// Returns `true` for resources that are gone or unusable.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            LifecycleState::Deleting | LifecycleState::Deleted | LifecycleState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkRequestStatus {
    Accepted,
    InProgress,
    Succeeded,
    Failed,
    Canceling,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequestError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub id: String,
    pub operation_type: String,
    pub status: WorkRequestStatus,
    pub percent_complete: f64,
    #[serde(default)]
    pub errors: Vec<WorkRequestError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compartment {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vcn {
    pub id: String,
    pub name: String,
    pub compartment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeInstance {
    pub id: String,
    pub name: String,
    pub public_ip: String,
    pub private_ip: String,
    pub state: LifecycleState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSystem {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub version: String,
    pub state: LifecycleState,
    pub crash_recovery_enabled: bool,
    pub ha_enabled: bool,
    pub heat_wave_cluster: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub db_system_id: String,
    pub state: LifecycleState,
    pub lifecycle_details: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ComputeSpec {
    pub compartment_id: String,
    pub vcn_id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct DbSystemSpec {
    pub compartment_id: String,
    pub vcn_id: String,
    pub name: String,
    pub shape: String,
    pub admin_user: String,
    pub admin_password: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub compartment_id: String,
    pub db_system_id: String,
    pub name: String,
    pub source_host: String,
    pub source_port: u16,
    pub source_user: String,
    pub source_password: Option<SecretString>,
    /// Set when the source runs without GTIDs: the channel then starts at a binary log position
    /// and tags replicated transactions with the source's server UUID.
    pub gtid_off_handling: Option<GtidOffHandling>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidOffHandling {
    pub binlog_file: String,
    pub binlog_position: u64,
    pub uuid: String,
}

/// A freshly created resource and the work request that completes its creation, if any.
#[derive(Debug, Clone)]
pub struct Created<T> {
    pub resource: T,
    pub work_request: Option<String>,
}

impl<T> Created<T> {
    pub fn ready(resource: T) -> Self {
        Self {
            resource,
            work_request: None,
        }
    }
}

/// The cloud provisioning backend.
///
/// `get_*` return `None` for unknown ids, `find_*` look resources up by their deterministic
/// name. Mutating calls return the id of the work request tracking them, when there is one.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    async fn get_compartment(&self, id: &str) -> MigrateResult<Option<Compartment>>;

    async fn find_compartment(&self, name: &str) -> MigrateResult<Option<Compartment>>;

    async fn create_compartment(&self, name: &str) -> MigrateResult<Created<Compartment>>;

    async fn get_vcn(&self, id: &str) -> MigrateResult<Option<Vcn>>;

    async fn find_vcn(&self, compartment_id: &str, name: &str) -> MigrateResult<Option<Vcn>>;

    async fn create_vcn(&self, compartment_id: &str, name: &str) -> MigrateResult<Created<Vcn>>;

    async fn get_instance(&self, id: &str) -> MigrateResult<Option<ComputeInstance>>;

    async fn find_instance(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> MigrateResult<Option<ComputeInstance>>;

    async fn launch_instance(&self, spec: &ComputeSpec) -> MigrateResult<Created<ComputeInstance>>;

    /// Terminates the instance `id`, returning `None` when it does not exist anymore.
    async fn terminate_instance(&self, id: &str) -> MigrateResult<Option<String>>;

    async fn get_bucket(&self, name: &str) -> MigrateResult<Option<Bucket>>;

    async fn create_bucket(&self, compartment_id: &str, name: &str) -> MigrateResult<Bucket>;

    /// Creates a pre-authenticated request granting read and write access below `prefix`.
    async fn create_bucket_par(&self, bucket: &str, prefix: &str) -> MigrateResult<BucketPar>;

    /// Deletes every object of `bucket` below `prefix`, returning how many were deleted.
    async fn delete_objects(&self, bucket: &str, prefix: &str) -> MigrateResult<usize>;

    /// Deletes the empty bucket `name`, returning `false` when it does not exist anymore.
    async fn delete_bucket(&self, name: &str) -> MigrateResult<bool>;

    async fn get_db_system(&self, id: &str) -> MigrateResult<Option<DbSystem>>;

    async fn find_db_system(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> MigrateResult<Option<DbSystem>>;

    async fn create_db_system(&self, spec: &DbSystemSpec) -> MigrateResult<Created<DbSystem>>;

    async fn enable_crash_recovery(&self, db_system_id: &str) -> MigrateResult<Option<String>>;

    async fn enable_high_availability(&self, db_system_id: &str) -> MigrateResult<Option<String>>;

    async fn add_heat_wave_cluster(&self, db_system_id: &str) -> MigrateResult<Option<String>>;

    async fn get_channel(&self, id: &str) -> MigrateResult<Option<Channel>>;

    async fn find_channel(&self, db_system_id: &str, name: &str)
    -> MigrateResult<Option<Channel>>;

    async fn create_channel(&self, spec: &ChannelSpec) -> MigrateResult<Created<Channel>>;

    async fn set_channel_enabled(
        &self,
        channel_id: &str,
        enabled: bool,
    ) -> MigrateResult<Option<String>>;

    async fn resume_channel(&self, channel_id: &str) -> MigrateResult<Option<String>>;

    async fn get_work_request(&self, id: &str) -> MigrateResult<WorkRequest>;
}

/// Outcome of [`ensure_resource`].
#[derive(Debug, Clone)]
pub enum Ensured<T> {
    /// The resource was left behind by an earlier attempt, or supplied by the user.
    Existing(T),
    Created(Created<T>),
}

impl<T> Ensured<T> {
    pub fn was_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }

    pub fn resource(&self) -> &T {
        match self {
            Ensured::Existing(resource) => resource,
            Ensured::Created(created) => &created.resource,
        }
    }
}

/// Resolves a resource without ever creating a duplicate.
///
/// The resource is looked up by `persisted_id` first, then by its deterministic name, and only
/// created when both lookups come back empty. The caller persists the id of a created resource
/// before waiting for its work request.
pub async fn ensure_resource<'a, T>(
    kind: &'static str,
    persisted_id: Option<String>,
    get: impl FnOnce(String) -> BoxFuture<'a, MigrateResult<Option<T>>>,
    find: impl FnOnce() -> BoxFuture<'a, MigrateResult<Option<T>>>,
    create: impl FnOnce() -> BoxFuture<'a, MigrateResult<Created<T>>>,
) -> MigrateResult<Ensured<T>> {
    if let Some(id) = persisted_id.filter(|id| !id.is_empty()) {
        match get(id.clone()).await? {
            Some(resource) => {
                info!(kind, %id, "reusing resource recorded by an earlier attempt");
                return Ok(Ensured::Existing(resource));
            }
            None => warn!(kind, %id, "recorded resource no longer exists"),
        }
    }

    if let Some(resource) = find().await? {
        info!(kind, "reusing existing resource found by name");
        return Ok(Ensured::Existing(resource));
    }

    info!(kind, "creating resource");
    Ok(Ensured::Created(create().await?))
}
