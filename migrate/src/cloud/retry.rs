use std::future::Future;
use std::sync::Arc;

use config::shared::CloudRetryConfig;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::warn;

use crate::cloud::{
    Bucket, Channel, ChannelSpec, CloudProvider, Compartment, ComputeInstance, ComputeSpec,
    Created, DbSystem, DbSystemSpec, Vcn, WorkRequest,
};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::MigrateResult;
use crate::failpoints::{CLOUD__BEFORE_CALL, migrate_fail_point};
use crate::resources::BucketPar;
use crate::workers::DecorrelatedJitter;

/// Runs `attempt` until it succeeds, fails with a non transient error or the budget of
/// `config` is spent.
///
/// Waits between attempts follow [`DecorrelatedJitter`] and end early with an
/// [`ErrorKind::Aborted`](crate::error::ErrorKind::Aborted) error when `shutdown` fires. The
/// last error is returned once `max_attempts` attempts failed or the next wait would end past
/// `max_total` since the first attempt.
pub async fn retry_transient<T, F, Fut>(
    config: &CloudRetryConfig,
    shutdown: &ShutdownRx,
    operation: &str,
    mut attempt: F,
) -> MigrateResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrateResult<T>>,
{
    let mut backoff = DecorrelatedJitter::new(
        config.base_delay(),
        config.max_delay(),
        config.growth_factor,
    );
    let mut shutdown = shutdown.clone();
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        shutdown.check()?;
        attempts += 1;

        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.kind().is_transient() {
            return Err(err);
        }

        if attempts >= config.max_attempts.max(1) {
            warn!(operation, attempts, error = %err, "giving up after transient errors");
            return Err(err);
        }

        let delay = backoff.next_delay();
        if started.elapsed() + delay > config.max_total() {
            warn!(
                operation,
                attempts,
                error = %err,
                "giving up after transient errors, retry time is exhausted"
            );
            return Err(err);
        }

        warn!(
            operation,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient error, retrying"
        );
        shutdown.sleep_or_abort(delay).await?;
    }
}

/// A [`CloudProvider`] retrying every call of the wrapped one on transient errors.
///
/// Stages reach the cloud through this wrapper, see
/// [`StageContext::cloud`](crate::stage::StageContext::cloud).
#[derive(Clone)]
pub struct RetryingCloud {
    inner: Arc<dyn CloudProvider>,
    config: CloudRetryConfig,
    shutdown: ShutdownRx,
}

impl RetryingCloud {
    pub fn new(
        inner: Arc<dyn CloudProvider>,
        config: CloudRetryConfig,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            inner,
            config,
            shutdown,
        }
    }

    async fn call<'a, T, F>(&'a self, operation: &'static str, mut call: F) -> MigrateResult<T>
    where
        F: FnMut() -> BoxFuture<'a, MigrateResult<T>> + Send,
        T: Send,
    {
        retry_transient(&self.config, &self.shutdown, operation, || {
            let attempt = migrate_fail_point(CLOUD__BEFORE_CALL).map(|()| call());
            async move { attempt?.await }
        })
        .await
    }
}

#[async_trait::async_trait]
impl CloudProvider for RetryingCloud {
    async fn get_compartment(&self, id: &str) -> MigrateResult<Option<Compartment>> {
        self.call("get_compartment", move || self.inner.get_compartment(id))
            .await
    }

    async fn find_compartment(&self, name: &str) -> MigrateResult<Option<Compartment>> {
        self.call("find_compartment", move || self.inner.find_compartment(name))
            .await
    }

    async fn create_compartment(&self, name: &str) -> MigrateResult<Created<Compartment>> {
        self.call("create_compartment", move || {
            self.inner.create_compartment(name)
        })
        .await
    }

    async fn get_vcn(&self, id: &str) -> MigrateResult<Option<Vcn>> {
        self.call("get_vcn", move || self.inner.get_vcn(id)).await
    }

    async fn find_vcn(&self, compartment_id: &str, name: &str) -> MigrateResult<Option<Vcn>> {
        self.call("find_vcn", move || self.inner.find_vcn(compartment_id, name))
            .await
    }

    async fn create_vcn(&self, compartment_id: &str, name: &str) -> MigrateResult<Created<Vcn>> {
        self.call("create_vcn", move || {
            self.inner.create_vcn(compartment_id, name)
        })
        .await
    }

    async fn get_instance(&self, id: &str) -> MigrateResult<Option<ComputeInstance>> {
        self.call("get_instance", move || self.inner.get_instance(id))
            .await
    }

    async fn find_instance(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> MigrateResult<Option<ComputeInstance>> {
        self.call("find_instance", move || {
            self.inner.find_instance(compartment_id, name)
        })
        .await
    }

    async fn launch_instance(&self, spec: &ComputeSpec) -> MigrateResult<Created<ComputeInstance>> {
        self.call("launch_instance", move || self.inner.launch_instance(spec))
            .await
    }

    async fn terminate_instance(&self, id: &str) -> MigrateResult<Option<String>> {
        self.call("terminate_instance", move || {
            self.inner.terminate_instance(id)
        })
        .await
    }

    async fn get_bucket(&self, name: &str) -> MigrateResult<Option<Bucket>> {
        self.call("get_bucket", move || self.inner.get_bucket(name)).await
    }

    async fn create_bucket(&self, compartment_id: &str, name: &str) -> MigrateResult<Bucket> {
        self.call("create_bucket", move || {
            self.inner.create_bucket(compartment_id, name)
        })
        .await
    }

    async fn create_bucket_par(&self, bucket: &str, prefix: &str) -> MigrateResult<BucketPar> {
        self.call("create_bucket_par", move || {
            self.inner.create_bucket_par(bucket, prefix)
        })
        .await
    }

    async fn delete_objects(&self, bucket: &str, prefix: &str) -> MigrateResult<usize> {
        self.call("delete_objects", move || {
            self.inner.delete_objects(bucket, prefix)
        })
        .await
    }

    async fn delete_bucket(&self, name: &str) -> MigrateResult<bool> {
        self.call("delete_bucket", move || self.inner.delete_bucket(name))
            .await
    }

    async fn get_db_system(&self, id: &str) -> MigrateResult<Option<DbSystem>> {
        self.call("get_db_system", move || self.inner.get_db_system(id))
            .await
    }

    async fn find_db_system(
        &self,
        compartment_id: &str,
        name: &str,
    ) -> MigrateResult<Option<DbSystem>> {
        self.call("find_db_system", move || {
            self.inner.find_db_system(compartment_id, name)
        })
        .await
    }

    async fn create_db_system(&self, spec: &DbSystemSpec) -> MigrateResult<Created<DbSystem>> {
        self.call("create_db_system", move || self.inner.create_db_system(spec))
            .await
    }

    async fn enable_crash_recovery(&self, db_system_id: &str) -> MigrateResult<Option<String>> {
        self.call("enable_crash_recovery", move || {
            self.inner.enable_crash_recovery(db_system_id)
        })
        .await
    }

    async fn enable_high_availability(&self, db_system_id: &str) -> MigrateResult<Option<String>> {
        self.call("enable_high_availability", move || {
            self.inner.enable_high_availability(db_system_id)
        })
        .await
    }

    async fn add_heat_wave_cluster(&self, db_system_id: &str) -> MigrateResult<Option<String>> {
        self.call("add_heat_wave_cluster", move || {
            self.inner.add_heat_wave_cluster(db_system_id)
        })
        .await
    }

    async fn get_channel(&self, id: &str) -> MigrateResult<Option<Channel>> {
        self.call("get_channel", move || self.inner.get_channel(id)).await
    }

    async fn find_channel(
        &self,
        db_system_id: &str,
        name: &str,
    ) -> MigrateResult<Option<Channel>> {
        self.call("find_channel", move || {
            self.inner.find_channel(db_system_id, name)
        })
        .await
    }

    async fn create_channel(&self, spec: &ChannelSpec) -> MigrateResult<Created<Channel>> {
        self.call("create_channel", move || self.inner.create_channel(spec))
            .await
    }

    async fn set_channel_enabled(
        &self,
        channel_id: &str,
        enabled: bool,
    ) -> MigrateResult<Option<String>> {
        self.call("set_channel_enabled", move || {
            self.inner.set_channel_enabled(channel_id, enabled)
        })
        .await
    }

    async fn resume_channel(&self, channel_id: &str) -> MigrateResult<Option<String>> {
        self.call("resume_channel", move || self.inner.resume_channel(channel_id))
            .await
    }

    async fn get_work_request(&self, id: &str) -> MigrateResult<WorkRequest> {
        self.call("get_work_request", move || self.inner.get_work_request(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::bail;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::error::ErrorKind;
    use crate::test_utils::cloud::FakeCloud;

    fn fast_retry(max_attempts: u32) -> CloudRetryConfig {
        CloudRetryConfig {
            max_attempts,
            base_delay_ms: 1,
            growth_factor: 2.0,
            max_delay_ms: 2,
            max_total_ms: 10_000,
        }
    }

    async fn failing(calls: &AtomicU32, failures: u32, kind: ErrorKind) -> MigrateResult<u32> {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            bail!(kind, "Request failed", "503 Service Unavailable");
        }

        Ok(call)
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);

        let result = retry_transient(&fast_retry(5), &rx, "get_channel", || {
            failing(&calls, 3, ErrorKind::CloudApiTransient)
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn transient_errors_give_up_after_max_attempts() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);

        let err = retry_transient(&fast_retry(3), &rx, "get_channel", || {
            failing(&calls, u32::MAX, ErrorKind::RemoteHelperTransient)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteHelperTransient);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_once_the_total_time_is_spent() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);
        let mut config = fast_retry(100);
        config.base_delay_ms = 50;
        config.max_delay_ms = 50;
        config.max_total_ms = 120;

        let err = retry_transient(&config, &rx, "get_work_request", || {
            failing(&calls, u32::MAX, ErrorKind::CloudApiTransient)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CloudApiTransient);
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn other_errors_are_returned_at_once() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);

        let err = retry_transient(&fast_retry(5), &rx, "create_bucket", || {
            failing(&calls, u32::MAX, ErrorKind::CloudApiFailed)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CloudApiFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_wait_between_attempts() {
        let (tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);
        let mut config = fast_retry(5);
        config.base_delay_ms = 60_000;
        config.max_delay_ms = 60_000;
        config.max_total_ms = 600_000;

        let retry = retry_transient(&config, &rx, "get_channel", || {
            failing(&calls, u32::MAX, ErrorKind::CloudApiTransient)
        });
        let cancel = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tx.shutdown();
        };
        let (result, ()) = tokio::join!(retry, cancel);

        assert!(result.unwrap_err().is_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrapper_retries_calls_of_the_inner_provider() {
        let (_tx, rx) = create_shutdown_channel();
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_transiently("get_work_request", 2);
        let retrying = RetryingCloud::new(cloud.clone(), fast_retry(5), rx);

        let request = retrying.get_work_request("ocid1.workrequest.1").await.unwrap();

        assert_eq!(request.id, "ocid1.workrequest.1");
        assert_eq!(cloud.calls("get_work_request"), 3);
    }
}
