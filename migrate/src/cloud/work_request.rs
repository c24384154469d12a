use tokio::time::Instant;
use tracing::{debug, error};

use crate::cloud::{CloudProvider, WorkRequestStatus};
use crate::error::{ErrorKind, MigrateError, MigrateResult};
use crate::stage::StageContext;
use crate::status::Progress;
use crate::{bail, migrate_error};

/// Polls the work request `id` until it succeeds, reporting its progress on the stage of `ctx`.
///
/// `context` names the operation in progress messages, e.g. "DB System creation". Fails with
/// [`ErrorKind::WorkRequestFailed`] carrying every error reported by the backend, with
/// [`ErrorKind::WorkRequestCanceled`] when it was canceled externally and with
/// [`ErrorKind::StageTimeout`] when the configured timeout elapses.
pub async fn wait_work_request(ctx: &StageContext, id: &str, context: &str) -> MigrateResult<()> {
    let cloud = ctx.cloud();
    let config = &ctx.run().config().work_request;
    let started = Instant::now();

    let mut last_status = None;
    let mut last_percent: Option<f64> = None;

    debug!(stage = %ctx.id(), work_request = id, context, "waiting for work request");
    ctx.push_progress(
        &format!("Monitoring work request for {context}"),
        &Progress::default(),
    )?;

    loop {
        ctx.check_stop()?;

        let request = cloud.get_work_request(id).await?;
        match request.status {
            WorkRequestStatus::Accepted => {
                if last_status != Some(WorkRequestStatus::Accepted) {
                    ctx.push_progress(
                        &format!("Work request for {context} accepted"),
                        &Progress::default(),
                    )?;
                }
            }
            WorkRequestStatus::InProgress => {
                if last_percent != Some(request.percent_complete) {
                    ctx.push_progress(
                        &format!("{context} in progress"),
                        &Progress::new(request.percent_complete.round() as u64, 100),
                    )?;
                    last_percent = Some(request.percent_complete);
                }
            }
            WorkRequestStatus::Canceling | WorkRequestStatus::Canceled => {
                error!(work_request = id, context, "work request was canceled");
                bail!(
                    ErrorKind::WorkRequestCanceled,
                    "Cloud work request was canceled",
                    format!("The work request for {context} was cancelled externally")
                );
            }
            WorkRequestStatus::Succeeded => {
                ctx.push_progress(&format!("{context} has completed"), &Progress::new(100, 100))?;
                debug!(work_request = id, context, "work request succeeded");

                return Ok(());
            }
            WorkRequestStatus::Failed => {
                error!(work_request = id, context, errors = ?request.errors, "work request failed");

                let mut errors: Vec<MigrateError> = request
                    .errors
                    .iter()
                    .map(|err| {
                        migrate_error!(
                            ErrorKind::WorkRequestFailed,
                            "Cloud work request failed",
                            format!(
                                "{context} has failed with a cloud error: {} (code {})",
                                err.message, err.code
                            )
                        )
                    })
                    .collect();
                if errors.is_empty() {
                    errors.push(migrate_error!(
                        ErrorKind::WorkRequestFailed,
                        "Cloud work request failed",
                        format!("{context} has failed without reporting an error")
                    ));
                }

                return Err(errors.into());
            }
        }

        last_status = Some(request.status);

        if let Some(timeout) = config.timeout() {
            if started.elapsed() >= timeout {
                bail!(
                    ErrorKind::StageTimeout,
                    "Cloud work request did not complete in time",
                    format!("{context} did not complete within {timeout:?}")
                );
            }
        }

        ctx.sleep(config.next_poll_delay(last_percent.unwrap_or(0.0)))
            .await?;
    }
}
