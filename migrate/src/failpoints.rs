use fail::fail_point;

use crate::error::MigrateResult;
use crate::types::StageId;

/// Prefix of the fail points evaluated before a stage worker runs, one per stage caption.
pub const STAGE_WORKER__BEFORE_RUN: &str = "stage_worker.before_run";

/// Evaluated by the export before every launch of the export tool.
pub const EXPORT__BEFORE_LAUNCH: &str = "export.before_launch";

/// Evaluated by the supervisor at the start of every poll cycle.
pub const SUPERVISOR__BEFORE_CYCLE: &str = "supervisor.before_cycle";

/// Evaluated before every attempt of a cloud call made through the retrying provider.
pub const CLOUD__BEFORE_CALL: &str = "cloud.before_call";

/// Returns the name of the fail point evaluated before the worker of `stage` runs.
pub fn stage_worker_fail_point(stage: StageId) -> String {
    format!("{STAGE_WORKER__BEFORE_RUN}.{}", stage.caption())
}

/// Evaluates the fail point `name`, returning an error when it is configured to fail.
///
/// The parameter of the fail point selects the kind of the error: `aborted`, `transient` or
/// anything else for an injected failure.
pub fn migrate_fail_point(name: &str) -> MigrateResult<()> {
    fail_point!(name, |parameter| {
        use crate::bail;
        use crate::error::ErrorKind;

        let error_kind = match parameter.as_deref() {
            Some("aborted") => ErrorKind::Aborted,
            Some("transient") => ErrorKind::CloudApiTransient,
            _ => ErrorKind::InjectedFailure,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
