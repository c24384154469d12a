use tracing::info;

use crate::cloud::{CloudProvider, wait_work_request};
use crate::error::MigrateResult;
use crate::stage::StageContext;
use crate::status::Progress;

/// Deletes the cloud resources this migration created and that the user no longer needs.
///
/// Only the bucket and the jump host are candidates, and only when the persisted resources say
/// this migration created them. A resource that is already gone counts as deleted. The ids of
/// deleted resources are cleared from the resource document so a later run does not reuse them.
pub(crate) async fn clean_up(
    ctx: &StageContext,
    delete_bucket: bool,
    delete_jump_host: bool,
) -> MigrateResult<()> {
    info!(delete_bucket, delete_jump_host, "cleaning up");

    if delete_bucket {
        remove_bucket(ctx).await?;
    }
    if delete_jump_host {
        remove_jump_host(ctx).await?;
    }

    Ok(())
}

async fn remove_bucket(ctx: &StageContext) -> MigrateResult<()> {
    let run = ctx.run();
    let (name, created) = run
        .resources()
        .read(|resources| (resources.bucket_name.clone(), resources.bucket_created));

    if name.is_empty() || !created {
        info!(bucket = %name, "bucket was not created by this migration, keeping it");
        return Ok(());
    }

    ctx.push_progress(&format!("Deleting bucket {name}"), &Progress::default())?;
    let cloud = ctx.cloud();
    let objects = cloud.delete_objects(&name, "").await?;
    if cloud.delete_bucket(&name).await? {
        info!(bucket = %name, objects, "deleted bucket and its contents");
    } else {
        info!(bucket = %name, "bucket was already deleted");
    }

    run.resources().update(|resources| {
        resources.bucket_created = false;
        resources.bucket_name.clear();
        resources.bucket_namespace.clear();
        resources.bucket_par = None;
    })
}

async fn remove_jump_host(ctx: &StageContext) -> MigrateResult<()> {
    let run = ctx.run();
    let (id, name, created) = run.resources().read(|resources| {
        (
            resources.compute_id.clone(),
            resources.compute_name.clone(),
            resources.compute_created,
        )
    });

    if id.is_empty() || !created {
        info!(instance = %id, "jump host was not created by this migration, keeping it");
        return Ok(());
    }

    ctx.push_progress(
        &format!("Deleting compute instance {name}"),
        &Progress::default(),
    )?;
    run.disconnect_helper().await;

    match ctx.cloud().terminate_instance(&id).await? {
        Some(request) => {
            wait_work_request(ctx, &request, "Jump host termination").await?;
            info!(instance = %id, %name, "terminated jump host");
        }
        None => info!(instance = %id, "jump host was already deleted"),
    }

    run.resources().update(|resources| {
        resources.compute_created = false;
        resources.compute_id.clear();
        resources.compute_name.clear();
        resources.compute_public_ip.clear();
        resources.compute_private_ip.clear();
    })
}
