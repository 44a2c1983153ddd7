//! Manifest bookkeeping actions: remote fetch, local load, save.

use tracing::{debug, warn};

use crate::error::UpdateResult;
use crate::manifest::read_local_manifest;
use crate::task::TaskGate;
use crate::update::context::UpdateContext;
use crate::update::UpdateKind;

/// Fetches the remote manifest and its size summary.
///
/// A pre-install fetches the `.config` sibling: only the configuration
/// fragment matters before the user commits. The meta summary only feeds
/// progress totals, so a failure there degrades the progress bar rather
/// than the run.
pub(super) async fn get_remote_hashes(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
) -> UpdateResult<()> {
    gate.checkpoint().await?;

    let manifest = match ctx.kind {
        UpdateKind::PreInstall => {
            ctx.client
                .get_release_config(
                    &ctx.game_uid,
                    &ctx.release_name,
                    ctx.config.platform,
                    &ctx.version,
                )
                .await?
        }
        _ => {
            ctx.client
                .get_release(
                    &ctx.game_uid,
                    &ctx.release_name,
                    ctx.config.platform,
                    &ctx.version,
                )
                .await?
        }
    };

    gate.checkpoint().await?;
    let meta = match ctx
        .client
        .get_release_meta(
            &ctx.game_uid,
            &ctx.release_name,
            ctx.config.platform,
            &ctx.version,
        )
        .await
    {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(error = %e, "release meta unavailable, progress totals fall back to diff sizes");
            None
        }
    };

    debug!(
        game = %ctx.game_uid,
        version = %ctx.version,
        fragments = manifest.fragments.len(),
        "remote manifest fetched"
    );
    ctx.remote_manifest = Some(manifest);
    ctx.remote_meta = meta;
    Ok(())
}

/// Loads the local manifest from the install location into the ledger.
///
/// Failure here is the repair trigger: a missing, corrupt, or legacy-cased
/// file surfaces as `LOCAL_HASHES_ERROR` and the release schedules a
/// repair run instead.
pub(super) async fn get_local_hashes(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
) -> UpdateResult<()> {
    gate.checkpoint().await?;
    let local = read_local_manifest(&ctx.location).await?;
    debug!(fragments = local.fragments.len(), "local manifest loaded");
    ctx.ledger.set_local(local).await;
    Ok(())
}

/// Persists the local manifest and refreshes the licenses record.
pub(super) async fn save_hashes(ctx: &mut UpdateContext, gate: &TaskGate) -> UpdateResult<()> {
    gate.checkpoint().await?;
    ctx.ledger.save(&ctx.location).await?;

    if let Some(folder) = ctx
        .configuration
        .as_ref()
        .and_then(|c| c.licenses_folder.as_deref())
    {
        let source = ctx.location.join(folder);
        if let Err(e) = crate::release::refresh_licenses(&source, &ctx.state_dir()).await {
            // Licenses are presentation data; their absence never fails a run.
            warn!(error = %e, "failed to refresh licenses");
        }
    }
    Ok(())
}
