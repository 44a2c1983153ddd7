//! Diff computation step.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::UpdateResult;
use crate::task::TaskGate;
use crate::update::context::UpdateContext;

/// Runs the diff engine for a fragment selection and re-seeds progress.
pub(super) async fn create_diff(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
    fragments: &[String],
) -> UpdateResult<()> {
    gate.checkpoint().await?;

    let local = ctx.ledger.local_snapshot().await;
    let remote = ctx.remote_manifest()?;
    let diff = crate::diff::compute(fragments, &local, remote, ctx.config.platform);

    // Fragment totals come from the meta summary when the repository gave
    // us one, from the diff's own byte count otherwise.
    let totals: BTreeMap<String, u64> = diff
        .iter()
        .filter(|(_, bucket)| bucket.has_downloads())
        .map(|(name, bucket)| {
            let total = ctx
                .remote_meta
                .as_ref()
                .and_then(|meta| meta.get(name))
                .map(|m| m.total_size)
                .filter(|total| *total > 0)
                .unwrap_or_else(|| bucket.download_size());
            (name.clone(), total)
        })
        .collect();
    ctx.progress.reset_fragments(&totals);

    info!(
        fragments = ?fragments,
        buckets = diff.len(),
        downloads = crate::diff::has_downloads(&diff),
        "diff computed"
    );
    for (name, bucket) in &diff {
        debug!(
            fragment = %name,
            files = bucket.files.len(),
            download_bytes = bucket.download_size(),
            "fragment diff"
        );
    }

    ctx.diff = Some(diff);
    Ok(())
}
