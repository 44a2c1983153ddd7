//! Deletion step.

use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::task::TaskGate;
use crate::update::context::UpdateContext;

/// Concurrent unlinks.
const DELETE_CONCURRENCY: usize = 10;

/// Unlinks every file the diff marked for deletion.
///
/// A path another fragment is downloading is left alone (the diff already
/// avoids this; the check here guards against racing selection changes).
/// Files already gone from disk are skipped.
pub(super) async fn delete_files(ctx: &mut UpdateContext, gate: &TaskGate) -> UpdateResult<()> {
    gate.checkpoint().await?;
    let diff = ctx.diff()?;

    let mut victims: Vec<(String, String)> = Vec::new();
    for (fragment, bucket) in diff {
        for (path, entry) in &bucket.files {
            if !entry.is_deletion() {
                continue;
            }
            let wanted_elsewhere = diff.values().any(|other| {
                other
                    .files
                    .get(path)
                    .is_some_and(|e| e.download || e.update_permissions)
            });
            if !wanted_elsewhere {
                victims.push((fragment.clone(), path.clone()));
            }
        }
    }
    debug!(files = victims.len(), "deleting files");

    let location = ctx.location.clone();
    let ledger = ctx.ledger.clone();
    let results: Vec<UpdateResult<()>> = futures::stream::iter(victims.into_iter().map(
        |(fragment, path)| {
            let location = location.clone();
            let ledger = ledger.clone();
            async move {
                let on_disk = location.join(&path);
                match tokio::fs::remove_file(&on_disk).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %on_disk.display(), "file to delete already gone");
                    }
                    Err(e) => return Err(UpdateError::io(on_disk, e)),
                }
                ledger.record_deleted(&fragment, &path).await;
                Ok(())
            }
        },
    ))
    .buffer_unordered(DELETE_CONCURRENCY)
    .collect()
    .await;

    for result in results {
        result?;
    }
    gate.checkpoint().await?;
    Ok(())
}
