//! Local state reconstruction.
//!
//! A repair distrusts `.release.hashes.json` entirely and rebuilds it by
//! hashing what is actually on disk, guided by the remote manifest's file
//! listing. Whatever matches remotely known content becomes local state;
//! everything else the next diff treats as missing or foreign.

use futures::StreamExt;

use crate::error::{UpdateError, UpdateResult};
use crate::hash::sha1_of_file;
use crate::manifest::{FileEntry, Manifest, CONFIGURATION_FRAGMENT};
use crate::task::TaskGate;
use crate::update::context::UpdateContext;
use tracing::{debug, info};

/// Concurrent file hashing jobs.
const HASH_CONCURRENCY: usize = 10;

pub(super) async fn repair(ctx: &mut UpdateContext, gate: &TaskGate) -> UpdateResult<()> {
    gate.checkpoint().await?;
    let remote = ctx.remote_manifest()?.clone();

    // The configuration fragment is always part of a repair: the tree is
    // unusable without knowing which configuration it belongs to.
    let mut fragments: Vec<String> = vec![CONFIGURATION_FRAGMENT.to_string()];
    for name in &ctx.fragments {
        if !fragments.contains(name) {
            fragments.push(name.clone());
        }
    }

    let mut jobs = Vec::new();
    for name in &fragments {
        let Some(fragment) = remote.fragment(name) else {
            continue;
        };
        for (path, entry) in &fragment.files {
            if entry.is_tombstone() {
                continue;
            }
            jobs.push((name.clone(), path.clone(), ctx.location.join(path)));
        }
    }
    info!(files = jobs.len(), "repair hashing local tree");

    let gate_ref = &gate;
    let results: Vec<UpdateResult<Option<(String, String, FileEntry)>>> =
        futures::stream::iter(jobs.into_iter().map(|(fragment, path, on_disk)| async move {
            if gate_ref.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let metadata = match tokio::fs::metadata(&on_disk).await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => return Ok(None),
            };
            let hash = sha1_of_file(&on_disk).await?;
            let executable = is_executable(&metadata);
            Ok(Some((
                fragment,
                path,
                FileEntry::new(hash, metadata.len(), executable),
            )))
        }))
        .buffer_unordered(HASH_CONCURRENCY)
        .collect()
        .await;

    let mut local = Manifest::new();
    for result in results {
        if let Some((fragment, path, entry)) = result? {
            local.fragment_mut(&fragment).files.insert(path, entry);
        }
    }

    // Archives whose file hash matches remote content carry the remote
    // inner manifest: identical bytes, identical members.
    for name in &fragments {
        let Some(remote_fragment) = remote.fragment(name) else {
            continue;
        };
        for (path, archive) in &remote_fragment.archives {
            let matches = local
                .fragment(name)
                .and_then(|f| f.files.get(path))
                .map(|e| e.hash == remote_fragment.files.get(path).and_then(|r| r.hash.clone()))
                .unwrap_or(false);
            if matches {
                local.fragment_mut(name).archives.insert(path.clone(), archive.clone());
            }
        }
    }

    debug!(
        fragments = local.fragments.len(),
        "repair rebuilt local manifest"
    );
    ctx.ledger.set_local(local).await;
    gate.checkpoint().await?;
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
