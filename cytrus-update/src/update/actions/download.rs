//! Fragment download step.
//!
//! Four kinds of work hide behind one action:
//!
//! - plain files, fetched per content hash and fanned out to their targets
//! - packs, fetched as one tar blob and exploded onto their member paths
//! - archives, patched in place when only a few inner members changed
//! - permission-only entries, which just get a chmod
//!
//! The scratch directory for part files belongs to this action and is
//! removed on every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::diff::FragmentDiff;
use crate::error::{UpdateError, UpdateResult};
use crate::fetch::{set_permissions, FetchRequest, FetchTarget, Fetcher};
use crate::hash::sha1_hex;
use crate::manifest::{ArchiveManifest, FileEntry};
use crate::task::TaskGate;
use crate::update::context::{DownloadedArchive, UpdateContext};

/// Concurrent blob downloads within one fragment.
const FILE_CONCURRENCY: usize = 6;

/// Concurrent inner-file downloads while patching one archive.
const ARCHIVE_INNER_CONCURRENCY: usize = 2;

/// Fraction of an archive's size above which patching is pointless and the
/// whole archive is downloaded instead.
pub const ARCHIVE_FULL_THRESHOLD: f64 = 0.7;

/// Inner member carrying the archive's own manifest.
const ARCHIVE_META_MEMBER: &str = ".zaap.meta.json";

pub(super) async fn download_fragment(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
    fragment: &str,
) -> UpdateResult<()> {
    gate.checkpoint().await?;
    let Some(bucket) = ctx.diff()?.get(fragment).cloned() else {
        return Ok(());
    };
    if !bucket.has_downloads() && !bucket.files.values().any(|e| e.update_permissions) {
        return Ok(());
    }

    let parts_dir = ctx.parts_dir();
    let result = run_downloads(ctx, gate, fragment, &bucket, &parts_dir).await;

    // The scratch directory belongs to this action; leave nothing behind.
    let _ = tokio::fs::remove_dir_all(&parts_dir).await;
    result
}

async fn run_downloads(
    ctx: &UpdateContext,
    gate: &TaskGate,
    fragment: &str,
    bucket: &FragmentDiff,
    parts_dir: &Path,
) -> UpdateResult<()> {
    let fetcher = Fetcher::new(ctx.client.http().await);

    // Permission-only entries: chmod and remember the new bit.
    for (path, entry) in &bucket.files {
        if entry.update_permissions && !entry.download {
            set_permissions(&ctx.location.join(path), entry.executable).await?;
            ctx.ledger
                .record_downloaded(
                    fragment,
                    path,
                    FileEntry {
                        hash: entry.hash.clone(),
                        size: entry.size,
                        executable: entry.executable,
                    },
                )
                .await;
        }
    }
    gate.checkpoint().await?;

    // Archives worth patching in place instead of refetching.
    let mut patched: BTreeSet<String> = BTreeSet::new();
    for (path, remote_inner) in &bucket.archives {
        let Some(entry) = bucket.files.get(path) else {
            continue;
        };
        if !entry.download {
            continue;
        }
        match patch_archive(ctx, gate, fragment, path, entry, remote_inner, parts_dir).await? {
            Some(rebuilt) => {
                ctx.ledger.record_archive(fragment, path, rebuilt).await;
                patched.insert(path.clone());
            }
            None => {
                debug!(archive = %path, "patching not worthwhile, downloading whole archive");
            }
        }
        gate.checkpoint().await?;
    }

    // Plain files, grouped by content hash.
    let mut units: Vec<FetchUnit> = Vec::new();
    for (hash, targets) in bucket.download_index() {
        let files: Vec<(String, FileEntry)> = targets
            .iter()
            .filter(|t| !patched.contains(&t.path))
            .map(|t| {
                (
                    t.path.clone(),
                    FileEntry::new(hash.clone(), t.size, t.executable),
                )
            })
            .collect();
        if files.is_empty() {
            continue;
        }
        let request = FetchRequest {
            hash: hash.clone(),
            expected_size: files[0].1.size,
            url: ctx.client.blob_url(&ctx.game_uid, &hash)?,
            targets: files
                .iter()
                .map(|(path, entry)| {
                    FetchTarget::new(ctx.location.join(path), entry.executable)
                })
                .collect(),
            verify: true,
            parts_dir: parts_dir.to_path_buf(),
        };
        units.push(FetchUnit { request, files });
    }

    info!(
        fragment = %fragment,
        blobs = units.len(),
        "downloading fragment files"
    );

    let results: Vec<UpdateResult<()>> = futures::stream::iter(units.into_iter().map(|unit| {
        let fetcher = fetcher.clone();
        async move {
            let on_progress = |p: crate::fetch::FetchProgress| {
                ctx.progress.record(fragment, p.chunk_size);
            };
            fetcher.run(&unit.request, gate, &on_progress).await?;
            for (path, entry) in unit.files {
                ctx.ledger.record_downloaded(fragment, &path, entry).await;
            }
            Ok(())
        }
    }))
    .buffer_unordered(FILE_CONCURRENCY)
    .collect()
    .await;
    for result in results {
        result?;
    }

    // Packs, sequential: each already carries several files' worth of bytes.
    for (pack_hash, entry) in &bucket.files {
        if entry.is_pack && entry.download {
            download_pack(ctx, gate, &fetcher, fragment, pack_hash, entry, parts_dir).await?;
        }
    }

    Ok(())
}

struct FetchUnit {
    request: FetchRequest,
    files: Vec<(String, FileEntry)>,
}

/// Downloads a pack blob, unpacks it, and places its members.
///
/// Members missing from the tar abort the pack for those paths and fall
/// back to fetching the missing hashes individually.
async fn download_pack(
    ctx: &UpdateContext,
    gate: &TaskGate,
    fetcher: &Fetcher,
    fragment: &str,
    pack_hash: &str,
    entry: &crate::diff::DiffEntry,
    parts_dir: &Path,
) -> UpdateResult<()> {
    let Some(pack_files) = &entry.pack_files else {
        return Err(UpdateError::Internal {
            message: format!("pack entry {pack_hash} without member files"),
        });
    };

    let request = FetchRequest {
        hash: pack_hash.to_string(),
        expected_size: entry.size,
        url: ctx.client.blob_url(&ctx.game_uid, pack_hash)?,
        targets: Vec::new(),
        verify: true,
        parts_dir: parts_dir.to_path_buf(),
    };
    let on_progress = |p: crate::fetch::FetchProgress| {
        ctx.progress.record(fragment, p.chunk_size);
    };
    fetcher.run(&request, gate, &on_progress).await?;

    let part = request.part_path();
    let unpack_dir = parts_dir.join(format!("{pack_hash}.unpack"));
    unpack_tar(&part, &unpack_dir).await?;
    let _ = tokio::fs::remove_file(&part).await;

    let mut missing: BTreeMap<String, FileEntry> = BTreeMap::new();
    for (member_path, member_entry) in pack_files {
        let Some(member_hash) = member_entry.hash.as_deref() else {
            continue;
        };
        let extracted = unpack_dir.join(member_hash);
        if !extracted.is_file() {
            missing.insert(member_path.clone(), member_entry.clone());
            continue;
        }
        let target = ctx.location.join(member_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::io(parent, e))?;
        }
        tokio::fs::copy(&extracted, &target)
            .await
            .map_err(|e| UpdateError::io(&target, e))?;
        set_permissions(&target, member_entry.executable).await?;
        ctx.ledger
            .record_downloaded(fragment, member_path, member_entry.clone())
            .await;
    }
    let _ = tokio::fs::remove_dir_all(&unpack_dir).await;

    if missing.is_empty() {
        return Ok(());
    }
    warn!(
        pack = %pack_hash,
        missing = missing.len(),
        "pack misses members, fetching them individually"
    );

    // Group the leftovers by hash; targets sharing content fetch once.
    let mut by_hash: BTreeMap<String, Vec<(String, FileEntry)>> = BTreeMap::new();
    for (path, entry) in missing {
        if let Some(hash) = entry.hash.clone() {
            by_hash.entry(hash).or_default().push((path, entry));
        }
    }
    for (hash, files) in by_hash {
        gate.checkpoint().await?;
        let request = FetchRequest {
            hash: hash.clone(),
            expected_size: files[0].1.size,
            url: ctx.client.blob_url(&ctx.game_uid, &hash)?,
            targets: files
                .iter()
                .map(|(path, entry)| {
                    FetchTarget::new(ctx.location.join(path), entry.executable)
                })
                .collect(),
            verify: true,
            parts_dir: parts_dir.to_path_buf(),
        };
        fetcher.run(&request, gate, &on_progress).await?;
        for (path, entry) in files {
            ctx.ledger.record_downloaded(fragment, &path, entry).await;
        }
    }
    Ok(())
}

/// Patches an archive in place when few enough inner members changed.
///
/// Returns `None` when patching does not apply (no local archive state, a
/// corrupt or legacy local archive, or an inner diff past the threshold);
/// the caller then lets the plain download path fetch the whole archive.
async fn patch_archive(
    ctx: &UpdateContext,
    gate: &TaskGate,
    fragment: &str,
    path: &str,
    entry: &crate::diff::DiffEntry,
    remote_inline: &ArchiveManifest,
    parts_dir: &Path,
) -> UpdateResult<Option<DownloadedArchive>> {
    let on_disk = ctx.location.join(path);
    if !on_disk.is_file() {
        return Ok(None);
    }
    let local = ctx.ledger.local_snapshot().await;
    let Some(local_inner) = local.fragment(fragment).and_then(|f| f.archives.get(path)) else {
        return Ok(None);
    };

    // The authoritative inner manifest travels as a blob addressed by the
    // meta member's hash; the inline copy is the fallback.
    let remote_inner = match remote_inline.files.get(ARCHIVE_META_MEMBER) {
        Some(meta_entry) => {
            match fetch_archive_meta(ctx, &meta_entry.hash).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(archive = %path, error = %e, "archive meta unavailable, using inline manifest");
                    remote_inline.clone()
                }
            }
        }
        None => remote_inline.clone(),
    };

    let mut changed: Vec<(String, String, u64)> = Vec::new();
    for (inner_path, inner_entry) in &remote_inner.files {
        let same = local_inner
            .files
            .get(inner_path)
            .is_some_and(|l| l.hash == inner_entry.hash);
        if !same {
            changed.push((inner_path.clone(), inner_entry.hash.clone(), inner_entry.size));
        }
    }
    let removed: Vec<String> = local_inner
        .files
        .keys()
        .filter(|p| !remote_inner.files.contains_key(*p))
        .cloned()
        .collect();

    let changed_size: u64 = changed.iter().map(|(_, _, size)| size).sum();
    if entry.size > 0 && changed_size as f64 > ARCHIVE_FULL_THRESHOLD * entry.size as f64 {
        return Ok(None);
    }

    info!(
        archive = %path,
        changed = changed.len(),
        removed = removed.len(),
        "patching archive in place"
    );

    // Fetch the changed inner files, two at a time.
    let results: Vec<UpdateResult<(String, Bytes)>> =
        futures::stream::iter(changed.into_iter().map(|(inner_path, hash, _size)| async move {
            if gate.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let bytes = ctx.client.get_hash_bytes(&ctx.game_uid, &hash).await?;
            let actual = sha1_hex(&bytes);
            if actual != hash {
                return Err(UpdateError::HashMismatch { hash, actual });
            }
            ctx.progress.record(fragment, bytes.len() as u64);
            Ok((inner_path, bytes))
        }))
        .buffer_unordered(ARCHIVE_INNER_CONCURRENCY)
        .collect()
        .await;

    let mut replacements = Vec::new();
    for result in results {
        replacements.push(result?);
    }

    // Rebuild: a local archive we cannot parse is not patchable.
    let mut archive = match crate::d2p::D2pArchive::read(&on_disk).await {
        Ok(archive) => archive,
        Err(e) => {
            warn!(archive = %path, error = %e, "local archive unreadable, downloading whole");
            return Ok(None);
        }
    };
    for inner_path in &removed {
        archive.remove(inner_path);
    }
    for (inner_path, bytes) in replacements {
        archive.put(inner_path, bytes);
    }

    let staging: PathBuf = parts_dir.join(format!("{}.d2p.tmp", entry.hash.as_deref().unwrap_or("archive")));
    tokio::fs::create_dir_all(parts_dir)
        .await
        .map_err(|e| UpdateError::io(parts_dir, e))?;
    archive.write(&staging).await?;
    tokio::fs::rename(&staging, &on_disk)
        .await
        .map_err(|e| UpdateError::io(&on_disk, e))?;

    Ok(Some(DownloadedArchive {
        entry: FileEntry {
            hash: entry.hash.clone(),
            size: entry.size,
            executable: entry.executable,
        },
        manifest: remote_inner,
    }))
}

async fn fetch_archive_meta(ctx: &UpdateContext, hash: &str) -> UpdateResult<ArchiveManifest> {
    let bytes = ctx.client.get_hash_bytes(&ctx.game_uid, hash).await?;
    serde_json::from_slice(&bytes).map_err(|e| UpdateError::json(ARCHIVE_META_MEMBER, e))
}

/// Unpacks a tar blob into a directory on the blocking pool.
async fn unpack_tar(tar_path: &Path, dest: &Path) -> UpdateResult<()> {
    let tar_path = tar_path.to_path_buf();
    let dest_owned = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dest_owned)?;
        let file = std::fs::File::open(&tar_path)?;
        let mut archive = tar::Archive::new(file);
        archive.unpack(&dest_owned)?;
        Ok(())
    })
    .await
    .map_err(|e| UpdateError::Internal {
        message: format!("tar unpack task failed: {e}"),
    })?
    .map_err(|e| UpdateError::io(dest, e))
}
