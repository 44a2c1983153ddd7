//! Directory plumbing: pre-create what downloads need, prune what
//! deletions emptied.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use tracing::debug;

use crate::error::{UpdateError, UpdateResult};
use crate::task::TaskGate;
use crate::update::context::UpdateContext;

/// Concurrent directory creations.
const CREATE_CONCURRENCY: usize = 10;

/// Ensures every directory a fragment's downloads will write into exists.
pub(super) async fn create_directories(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
    fragment: &str,
) -> UpdateResult<()> {
    gate.checkpoint().await?;

    let Some(bucket) = ctx.diff()?.get(fragment) else {
        return Ok(());
    };

    let mut directories: BTreeSet<PathBuf> = BTreeSet::new();
    for (path, entry) in &bucket.files {
        if entry.download || entry.update_permissions {
            if let Some(parent) = ctx.location.join(path).parent() {
                directories.insert(parent.to_path_buf());
            }
        }
        if let Some(pack_files) = &entry.pack_files {
            for member_path in pack_files.keys() {
                if let Some(parent) = ctx.location.join(member_path).parent() {
                    directories.insert(parent.to_path_buf());
                }
            }
        }
    }

    debug!(
        fragment = %fragment,
        directories = directories.len(),
        "pre-creating directories"
    );

    let results: Vec<UpdateResult<()>> = futures::stream::iter(
        directories.into_iter().map(|dir| async move {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| UpdateError::io(&dir, e))
        }),
    )
    .buffer_unordered(CREATE_CONCURRENCY)
    .collect()
    .await;

    for result in results {
        result?;
    }
    Ok(())
}

/// Removes directories left empty under the install location.
///
/// The location root itself always stays.
pub(super) async fn clear_empty_directories(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
) -> UpdateResult<()> {
    gate.checkpoint().await?;
    let location = ctx.location.clone();
    tokio::task::spawn_blocking(move || prune_empty(&location).map(|_| ()))
        .await
        .map_err(|e| UpdateError::Internal {
            message: format!("directory pruning task failed: {e}"),
        })?
        .map_err(|e| UpdateError::io(&ctx.location, e))
}

/// Depth-first removal of empty directories. Returns whether `dir` ended up
/// empty (so the parent can remove it).
fn prune_empty(dir: &Path) -> io::Result<bool> {
    let mut empty = true;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if prune_empty(&path)? && std::fs::remove_dir(&path).is_ok() {
                continue;
            }
        }
        empty = false;
    }
    Ok(empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prune_removes_nested_empty_chains() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(temp.path().join("kept")).unwrap();
        std::fs::write(temp.path().join("kept/file.bin"), b"x").unwrap();

        prune_empty(temp.path()).unwrap();

        assert!(!temp.path().join("a").exists());
        assert!(temp.path().join("kept/file.bin").exists());
        assert!(temp.path().exists());
    }

    #[test]
    fn test_prune_keeps_directories_with_files_below() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/b/deep.bin"), b"x").unwrap();

        prune_empty(temp.path()).unwrap();

        assert!(temp.path().join("a/b/deep.bin").exists());
    }
}
