//! The typed context shared by the actions of one run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::configuration::ReleaseConfiguration;
use super::progress::ProgressTracker;
use super::UpdateKind;
use crate::config::EngineConfig;
use crate::diff::Diff;
use crate::error::UpdateResult;
use crate::manifest::{
    write_local_manifest, ArchiveManifest, FileEntry, Manifest, ReleaseMeta,
};
use crate::repository::RepositoryClient;

/// An archive rebuilt during a run, pending merge into the local manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadedArchive {
    /// The archive file's own manifest entry.
    pub entry: FileEntry,
    /// Manifest of the archive's inner files after patching.
    pub manifest: ArchiveManifest,
}

#[derive(Default)]
struct LedgerState {
    local: Manifest,
    downloaded: BTreeMap<String, BTreeMap<String, FileEntry>>,
    archives: BTreeMap<String, BTreeMap<String, DownloadedArchive>>,
    deleted: BTreeMap<String, BTreeSet<String>>,
}

/// The local-manifest ledger of one run.
///
/// Download and delete actions record their effects here; saving merges the
/// pending records into the local manifest and persists it. The async mutex
/// serializes saves, so the periodic save and the explicit SaveHashes action
/// never interleave writes.
pub struct HashLedger {
    state: tokio::sync::Mutex<LedgerState>,
}

impl HashLedger {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(LedgerState::default()),
        }
    }

    /// Replaces the local manifest (after reading it from disk or repairing).
    pub async fn set_local(&self, manifest: Manifest) {
        self.state.lock().await.local = manifest;
    }

    /// A snapshot of the local manifest as currently known.
    pub async fn local_snapshot(&self) -> Manifest {
        self.state.lock().await.local.clone()
    }

    /// Records a file placed on disk.
    pub async fn record_downloaded(&self, fragment: &str, path: &str, entry: FileEntry) {
        self.state
            .lock()
            .await
            .downloaded
            .entry(fragment.to_string())
            .or_default()
            .insert(path.to_string(), entry);
    }

    /// Records an archive rebuilt on disk.
    pub async fn record_archive(&self, fragment: &str, path: &str, archive: DownloadedArchive) {
        self.state
            .lock()
            .await
            .archives
            .entry(fragment.to_string())
            .or_default()
            .insert(path.to_string(), archive);
    }

    /// Records a file removed from disk.
    pub async fn record_deleted(&self, fragment: &str, path: &str) {
        self.state
            .lock()
            .await
            .deleted
            .entry(fragment.to_string())
            .or_default()
            .insert(path.to_string());
    }

    /// Merges all pending records into the local manifest and persists it.
    ///
    /// Idempotent: with nothing pending, the write reproduces the previous
    /// file bytewise.
    pub async fn save(&self, location: &std::path::Path) -> UpdateResult<()> {
        let mut state = self.state.lock().await;
        let LedgerState {
            local,
            downloaded,
            archives,
            deleted,
        } = &mut *state;

        for (fragment, files) in std::mem::take(downloaded) {
            let bucket = local.fragment_mut(&fragment);
            for (path, entry) in files {
                bucket.files.insert(path, entry);
            }
        }
        for (fragment, rebuilt) in std::mem::take(archives) {
            let bucket = local.fragment_mut(&fragment);
            for (path, archive) in rebuilt {
                bucket.files.insert(path.clone(), archive.entry);
                bucket.archives.insert(path, archive.manifest);
            }
        }
        for (fragment, paths) in std::mem::take(deleted) {
            let bucket = local.fragment_mut(&fragment);
            for path in paths {
                bucket.files.remove(&path);
                bucket.archives.remove(&path);
            }
        }

        // Tombstones never describe a present file.
        for bucket in local.fragments.values_mut() {
            bucket.files.retain(|_, entry| !entry.is_tombstone());
        }
        local.fragments.retain(|_, f| !f.files.is_empty());

        write_local_manifest(location, local).await
    }
}

impl Default for HashLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the actions of one run read and write.
///
/// Passed to each action by exclusive borrow; actions set the fields they
/// produce and read the fields earlier actions filled in.
pub struct UpdateContext {
    pub config: EngineConfig,
    pub client: Arc<RepositoryClient>,

    pub game_uid: String,
    /// Release channel name (e.g. `main`, `beta`).
    pub release_name: String,
    /// Version being installed or updated to.
    pub version: String,
    pub location: PathBuf,
    pub kind: UpdateKind,

    /// Current fragment selection. LoadConfiguration may replace it, which
    /// makes the sequencer rebuild the remaining queue.
    pub fragments: Vec<String>,

    /// Produced by GetRemoteHashes.
    pub remote_manifest: Option<Manifest>,
    /// Produced by GetRemoteHashes; absent when the meta fetch failed.
    pub remote_meta: Option<ReleaseMeta>,
    /// Produced by CreateDiff.
    pub diff: Option<Diff>,
    /// Produced by LoadConfiguration.
    pub configuration: Option<ReleaseConfiguration>,

    pub ledger: Arc<HashLedger>,
    pub progress: Arc<ProgressTracker>,
}

impl UpdateContext {
    /// Scratch directory for partially downloaded blobs.
    pub fn parts_dir(&self) -> PathBuf {
        self.location.join(self.config.download_parts_dir())
    }

    /// State directory of this release.
    pub fn state_dir(&self) -> PathBuf {
        self.config
            .release_state_dir(&self.game_uid, &self.release_name)
    }

    /// The remote manifest, which the queue composition guarantees is
    /// present once any diffing action runs.
    pub fn remote_manifest(&self) -> UpdateResult<&Manifest> {
        self.remote_manifest
            .as_ref()
            .ok_or_else(|| crate::error::UpdateError::Internal {
                message: "remote manifest requested before GetRemoteHashes".to_string(),
            })
    }

    /// The current diff, present once CreateDiff ran.
    pub fn diff(&self) -> UpdateResult<&Diff> {
        self.diff
            .as_ref()
            .ok_or_else(|| crate::error::UpdateError::Internal {
                message: "diff requested before CreateDiff".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::read_local_manifest;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ledger_merges_downloads() {
        let temp = TempDir::new().unwrap();
        let ledger = HashLedger::new();

        ledger
            .record_downloaded("main", "a.bin", FileEntry::new("aa", 4, false))
            .await;
        ledger.save(temp.path()).await.unwrap();

        let local = read_local_manifest(temp.path()).await.unwrap();
        assert_eq!(
            local.fragments["main"].files["a.bin"],
            FileEntry::new("aa", 4, false)
        );
    }

    #[tokio::test]
    async fn test_ledger_removes_deleted_and_tombstones() {
        let temp = TempDir::new().unwrap();
        let ledger = HashLedger::new();

        let mut local = Manifest::new();
        let bucket = local.fragment_mut("main");
        bucket
            .files
            .insert("keep.bin".to_string(), FileEntry::new("aa", 4, false));
        bucket
            .files
            .insert("gone.bin".to_string(), FileEntry::new("bb", 2, false));
        bucket
            .files
            .insert("ghost.bin".to_string(), FileEntry::tombstone());
        ledger.set_local(local).await;

        ledger.record_deleted("main", "gone.bin").await;
        ledger.save(temp.path()).await.unwrap();

        let saved = read_local_manifest(temp.path()).await.unwrap();
        let files = &saved.fragments["main"].files;
        assert!(files.contains_key("keep.bin"));
        assert!(!files.contains_key("gone.bin"));
        assert!(!files.contains_key("ghost.bin"));
    }

    #[tokio::test]
    async fn test_ledger_save_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let ledger = HashLedger::new();
        ledger
            .record_downloaded("main", "a.bin", FileEntry::new("aa", 4, false))
            .await;

        ledger.save(temp.path()).await.unwrap();
        let first = tokio::fs::read(temp.path().join(".release.hashes.json"))
            .await
            .unwrap();

        ledger.save(temp.path()).await.unwrap();
        let second = tokio::fs::read(temp.path().join(".release.hashes.json"))
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ledger_merges_archives() {
        let temp = TempDir::new().unwrap();
        let ledger = HashLedger::new();

        let mut manifest = ArchiveManifest::default();
        manifest.files.insert(
            "inner/0.dlm".to_string(),
            crate::manifest::ArchiveFileEntry {
                hash: "ii".into(),
                size: 8,
            },
        );
        ledger
            .record_archive(
                "main",
                "maps.d2p",
                DownloadedArchive {
                    entry: FileEntry::new("aa", 100, false),
                    manifest,
                },
            )
            .await;
        ledger.save(temp.path()).await.unwrap();

        let local = read_local_manifest(temp.path()).await.unwrap();
        let fragment = &local.fragments["main"];
        assert!(fragment.files.contains_key("maps.d2p"));
        assert!(fragment.archives["maps.d2p"].files.contains_key("inner/0.dlm"));
    }

    #[tokio::test]
    async fn test_empty_fragments_dropped_on_save() {
        let temp = TempDir::new().unwrap();
        let ledger = HashLedger::new();

        let mut local = Manifest::new();
        local
            .fragment_mut("fr")
            .files
            .insert("only.bin".to_string(), FileEntry::new("aa", 1, false));
        ledger.set_local(local).await;
        ledger.record_deleted("fr", "only.bin").await;
        ledger.save(temp.path()).await.unwrap();

        let saved = read_local_manifest(temp.path()).await.unwrap();
        assert!(!saved.fragments.contains_key("fr"));
    }
}
