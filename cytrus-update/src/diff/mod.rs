//! Manifest reconciliation.
//!
//! The diff engine compares a local manifest against a remote one for a
//! fragment selection and produces the action plan: which files to download,
//! which only need their permissions fixed, which packs to fetch wholesale,
//! and which local files to delete.
//!
//! The computation is pure over its inputs; running it again with a changed
//! fragment selection mid-update yields a correct new plan.

use std::collections::{BTreeMap, HashMap};

use crate::config::Platform;
use crate::manifest::{ArchiveManifest, FileEntry, Fragment, HashTarget, Manifest};

/// Fraction of a pack's members that must be wanted before the pack is
/// fetched wholesale instead of its members individually.
pub const PACK_RATIO: f64 = 0.5;

/// One entry in a fragment diff.
///
/// `size == 0` with no hash marks a deletion. A pack entry (`is_pack`)
/// stands in for the member files it bundles; the members stay in the map
/// with `download` cleared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffEntry {
    pub hash: Option<String>,
    pub size: u64,
    pub executable: bool,
    /// Fetch this content.
    pub download: bool,
    /// Only the executable bit differs; a chmod suffices.
    pub update_permissions: bool,
    /// This entry is a pack standing in for several member files.
    pub is_pack: bool,
    /// Member files of a pack entry, keyed by target path.
    pub pack_files: Option<BTreeMap<String, FileEntry>>,
}

impl DiffEntry {
    /// True if this entry marks a local file for deletion.
    pub fn is_deletion(&self) -> bool {
        self.size == 0 && self.hash.is_none() && !self.download
    }

    fn changed(remote: &FileEntry, download: bool, update_permissions: bool) -> Self {
        Self {
            hash: remote.hash.clone(),
            size: remote.size,
            executable: remote.executable,
            download,
            update_permissions,
            is_pack: false,
            pack_files: None,
        }
    }

    fn deletion() -> Self {
        Self::default()
    }
}

/// Diff for one fragment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FragmentDiff {
    /// Path (or pack hash, for pack entries) to diff entry.
    pub files: BTreeMap<String, DiffEntry>,

    /// Remote manifests of archives whose path appears in the diff.
    pub archives: BTreeMap<String, ArchiveManifest>,
}

impl FragmentDiff {
    /// Inverted index over entries still marked for individual download,
    /// from content hash to the targets sharing it. Pack entries are not
    /// included; they are fetched through their own entry.
    pub fn download_index(&self) -> HashMap<String, Vec<HashTarget>> {
        let mut index: HashMap<String, Vec<HashTarget>> = HashMap::new();
        for (path, entry) in &self.files {
            if !entry.download || entry.is_pack {
                continue;
            }
            if let Some(hash) = &entry.hash {
                index.entry(hash.clone()).or_default().push(HashTarget {
                    path: path.clone(),
                    size: entry.size,
                    executable: entry.executable,
                });
            }
        }
        index
    }

    /// Total bytes this fragment still needs to fetch.
    pub fn download_size(&self) -> u64 {
        let mut counted: HashMap<&str, u64> = HashMap::new();
        for entry in self.files.values() {
            if entry.download {
                if let Some(hash) = &entry.hash {
                    // Shared hashes download once.
                    counted.insert(hash, entry.size);
                }
            }
        }
        counted.values().sum()
    }

    /// True if nothing is to be downloaded, fixed, or deleted.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True if any entry requests a download.
    pub fn has_downloads(&self) -> bool {
        self.files.values().any(|e| e.download)
    }
}

/// A complete diff, keyed by fragment.
pub type Diff = BTreeMap<String, FragmentDiff>;

/// True if any fragment in the diff requests a download.
pub fn has_downloads(diff: &Diff) -> bool {
    diff.values().any(FragmentDiff::has_downloads)
}

/// Computes the reconciliation plan for `selection`.
///
/// Fragments outside the selection that exist locally are fully torn down
/// (their files become deletions); fragments with no local presence outside
/// the selection are ignored.
pub fn compute(
    selection: &[String],
    local: &Manifest,
    remote: &Manifest,
    platform: Platform,
) -> Diff {
    let mut diff: Diff = BTreeMap::new();
    let mut scratch = local.clone();

    // Pass 1: compare remote fragments against local state.
    for (name, fragment) in &remote.fragments {
        let in_selection = selection.iter().any(|s| s == name);
        let locally_present = local
            .fragment(name)
            .is_some_and(|f| !f.files.is_empty());

        if !in_selection && !locally_present {
            continue;
        }

        let bucket = diff.entry(name.clone()).or_default();
        if !in_selection {
            // Locally present but deselected: everything the scratch copy
            // still holds becomes a deletion candidate in pass 3.
            continue;
        }

        compare_fragment(name, fragment, &mut scratch, bucket, platform);
    }

    // Pass 2: pack coalescing.
    for (name, fragment) in &remote.fragments {
        if fragment.packs.is_empty() {
            continue;
        }
        if let Some(bucket) = diff.get_mut(name) {
            coalesce_packs(fragment, bucket);
        }
    }

    // Pass 3: whatever survives in the scratch copy is no longer wanted.
    mark_deletions(&scratch, &mut diff);

    diff
}

/// Compares one selected remote fragment against the local scratch copy.
fn compare_fragment(
    name: &str,
    remote: &Fragment,
    scratch: &mut Manifest,
    bucket: &mut FragmentDiff,
    platform: Platform,
) {
    for (path, remote_entry) in &remote.files {
        if remote_entry.is_tombstone() {
            // Tombstoned remotely: leave any local copy for the deletion
            // pass.
            continue;
        }

        let local_entry = scratch
            .fragment(name)
            .and_then(|f| f.files.get(path))
            .cloned();

        let (hash_changed, perm_changed) = match &local_entry {
            Some(local) => {
                let hash_changed = local.hash != remote_entry.hash;
                let perm_changed = platform.tracks_permissions()
                    && local.executable != remote_entry.executable;
                (hash_changed, perm_changed)
            }
            None => (true, false),
        };

        if hash_changed || perm_changed {
            bucket.files.insert(
                path.clone(),
                DiffEntry::changed(remote_entry, hash_changed, perm_changed),
            );
            if let Some(archive) = remote.archives.get(path) {
                bucket.archives.insert(path.clone(), archive.clone());
            }
        }

        // Processed: whatever remains in scratch afterwards is a deletion
        // candidate.
        if local_entry.is_some() {
            scratch.fragment_mut(name).files.remove(path);
        }
    }
}

/// Replaces clusters of wanted pack members with a single pack fetch.
fn coalesce_packs(remote: &Fragment, bucket: &mut FragmentDiff) {
    for (pack_hash, pack) in &remote.packs {
        if pack.hashes.is_empty() {
            continue;
        }

        // Paths in this bucket wanting a hash that the pack provides.
        let mut member_paths: BTreeMap<String, FileEntry> = BTreeMap::new();
        let mut member_hashes: Vec<&str> = Vec::new();
        for hash in &pack.hashes {
            let mut wanted = false;
            for (path, entry) in &bucket.files {
                if entry.download && !entry.is_pack && entry.hash.as_deref() == Some(hash) {
                    wanted = true;
                    member_paths.insert(
                        path.clone(),
                        FileEntry {
                            hash: entry.hash.clone(),
                            size: entry.size,
                            executable: entry.executable,
                        },
                    );
                }
            }
            if wanted {
                member_hashes.push(hash);
            }
        }

        let ratio = member_hashes.len() as f64 / pack.hashes.len() as f64;
        if ratio <= PACK_RATIO {
            continue;
        }

        for entry in bucket.files.values_mut() {
            if let Some(hash) = entry.hash.as_deref() {
                if member_hashes.contains(&hash) {
                    entry.download = false;
                }
            }
        }
        bucket.files.insert(
            pack_hash.clone(),
            DiffEntry {
                hash: Some(pack_hash.clone()),
                size: pack.size,
                executable: false,
                download: true,
                update_permissions: false,
                is_pack: true,
                pack_files: Some(member_paths),
            },
        );
    }
}

/// Records a deletion for every local file the remote no longer wants.
fn mark_deletions(scratch: &Manifest, diff: &mut Diff) {
    for (name, fragment) in &scratch.fragments {
        for path in fragment.files.keys() {
            let downloaded_elsewhere = diff.values().any(|bucket| {
                bucket
                    .files
                    .get(path)
                    .is_some_and(|entry| entry.download || entry.update_permissions)
            });
            if downloaded_elsewhere {
                continue;
            }
            diff.entry(name.clone())
                .or_default()
                .files
                .insert(path.clone(), DiffEntry::deletion());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Pack;

    fn selection(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn manifest_with(fragment: &str, files: &[(&str, &str, u64, bool)]) -> Manifest {
        let mut manifest = Manifest::new();
        let bucket = manifest.fragment_mut(fragment);
        for (path, hash, size, executable) in files {
            bucket
                .files
                .insert(path.to_string(), FileEntry::new(*hash, *size, *executable));
        }
        manifest
    }

    #[test]
    fn test_fresh_install_downloads_everything() {
        let remote = manifest_with("main", &[("a.bin", "aa", 4, false), ("b.bin", "bb", 2, true)]);
        let diff = compute(&selection(&["main"]), &Manifest::new(), &remote, Platform::Linux);

        let bucket = &diff["main"];
        assert_eq!(bucket.files.len(), 2);
        assert!(bucket.files["a.bin"].download);
        assert!(bucket.files["b.bin"].download);
        assert!(!bucket.files["a.bin"].update_permissions);
    }

    #[test]
    fn test_identical_manifests_produce_no_downloads() {
        let remote = manifest_with("main", &[("a.bin", "aa", 4, false)]);
        let local = remote.clone();

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        assert!(!has_downloads(&diff));
        assert!(diff.get("main").map_or(true, FragmentDiff::is_empty));
    }

    #[test]
    fn test_changed_hash_is_downloaded() {
        let local = manifest_with("main", &[("a.bin", "aa", 4, false)]);
        let remote = manifest_with("main", &[("a.bin", "a2", 6, false)]);

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        let entry = &diff["main"].files["a.bin"];
        assert!(entry.download);
        assert_eq!(entry.hash.as_deref(), Some("a2"));
        assert_eq!(entry.size, 6);
    }

    #[test]
    fn test_exec_bit_change_is_permissions_only() {
        let local = manifest_with("main", &[("run.sh", "aa", 4, false)]);
        let remote = manifest_with("main", &[("run.sh", "aa", 4, true)]);

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        let entry = &diff["main"].files["run.sh"];
        assert!(!entry.download);
        assert!(entry.update_permissions);
        assert!(entry.executable);
    }

    #[test]
    fn test_exec_bit_ignored_on_windows() {
        let local = manifest_with("main", &[("run.sh", "aa", 4, false)]);
        let remote = manifest_with("main", &[("run.sh", "aa", 4, true)]);

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Windows);
        assert!(diff.get("main").map_or(true, FragmentDiff::is_empty));
    }

    #[test]
    fn test_removed_file_becomes_deletion() {
        let local = manifest_with("main", &[("a.bin", "aa", 4, false), ("b.bin", "bb", 2, false)]);
        let remote = manifest_with("main", &[("a.bin", "aa", 4, false)]);

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        let entry = &diff["main"].files["b.bin"];
        assert!(entry.is_deletion());
        assert!(!diff["main"].files.contains_key("a.bin"));
    }

    #[test]
    fn test_remote_tombstone_deletes_local_copy() {
        let local = manifest_with("main", &[("old.bin", "aa", 4, false)]);
        let mut remote = Manifest::new();
        remote
            .fragment_mut("main")
            .files
            .insert("old.bin".to_string(), FileEntry::tombstone());

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        assert!(diff["main"].files["old.bin"].is_deletion());
    }

    #[test]
    fn test_deselected_fragment_with_local_files_is_torn_down() {
        let local = manifest_with("fr", &[("lang.bin", "aa", 4, false)]);
        let remote = manifest_with("fr", &[("lang.bin", "aa", 4, false)]);

        let diff = compute(&selection(&["en"]), &local, &remote, Platform::Linux);
        assert!(diff["fr"].files["lang.bin"].is_deletion());
    }

    #[test]
    fn test_deselected_fragment_without_local_files_is_skipped() {
        let remote = manifest_with("fr", &[("lang.bin", "aa", 4, false)]);

        let diff = compute(&selection(&["en"]), &Manifest::new(), &remote, Platform::Linux);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_file_moving_fragments_is_not_deleted() {
        // Same path downloaded under "en" while removed from "fr": the
        // deletion pass must leave it alone.
        let local = manifest_with("fr", &[("shared.bin", "aa", 4, false)]);
        let remote = manifest_with("en", &[("shared.bin", "a2", 4, false)]);

        let diff = compute(&selection(&["en"]), &local, &remote, Platform::Linux);
        assert!(diff["en"].files["shared.bin"].download);
        assert!(diff
            .get("fr")
            .map_or(true, |b| !b.files.contains_key("shared.bin")));
    }

    #[test]
    fn test_pack_coalescing_above_ratio() {
        // 6 wanted members of a 10-member pack: 0.6 > 0.5, coalesce.
        let mut remote = Manifest::new();
        let fragment = remote.fragment_mut("main");
        let mut pack_hashes = Vec::new();
        for i in 0..10 {
            let hash = format!("h{i:02}");
            pack_hashes.push(hash.clone());
            if i < 6 {
                fragment
                    .files
                    .insert(format!("f{i}.bin"), FileEntry::new(&hash, 10, false));
            }
        }
        fragment.packs.insert(
            "packhash".to_string(),
            Pack {
                size: 100,
                hashes: pack_hashes,
            },
        );

        let diff = compute(&selection(&["main"]), &Manifest::new(), &remote, Platform::Linux);
        let bucket = &diff["main"];

        let pack_entry = &bucket.files["packhash"];
        assert!(pack_entry.is_pack);
        assert!(pack_entry.download);
        assert_eq!(pack_entry.pack_files.as_ref().unwrap().len(), 6);

        // No member remains individually downloadable.
        for i in 0..6 {
            assert!(!bucket.files[&format!("f{i}.bin")].download);
        }
        assert!(bucket.download_index().is_empty());
    }

    #[test]
    fn test_pack_not_coalesced_at_or_below_ratio() {
        // 5 of 10 members: 0.5 is not strictly greater than the ratio.
        let mut remote = Manifest::new();
        let fragment = remote.fragment_mut("main");
        let mut pack_hashes = Vec::new();
        for i in 0..10 {
            let hash = format!("h{i:02}");
            pack_hashes.push(hash.clone());
            if i < 5 {
                fragment
                    .files
                    .insert(format!("f{i}.bin"), FileEntry::new(&hash, 10, false));
            }
        }
        fragment.packs.insert(
            "packhash".to_string(),
            Pack {
                size: 100,
                hashes: pack_hashes,
            },
        );

        let diff = compute(&selection(&["main"]), &Manifest::new(), &remote, Platform::Linux);
        let bucket = &diff["main"];
        assert!(!bucket.files.contains_key("packhash"));
        assert_eq!(bucket.download_index().len(), 5);
    }

    #[test]
    fn test_archive_entry_carried_with_changed_file() {
        let mut remote = manifest_with("main", &[("maps.d2p", "aa", 100, false)]);
        let mut archive = ArchiveManifest::default();
        archive.files.insert(
            "maps/0.dlm".to_string(),
            crate::manifest::ArchiveFileEntry {
                hash: "inner".into(),
                size: 40,
            },
        );
        remote
            .fragment_mut("main")
            .archives
            .insert("maps.d2p".to_string(), archive);

        let diff = compute(&selection(&["main"]), &Manifest::new(), &remote, Platform::Linux);
        assert!(diff["main"].archives.contains_key("maps.d2p"));
    }

    #[test]
    fn test_download_size_counts_shared_hashes_once() {
        let remote = manifest_with(
            "main",
            &[("a.bin", "aa", 4, false), ("copy/a.bin", "aa", 4, false)],
        );
        let diff = compute(&selection(&["main"]), &Manifest::new(), &remote, Platform::Linux);
        assert_eq!(diff["main"].download_size(), 4);
    }

    #[test]
    fn test_diff_is_pure_and_repeatable() {
        let local = manifest_with("main", &[("a.bin", "aa", 4, false)]);
        let remote = manifest_with("main", &[("a.bin", "a2", 4, false), ("b.bin", "bb", 1, false)]);

        let first = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        let second = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        assert_eq!(first, second);
    }
}
