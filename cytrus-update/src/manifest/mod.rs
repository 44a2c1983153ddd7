//! Release manifest model.
//!
//! A manifest maps fragment names to the files, packs, and archives that
//! make up a release on one platform. The same shape is used for the remote
//! manifest fetched from the repository and for the local manifest persisted
//! next to the installed tree (`.release.hashes.json`).
//!
//! Maps are `BTreeMap` throughout so that serialization is deterministic:
//! writing the same manifest twice yields bytewise-identical JSON.

mod local;

pub use local::{
    read_local_manifest, read_release_infos, write_local_manifest, write_release_infos,
    ReleaseInfos, LOCAL_HASHES_FILE, RELEASE_INFOS_FILE,
};

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Name of the mandatory fragment carrying release configuration.
///
/// It is always diffed and downloaded before any other fragment.
pub const CONFIGURATION_FRAGMENT: &str = "configuration";

/// One file in a fragment.
///
/// `size == 0` with no hash is a tombstone: the file is to be deleted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content hash (hex SHA-1), absent for tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// File size in bytes.
    #[serde(default)]
    pub size: u64,

    /// Whether the file carries the executable bit on unix platforms.
    #[serde(default)]
    pub executable: bool,
}

impl FileEntry {
    /// Create a regular file entry.
    pub fn new(hash: impl Into<String>, size: u64, executable: bool) -> Self {
        Self {
            hash: Some(hash.into()),
            size,
            executable,
        }
    }

    /// Create a tombstone entry marking the path for deletion.
    pub fn tombstone() -> Self {
        Self {
            hash: None,
            size: 0,
            executable: false,
        }
    }

    /// True if this entry marks the path for deletion.
    pub fn is_tombstone(&self) -> bool {
        self.size == 0 && self.hash.is_none()
    }
}

/// A pack: a tar bundle of several files addressed by one hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    /// Size of the pack blob itself.
    #[serde(default)]
    pub size: u64,

    /// Content hashes of the member files.
    #[serde(default)]
    pub hashes: Vec<String>,
}

/// One file inside an archive container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFileEntry {
    /// Content hash of the inner file.
    pub hash: String,

    /// Size of the inner file.
    #[serde(default)]
    pub size: u64,
}

/// Manifest of an archive container's contents.
///
/// The archive itself is a file in the fragment; its members are addressed
/// here so that the archive can be patched in place instead of refetched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    /// Inner path to entry.
    #[serde(default)]
    pub files: BTreeMap<String, ArchiveFileEntry>,
}

impl ArchiveManifest {
    /// Total size of all inner files.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

/// A target location sharing a content hash, from the inverted index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashTarget {
    /// Fragment-relative file path (forward slashes).
    pub path: String,
    /// File size.
    pub size: u64,
    /// Executable bit.
    pub executable: bool,
}

/// One fragment of a release.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// File path (forward-slash, relative) to entry.
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,

    /// Pack hash to pack description.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packs: BTreeMap<String, Pack>,

    /// Archive path to inner-file manifest.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub archives: BTreeMap<String, ArchiveManifest>,
}

impl Fragment {
    /// Builds the inverted index from content hash to the targets sharing it.
    ///
    /// Tombstones carry no hash and do not appear.
    pub fn hash_index(&self) -> HashMap<String, Vec<HashTarget>> {
        let mut index: HashMap<String, Vec<HashTarget>> = HashMap::new();
        for (path, entry) in &self.files {
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

    /// Sum of the sizes of all non-tombstone files.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

/// A release manifest: fragment name to fragment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub fragments: BTreeMap<String, Fragment>,
}

impl Manifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a manifest from a JSON value, folding legacy v4 key case.
    ///
    /// Repositories that predate cytrus v5 spell record fields in UpperCamel
    /// (`Files`, `Hash`, ...). Field keys are folded to lowerCamel before
    /// the shape is validated, so both spellings deserialize to the same
    /// model. Only schema positions are folded: file paths, pack hashes,
    /// and fragment names are user data and pass through untouched.
    pub fn from_json_value(value: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(normalize_release_value(value))
    }

    /// True if no fragment contains any file.
    pub fn is_empty(&self) -> bool {
        self.fragments.values().all(|f| f.files.is_empty())
    }

    pub fn fragment(&self, name: &str) -> Option<&Fragment> {
        self.fragments.get(name)
    }

    pub fn fragment_mut(&mut self, name: &str) -> &mut Fragment {
        self.fragments.entry(name.to_string()).or_default()
    }
}

/// Per-fragment size summary from the `.meta` sibling of a release manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentMeta {
    /// Total size of the fragment including shared files.
    #[serde(default)]
    pub total_size: u64,

    /// Size unique to the fragment.
    #[serde(default)]
    pub fragment_size: u64,

    /// Number of files in the fragment.
    #[serde(default)]
    pub total_files: u64,
}

/// The `.meta` document: fragment name to size summary.
pub type ReleaseMeta = BTreeMap<String, FragmentMeta>;

/// Recursively folds every object key to lowerCamelCase.
///
/// Only the first character is lowered; the repository's legacy spelling
/// differs from v5 only in leading case. Suitable for documents whose keys
/// are all schema fields or lowercase identifiers (the game list); release
/// manifests go through [`normalize_release_value`] instead, because their
/// file paths are object keys too.
pub fn fold_key_case(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (lower_first(&k), fold_key_case(v)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(fold_key_case).collect())
        }
        other => other,
    }
}

/// Folds legacy key case in a release manifest, schema positions only.
///
/// Fragment names, file paths, and pack hashes are map keys carrying user
/// data and must not be touched; only record field names are folded.
pub fn normalize_release_value(value: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(fragments) = value else {
        return value;
    };
    serde_json::Value::Object(
        fragments
            .into_iter()
            .map(|(name, fragment)| (name, normalize_fragment_value(fragment)))
            .collect(),
    )
}

fn normalize_fragment_value(value: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(fields) = value else {
        return value;
    };
    let mut out = serde_json::Map::new();
    for (key, field) in fields {
        let key = lower_first(&key);
        let field = match key.as_str() {
            // path -> file record
            "files" | "hashes" => fold_record_map(field),
            // pack hash -> pack record
            "packs" => fold_record_map(field),
            // archive path -> { files: { inner path -> record } }
            "archives" => map_object_values(field, |archive| {
                let serde_json::Value::Object(fields) = archive else {
                    return archive;
                };
                serde_json::Value::Object(
                    fields
                        .into_iter()
                        .map(|(k, v)| {
                            let k = lower_first(&k);
                            let v = if k == "files" { fold_record_map(v) } else { v };
                            (k, v)
                        })
                        .collect(),
                )
            }),
            _ => field,
        };
        out.insert(key, field);
    }
    serde_json::Value::Object(out)
}

/// Folds the field names of every record in a map, keeping the map keys.
fn fold_record_map(value: serde_json::Value) -> serde_json::Value {
    map_object_values(value, |record| match record {
        serde_json::Value::Object(fields) => serde_json::Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (lower_first(&k), v))
                .collect(),
        ),
        other => other,
    })
}

fn map_object_values(
    value: serde_json::Value,
    f: impl Fn(serde_json::Value) -> serde_json::Value,
) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, f(v))).collect())
        }
        other => other,
    }
}

/// True if the value uses legacy v4 key case anywhere a fragment would.
///
/// Detection is shallow on purpose: a `Files` key at fragment level is the
/// v4 signature, and a local manifest showing it must be rebuilt by repair.
pub fn is_legacy_key_case(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => map.values().any(|fragment| {
            fragment
                .as_object()
                .is_some_and(|f| f.contains_key("Files"))
        }),
        _ => false,
    }
}

fn lower_first(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tombstone_detection() {
        assert!(FileEntry::tombstone().is_tombstone());
        assert!(!FileEntry::new("aa", 4, false).is_tombstone());

        // A zero-size file with a hash is a real (empty) file, not a tombstone.
        let empty = FileEntry::new("da39a3ee5e6b4b0d3255bfef95601890afd80709", 0, false);
        assert!(!empty.is_tombstone());
    }

    #[test]
    fn test_manifest_round_trip_is_deterministic() {
        let mut manifest = Manifest::new();
        let fragment = manifest.fragment_mut("main");
        fragment
            .files
            .insert("b.bin".to_string(), FileEntry::new("bb", 2, false));
        fragment
            .files
            .insert("a.bin".to_string(), FileEntry::new("aa", 4, true));

        let first = serde_json::to_string(&manifest).unwrap();
        let second = serde_json::to_string(&manifest).unwrap();
        assert_eq!(first, second);

        // BTreeMap keys serialize sorted.
        assert!(first.find("a.bin").unwrap() < first.find("b.bin").unwrap());

        let parsed: Manifest = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_hash_index_groups_shared_content() {
        let mut fragment = Fragment::default();
        fragment
            .files
            .insert("a.txt".to_string(), FileEntry::new("aa", 4, false));
        fragment
            .files
            .insert("copy/a.txt".to_string(), FileEntry::new("aa", 4, false));
        fragment
            .files
            .insert("b.txt".to_string(), FileEntry::new("bb", 2, true));
        fragment
            .files
            .insert("gone.txt".to_string(), FileEntry::tombstone());

        let index = fragment.hash_index();
        assert_eq!(index.len(), 2);
        assert_eq!(index["aa"].len(), 2);
        assert_eq!(index["bb"].len(), 1);
        assert!(index["bb"][0].executable);
    }

    #[test]
    fn test_legacy_field_case_folds_on_ingest() {
        let legacy = json!({
            "configuration": {
                "Files": {
                    "conf.json": { "Hash": "aa", "Size": 4, "Executable": false }
                }
            }
        });

        let manifest = Manifest::from_json_value(legacy).unwrap();
        let entry = &manifest.fragments["configuration"].files["conf.json"];
        assert_eq!(entry.hash.as_deref(), Some("aa"));
        assert_eq!(entry.size, 4);
    }

    #[test]
    fn test_normalize_preserves_file_path_case() {
        let legacy = json!({
            "main": {
                "Files": {
                    "Dofus.exe": { "Hash": "aa", "Size": 9, "Executable": true }
                },
                "Packs": {
                    "AB12": { "Size": 100, "Hashes": ["aa"] }
                },
                "Archives": {
                    "Maps/data.d2p": {
                        "Files": { "Inner/0.dlm": { "Hash": "bb", "Size": 2 } }
                    }
                }
            }
        });

        let manifest = Manifest::from_json_value(legacy).unwrap();
        let fragment = &manifest.fragments["main"];
        assert!(fragment.files.contains_key("Dofus.exe"));
        assert!(fragment.files["Dofus.exe"].executable);
        assert!(fragment.packs.contains_key("AB12"));
        assert_eq!(fragment.packs["AB12"].hashes, vec!["aa"]);
        assert!(fragment.archives.contains_key("Maps/data.d2p"));
        assert!(fragment.archives["Maps/data.d2p"]
            .files
            .contains_key("Inner/0.dlm"));
    }

    #[test]
    fn test_legacy_key_case_detection() {
        let legacy = json!({ "configuration": { "Files": {} } });
        let current = json!({ "configuration": { "files": {} } });

        assert!(is_legacy_key_case(&legacy));
        assert!(!is_legacy_key_case(&current));
        assert!(!is_legacy_key_case(&json!(null)));
    }

    #[test]
    fn test_meta_parses_camel_case() {
        let meta: ReleaseMeta = serde_json::from_value(json!({
            "main": { "totalSize": 100, "fragmentSize": 80, "totalFiles": 3 }
        }))
        .unwrap();

        assert_eq!(meta["main"].total_size, 100);
        assert_eq!(meta["main"].fragment_size, 80);
        assert_eq!(meta["main"].total_files, 3);
    }

    #[test]
    fn test_archive_manifest_total_size() {
        let mut archive = ArchiveManifest::default();
        archive.files.insert(
            "inner/a".to_string(),
            ArchiveFileEntry {
                hash: "aa".into(),
                size: 10,
            },
        );
        archive.files.insert(
            "inner/b".to_string(),
            ArchiveFileEntry {
                hash: "bb".into(),
                size: 32,
            },
        );
        assert_eq!(archive.total_size(), 42);
    }
}
