//! Local manifest persistence.
//!
//! The installed tree carries two metadata files at its root:
//! `.release.hashes.json` (the local manifest, exactly the files the engine
//! believes are present) and `.release.infos.json` (which game and release
//! the tree belongs to). Both are written atomically: the content goes to a
//! temporary sibling first, then a rename swaps it in.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::Manifest;
use crate::error::{UpdateError, UpdateResult};

/// File name of the local manifest at the install location root.
pub const LOCAL_HASHES_FILE: &str = ".release.hashes.json";

/// File name of the release identity record at the install location root.
pub const RELEASE_INFOS_FILE: &str = ".release.infos.json";

/// Identity of the release installed in a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfos {
    pub game_uid: String,
    pub release: String,
}

/// Reads the local manifest from an install location.
///
/// Fails with [`UpdateError::LocalHashes`] when the file is missing,
/// unparsable, or written in the legacy v4 key case; all three conditions
/// mean the local state cannot be trusted and a repair must rebuild it.
pub async fn read_local_manifest(location: &Path) -> UpdateResult<Manifest> {
    let path = location.join(LOCAL_HASHES_FILE);

    let raw = tokio::fs::read(&path).await.map_err(|e| {
        UpdateError::LocalHashes {
            reason: format!("{}: {}", path.display(), e),
        }
    })?;

    let value: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| UpdateError::LocalHashes {
            reason: format!("{}: {}", path.display(), e),
        })?;

    if super::is_legacy_key_case(&value) {
        return Err(UpdateError::LocalHashes {
            reason: format!("{}: legacy v4 key case", path.display()),
        });
    }

    serde_json::from_value(value).map_err(|e| UpdateError::LocalHashes {
        reason: format!("{}: {}", path.display(), e),
    })
}

/// Writes the local manifest atomically.
///
/// Writing the same manifest twice produces bytewise-identical files, so a
/// redundant save is a disk-level no-op apart from the rename.
pub async fn write_local_manifest(location: &Path, manifest: &Manifest) -> UpdateResult<()> {
    let path = location.join(LOCAL_HASHES_FILE);
    let json = serde_json::to_vec(manifest)
        .map_err(|e| UpdateError::json(LOCAL_HASHES_FILE, e))?;
    write_atomic(&path, &json).await
}

/// Writes the release identity record atomically.
pub async fn write_release_infos(location: &Path, infos: &ReleaseInfos) -> UpdateResult<()> {
    let path = location.join(RELEASE_INFOS_FILE);
    let json = serde_json::to_vec(infos)
        .map_err(|e| UpdateError::json(RELEASE_INFOS_FILE, e))?;
    write_atomic(&path, &json).await
}

/// Reads the release identity record, if present.
pub async fn read_release_infos(location: &Path) -> UpdateResult<Option<ReleaseInfos>> {
    let path = location.join(RELEASE_INFOS_FILE);
    match tokio::fs::read(&path).await {
        Ok(raw) => {
            let infos = serde_json::from_slice(&raw)
                .map_err(|e| UpdateError::json(RELEASE_INFOS_FILE, e))?;
            Ok(Some(infos))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(UpdateError::io(path, e)),
    }
}

/// Write-to-temp-then-rename, so readers never observe a torn file.
async fn write_atomic(path: &Path, contents: &[u8]) -> UpdateResult<()> {
    let tmp: PathBuf = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| UpdateError::io(&tmp, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| UpdateError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| UpdateError::io(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| UpdateError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileEntry;
    use tempfile::TempDir;

    fn sample_manifest() -> Manifest {
        let mut manifest = Manifest::new();
        manifest
            .fragment_mut("main")
            .files
            .insert("a.bin".to_string(), FileEntry::new("aa", 4, false));
        manifest
    }

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let temp = TempDir::new().unwrap();
        let manifest = sample_manifest();

        write_local_manifest(temp.path(), &manifest).await.unwrap();
        let loaded = read_local_manifest(temp.path()).await.unwrap();

        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn test_rewrite_is_bytewise_identical() {
        let temp = TempDir::new().unwrap();
        let manifest = sample_manifest();
        let path = temp.path().join(LOCAL_HASHES_FILE);

        write_local_manifest(temp.path(), &manifest).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();

        write_local_manifest(temp.path(), &manifest).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_local_hashes_error() {
        let temp = TempDir::new().unwrap();
        let err = read_local_manifest(temp.path()).await.unwrap_err();
        assert_eq!(err.code(), Some("LOCAL_HASHES_ERROR"));
    }

    #[tokio::test]
    async fn test_legacy_case_is_local_hashes_error() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(
            temp.path().join(LOCAL_HASHES_FILE),
            br#"{ "configuration": { "Files": {} } }"#,
        )
        .await
        .unwrap();

        let err = read_local_manifest(temp.path()).await.unwrap_err();
        assert_eq!(err.code(), Some("LOCAL_HASHES_ERROR"));
        assert!(err.to_string().contains("legacy"));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_local_hashes_error() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join(LOCAL_HASHES_FILE), b"{ not json")
            .await
            .unwrap();

        let err = read_local_manifest(temp.path()).await.unwrap_err();
        assert_eq!(err.code(), Some("LOCAL_HASHES_ERROR"));
    }

    #[tokio::test]
    async fn test_release_infos_round_trip() {
        let temp = TempDir::new().unwrap();
        let infos = ReleaseInfos {
            game_uid: "dofus".to_string(),
            release: "main".to_string(),
        };

        assert!(read_release_infos(temp.path()).await.unwrap().is_none());

        write_release_infos(temp.path(), &infos).await.unwrap();
        let loaded = read_release_infos(temp.path()).await.unwrap();
        assert_eq!(loaded, Some(infos));
    }
}
