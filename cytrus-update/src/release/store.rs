//! On-disk persistence of release state.
//!
//! Layout under the engine data root:
//!
//! ```text
//! <dataRoot>/repositories/<repoName>/<gameUid>/<releaseName>/
//!   release.json     # ReleaseState
//!   licenses.json    # [{title, text}]
//!   data/            # presentation assets (managed by the host)
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::state::{migrate, ReleaseState};
use crate::error::{UpdateError, UpdateResult};

/// State record file name.
pub const RELEASE_FILE: &str = "release.json";

/// Licenses record file name.
pub const LICENSES_FILE: &str = "licenses.json";

/// One license shipped with a release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub title: String,
    pub text: String,
}

/// Persists one release's state directory.
pub struct ReleaseStore {
    dir: PathBuf,
}

impl ReleaseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads the state record, migrating legacy shapes.
    ///
    /// Returns `None` when no record exists yet.
    pub async fn load(&self) -> UpdateResult<Option<ReleaseState>> {
        let path = self.dir.join(RELEASE_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(UpdateError::io(path, e)),
        };
        let value: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|e| UpdateError::json(RELEASE_FILE, e))?;
        let state = serde_json::from_value(migrate(value))
            .map_err(|e| UpdateError::json(RELEASE_FILE, e))?;
        Ok(Some(state))
    }

    /// Persists the state record atomically.
    pub async fn save(&self, state: &ReleaseState) -> UpdateResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UpdateError::io(&self.dir, e))?;
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| UpdateError::json(RELEASE_FILE, e))?;
        write_atomic(&self.dir.join(RELEASE_FILE), &json).await
    }

    /// Persists the licenses record.
    pub async fn save_licenses(&self, licenses: &[License]) -> UpdateResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UpdateError::io(&self.dir, e))?;
        let json = serde_json::to_vec_pretty(licenses)
            .map_err(|e| UpdateError::json(LICENSES_FILE, e))?;
        write_atomic(&self.dir.join(LICENSES_FILE), &json).await
    }

    /// Loads the licenses record, empty when absent.
    pub async fn load_licenses(&self) -> UpdateResult<Vec<License>> {
        let path = self.dir.join(LICENSES_FILE);
        match tokio::fs::read(&path).await {
            Ok(raw) => {
                serde_json::from_slice(&raw).map_err(|e| UpdateError::json(LICENSES_FILE, e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(UpdateError::io(path, e)),
        }
    }
}

/// Reads a release's licenses folder and writes `licenses.json`.
///
/// Each regular file becomes one record: the file stem is the title, the
/// contents the text. A missing folder clears nothing and writes nothing.
pub async fn refresh_licenses(source: &Path, state_dir: &Path) -> UpdateResult<()> {
    let mut entries = match tokio::fs::read_dir(source).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(UpdateError::io(source, e)),
    };

    let mut licenses = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| UpdateError::io(source, e))?
    {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(_) => continue,
        };
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        licenses.push(License { title, text });
    }
    licenses.sort_by(|a, b| a.title.cmp(&b.title));

    debug!(count = licenses.len(), "refreshing licenses record");
    ReleaseStore::new(state_dir).save_licenses(&licenses).await
}

async fn write_atomic(path: &Path, contents: &[u8]) -> UpdateResult<()> {
    let tmp = path.with_extension("json.tmp");
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
