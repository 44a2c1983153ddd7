//! Resumable, hash-verified blob downloads.
//!
//! A [`Fetcher`] downloads one content-addressed blob to a temporary part
//! file and fans the verified content out to every target path sharing that
//! hash. Downloads resume across pauses, retries, and process restarts via
//! HTTP `Range` requests against whatever bytes the part file already holds.
//!
//! Retry policy: transient transport failures (timeout, reset, broken pipe,
//! resolution, abort) are retried up to [`MAX_RETRIES`] times with a
//! per-attempt timeout growing linearly with the attempt number. Integrity
//! failures (a part larger than expected, HTTP 416, a final hash mismatch)
//! discard the part and restart from zero, consuming a retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::{StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{UpdateError, UpdateResult};
use crate::hash::sha1_of_file;
use crate::task::{ControlledTask, TaskGate};

/// Maximum retries after the initial attempt.
pub const MAX_RETRIES: u32 = 5;

/// Per-attempt timeout is this unit times `attempts + 1`.
const ATTEMPT_TIMEOUT_UNIT: Duration = Duration::from_millis(2000);

/// Progress of one fetch, emitted per received chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchProgress {
    /// Bytes in the chunk that just arrived.
    pub chunk_size: u64,
    /// Total bytes of the blob present locally after the chunk.
    pub downloaded_size: u64,
}

/// One placement destination of a fetched blob.
#[derive(Clone, Debug)]
pub struct FetchTarget {
    /// Final absolute path.
    pub path: PathBuf,
    /// Whether this target gets the executable mode on unix.
    pub executable: bool,
}

impl FetchTarget {
    pub fn new(path: impl Into<PathBuf>, executable: bool) -> Self {
        Self {
            path: path.into(),
            executable,
        }
    }
}

/// One unit of download work: a blob and the paths that want it.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    /// Content hash of the blob (lowercase hex SHA-1).
    pub hash: String,
    /// Expected size in bytes.
    pub expected_size: u64,
    /// Blob URL on the repository.
    pub url: Url,
    /// Every path that should end up holding the content.
    ///
    /// Empty targets leave the finished part file in the parts directory
    /// for the caller (packs are unpacked from there).
    pub targets: Vec<FetchTarget>,
    /// Verify the SHA-1 of the downloaded bytes against `hash`.
    pub verify: bool,
    /// Directory holding in-flight part files.
    pub parts_dir: PathBuf,
}

impl FetchRequest {
    /// Path of the part file this request downloads into.
    pub fn part_path(&self) -> PathBuf {
        self.parts_dir.join(format!("{}.tmp", self.hash))
    }
}

/// Downloads blobs over a shared HTTP client.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Spawns a fetch as a standalone controllable task.
    pub fn spawn(&self, request: FetchRequest) -> ControlledTask<u64, FetchProgress> {
        let fetcher = self.clone();
        crate::task::spawn(format!("fetch:{}", request.hash), move |controls| async move {
            let gate = controls.gate();
            let emit = |progress: FetchProgress| controls.emit(progress);
            fetcher.run(&request, &gate, &emit).await
        })
    }

    /// Downloads one blob and places it at every target.
    ///
    /// Returns the number of bytes actually transferred (zero when the part
    /// file already held the whole blob). Honors the pause gate between
    /// chunks: pausing drops the response stream, and the next attempt
    /// reopens with a `Range` for the bytes still missing. A verification
    /// mismatch discards the part and restarts from zero, sharing the same
    /// retry budget as transport failures.
    pub async fn run(
        &self,
        request: &FetchRequest,
        gate: &TaskGate,
        on_progress: &(dyn Fn(FetchProgress) + Send + Sync),
    ) -> UpdateResult<u64> {
        gate.checkpoint().await?;

        // Empty blobs never hit the network.
        if request.expected_size == 0 {
            for target in &request.targets {
                write_target(&target.path, b"").await?;
                set_permissions(&target.path, target.executable).await?;
            }
            return Ok(0);
        }

        tokio::fs::create_dir_all(&request.parts_dir)
            .await
            .map_err(|e| UpdateError::io(&request.parts_dir, e))?;

        let part = request.part_path();
        let mut retries: u32 = 0;
        let mut transferred: u64 = 0;

        loop {
            match self.download(request, &part, gate, on_progress, retries).await {
                Ok(bytes) => {
                    transferred += bytes;
                    break;
                }
                Err(UpdateError::Cancelled) => {
                    remove_quietly(&part).await;
                    return Err(UpdateError::Cancelled);
                }
                Err(err) => {
                    let retryable =
                        err.is_transient() || matches!(err, UpdateError::HashMismatch { .. });
                    if !retryable || retries >= MAX_RETRIES {
                        remove_quietly(&part).await;
                        return Err(err);
                    }
                    retries += 1;
                    warn!(
                        hash = %request.hash,
                        retries,
                        error = %err,
                        "fetch attempt failed, retrying"
                    );
                    gate.checkpoint().await?;
                }
            }
        }

        // Past this point the blob is good; cancellation no longer applies.
        self.place(request, &part).await?;
        Ok(transferred)
    }

    /// Drives attempts until the part holds the whole verified blob.
    ///
    /// Pauses consume no retries: a released stream parks on the pause gate
    /// and resumes into another ranged attempt.
    async fn download(
        &self,
        request: &FetchRequest,
        part: &Path,
        gate: &TaskGate,
        on_progress: &(dyn Fn(FetchProgress) + Send + Sync),
        retries: u32,
    ) -> UpdateResult<u64> {
        let mut transferred: u64 = 0;
        loop {
            match self.attempt(request, part, gate, on_progress, retries).await? {
                AttemptOutcome::Complete { bytes } => {
                    transferred += bytes;
                    break;
                }
                AttemptOutcome::Partial { bytes } => {
                    transferred += bytes;
                    gate.checkpoint().await?;
                }
            }
        }

        if request.verify {
            let actual = sha1_of_file(part).await?;
            if actual != request.hash {
                remove_quietly(part).await;
                return Err(UpdateError::HashMismatch {
                    hash: request.hash.clone(),
                    actual,
                });
            }
        }
        Ok(transferred)
    }

    /// One network attempt. Returns how far it got.
    async fn attempt(
        &self,
        request: &FetchRequest,
        part: &Path,
        gate: &TaskGate,
        on_progress: &(dyn Fn(FetchProgress) + Send + Sync),
        retries: u32,
    ) -> UpdateResult<AttemptOutcome> {
        let mut downloaded = part_size(part).await;
        if downloaded > request.expected_size {
            // Can't trust an oversized part.
            remove_quietly(part).await;
            downloaded = 0;
        }
        if downloaded == request.expected_size {
            return Ok(AttemptOutcome::Complete { bytes: 0 });
        }

        let attempt_timeout = ATTEMPT_TIMEOUT_UNIT * (retries + 1);
        let mut builder = self.client.get(request.url.clone());
        if downloaded > 0 {
            builder = builder.header("Range", format!("bytes={downloaded}-"));
        }

        let response = tokio::time::timeout(attempt_timeout, builder.send())
            .await
            .map_err(|_| self.transient("timeout", request))?
            .map_err(|e| self.classify(e, request))?;

        let status = response.status();
        let resuming = downloaded > 0;
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // The part does not line up with the remote blob anymore.
            remove_quietly(part).await;
            return Err(self.transient("range not satisfiable", request));
        }
        if !status.is_success() {
            return Err(UpdateError::HttpStatus {
                url: request.url.to_string(),
                status: status.as_u16(),
            });
        }

        // A server that ignored the range restarts the body from zero.
        let append = resuming && status == StatusCode::PARTIAL_CONTENT;
        if !append {
            downloaded = 0;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(part)
            .await
            .map_err(|e| UpdateError::io(part, e))?;

        let mut stream = response.bytes_stream();
        let mut bytes_this_attempt: u64 = 0;

        loop {
            if gate.is_cancelled() {
                file.flush().await.ok();
                return Err(UpdateError::Cancelled);
            }
            if gate.paused() {
                // Drop the stream; the caller parks on the pause gate and
                // resumes with a fresh ranged request.
                file.flush()
                    .await
                    .map_err(|e| UpdateError::io(part, e))?;
                file.sync_all().await.map_err(|e| UpdateError::io(part, e))?;
                return Ok(AttemptOutcome::Partial {
                    bytes: bytes_this_attempt,
                });
            }

            let next = tokio::select! {
                biased;
                _ = gate.cancelled_token().cancelled() => {
                    file.flush().await.ok();
                    return Err(UpdateError::Cancelled);
                }
                next = tokio::time::timeout(attempt_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(self.transient("read timeout", request)),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(self.classify(e, request)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| UpdateError::io(part, e))?;
            downloaded += chunk.len() as u64;
            bytes_this_attempt += chunk.len() as u64;

            on_progress(FetchProgress {
                chunk_size: chunk.len() as u64,
                downloaded_size: downloaded,
            });

            if downloaded > request.expected_size {
                return Err(self.transient("body larger than expected", request));
            }
        }

        file.flush().await.map_err(|e| UpdateError::io(part, e))?;
        file.sync_all()
            .await
            .map_err(|e| UpdateError::io(part, e))?;

        if downloaded != request.expected_size {
            return Err(self.transient(
                &format!("short body: {downloaded} of {}", request.expected_size),
                request,
            ));
        }

        Ok(AttemptOutcome::Complete {
            bytes: bytes_this_attempt,
        })
    }

    /// Moves the finished part to the first target and copies to the rest.
    async fn place(&self, request: &FetchRequest, part: &Path) -> UpdateResult<()> {
        let (first, rest) = match request.targets.split_first() {
            Some(split) => split,
            None => {
                // No targets: the blob was fetched for side use (e.g. a
                // pack); leave the part in place for the caller.
                return Ok(());
            }
        };

        if let Some(parent) = first.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::io(parent, e))?;
        }
        tokio::fs::rename(part, &first.path)
            .await
            .map_err(|e| UpdateError::io(&first.path, e))?;
        set_permissions(&first.path, first.executable).await?;

        for target in rest {
            if let Some(parent) = target.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| UpdateError::io(parent, e))?;
            }
            tokio::fs::copy(&first.path, &target.path)
                .await
                .map_err(|e| UpdateError::io(&target.path, e))?;
            set_permissions(&target.path, target.executable).await?;
        }
        Ok(())
    }

    fn transient(&self, reason: &str, request: &FetchRequest) -> UpdateError {
        UpdateError::Network {
            url: request.url.to_string(),
            attempts: 1,
            reason: reason.to_string(),
        }
    }

    fn classify(&self, error: reqwest::Error, request: &FetchRequest) -> UpdateError {
        UpdateError::Network {
            url: request.url.to_string(),
            attempts: 1,
            reason: error.to_string(),
        }
    }
}

enum AttemptOutcome {
    /// The part file now holds the whole blob.
    Complete { bytes: u64 },
    /// The stream was released for a pause; bytes so far are on disk.
    Partial { bytes: u64 },
}

/// Current size of the part file, zero if absent.
async fn part_size(part: &Path) -> u64 {
    tokio::fs::metadata(part).await.map(|m| m.len()).unwrap_or(0)
}

async fn remove_quietly(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

async fn write_target(target: &Path, contents: &[u8]) -> UpdateResult<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| UpdateError::io(parent, e))?;
    }
    tokio::fs::write(target, contents)
        .await
        .map_err(|e| UpdateError::io(target, e))
}

/// Applies the manifest permission model on unix; no-op elsewhere.
///
/// Missing files are logged and skipped so a permission fix on a file the
/// user removed does not fail the whole fragment.
pub async fn set_permissions(path: &Path, executable: bool) -> UpdateResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if executable { 0o744 } else { 0o644 };
        match tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "skipping chmod on missing file");
                Ok(())
            }
            Err(e) => Err(UpdateError::io(path, e)),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, executable);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_path_is_hash_scoped() {
        let request = FetchRequest {
            hash: "ab12".to_string(),
            expected_size: 4,
            url: Url::parse("https://repo.test/g/hashes/ab/ab12").unwrap(),
            targets: vec![FetchTarget::new("/install/a.bin", false)],
            verify: true,
            parts_dir: PathBuf::from("/install/.tmp-app-download-parts"),
        };
        assert_eq!(
            request.part_path(),
            PathBuf::from("/install/.tmp-app-download-parts/ab12.tmp")
        );
    }

    #[tokio::test]
    async fn test_empty_blob_creates_empty_targets() {
        let temp = tempfile::TempDir::new().unwrap();
        let fetcher = Fetcher::new(reqwest::Client::new());
        let request = FetchRequest {
            hash: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            expected_size: 0,
            url: Url::parse("https://repo.test/unused").unwrap(),
            targets: vec![
                FetchTarget::new(temp.path().join("one.bin"), false),
                FetchTarget::new(temp.path().join("sub/two.bin"), false),
            ],
            verify: true,
            parts_dir: temp.path().join("parts"),
        };

        let task = fetcher.spawn(request);
        task.join().await.into_result().unwrap();

        assert_eq!(tokio::fs::read(temp.path().join("one.bin")).await.unwrap(), b"");
        assert_eq!(
            tokio::fs::read(temp.path().join("sub/two.bin")).await.unwrap(),
            b""
        );
    }

    #[tokio::test]
    async fn test_part_size_of_missing_file() {
        assert_eq!(part_size(Path::new("/nonexistent/part.tmp")).await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_permissions_modes() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("bin");
        tokio::fs::write(&path, b"x").await.unwrap();

        set_permissions(&path, true).await.unwrap();
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o744);

        set_permissions(&path, false).await.unwrap();
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_permissions_missing_file_is_skipped() {
        let temp = tempfile::TempDir::new().unwrap();
        set_permissions(&temp.path().join("gone"), true).await.unwrap();
    }
}
