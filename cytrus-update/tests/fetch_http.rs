//! Fetcher behavior against a live local server.

mod support;

use std::path::Path;

use tempfile::TempDir;

use cytrus_update::error::UpdateError;
use cytrus_update::fetch::{FetchRequest, FetchTarget, Fetcher};
use cytrus_update::hash::sha1_hex;
use cytrus_update::Outcome;
use support::FixtureRepo;

const GAME: &str = "dofus";

fn request_for(
    repo: &FixtureRepo,
    hash: &str,
    size: usize,
    targets: Vec<FetchTarget>,
    parts_dir: &Path,
) -> FetchRequest {
    let shard = &hash[..2];
    FetchRequest {
        hash: hash.to_string(),
        expected_size: size as u64,
        url: reqwest::Url::parse(&format!(
            "{}/{GAME}/hashes/{shard}/{hash}",
            repo.url()
        ))
        .unwrap(),
        targets,
        verify: true,
        parts_dir: parts_dir.to_path_buf(),
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn download_places_and_verifies() {
    let repo = FixtureRepo::start().await;
    let temp = TempDir::new().unwrap();

    let body = pattern(100_000);
    let hash = repo.put_blob(GAME, body.clone());

    let request = request_for(
        &repo,
        &hash,
        body.len(),
        vec![FetchTarget::new(temp.path().join("out.bin"), false)],
        &temp.path().join("parts"),
    );

    let task = Fetcher::new(reqwest::Client::new()).spawn(request);
    let transferred = task.join().await.into_result().unwrap();

    assert_eq!(transferred, body.len() as u64);
    let on_disk = tokio::fs::read(temp.path().join("out.bin")).await.unwrap();
    assert_eq!(sha1_hex(&on_disk), hash);
    // Part file consumed by the final rename.
    assert!(!temp.path().join("parts").join(format!("{hash}.tmp")).exists());
}

#[tokio::test]
async fn partial_part_resumes_with_range() {
    let repo = FixtureRepo::start().await;
    let temp = TempDir::new().unwrap();
    let parts_dir = temp.path().join("parts");
    tokio::fs::create_dir_all(&parts_dir).await.unwrap();

    let body = pattern(200_000);
    let hash = repo.put_blob(GAME, body.clone());

    // A previous run left the first 50 KB behind.
    tokio::fs::write(parts_dir.join(format!("{hash}.tmp")), &body[..50_000])
        .await
        .unwrap();

    let request = request_for(
        &repo,
        &hash,
        body.len(),
        vec![FetchTarget::new(temp.path().join("out.bin"), false)],
        &parts_dir,
    );
    let task = Fetcher::new(reqwest::Client::new()).spawn(request);
    let transferred = task.join().await.into_result().unwrap();

    // Only the missing tail crossed the wire.
    assert_eq!(transferred, 150_000);
    let on_disk = tokio::fs::read(temp.path().join("out.bin")).await.unwrap();
    assert_eq!(on_disk, body);

    let ranged: Vec<_> = repo
        .hits_containing(&hash)
        .into_iter()
        .filter_map(|h| h.range)
        .collect();
    assert_eq!(ranged, vec!["bytes=50000-".to_string()]);
}

#[tokio::test]
async fn oversized_part_restarts_from_zero() {
    let repo = FixtureRepo::start().await;
    let temp = TempDir::new().unwrap();
    let parts_dir = temp.path().join("parts");
    tokio::fs::create_dir_all(&parts_dir).await.unwrap();

    let body = pattern(10_000);
    let hash = repo.put_blob(GAME, body.clone());

    // A stale part larger than the blob cannot be resumed.
    tokio::fs::write(parts_dir.join(format!("{hash}.tmp")), pattern(20_000))
        .await
        .unwrap();

    let request = request_for(
        &repo,
        &hash,
        body.len(),
        vec![FetchTarget::new(temp.path().join("out.bin"), false)],
        &parts_dir,
    );
    let task = Fetcher::new(reqwest::Client::new()).spawn(request);
    task.join().await.into_result().unwrap();

    let on_disk = tokio::fs::read(temp.path().join("out.bin")).await.unwrap();
    assert_eq!(on_disk, body);
    // The restart fetched the whole blob, no range.
    let hits = repo.hits_containing(&hash);
    assert_eq!(hits.len(), 1);
    assert!(hits[0].range.is_none());
}

#[tokio::test]
async fn corrupted_blob_exhausts_retries_with_hash_mismatch() {
    let repo = FixtureRepo::start().await;
    let temp = TempDir::new().unwrap();

    // The path advertises one hash, the body hashes to another.
    let advertised = sha1_hex(b"what the manifest promised");
    let body = b"what the server actually has".to_vec();
    let shard = advertised[..2].to_string();
    repo.put(&format!("{GAME}/hashes/{shard}/{advertised}"), body.clone());

    let request = request_for(
        &repo,
        &advertised,
        body.len(),
        vec![FetchTarget::new(temp.path().join("out.bin"), false)],
        &temp.path().join("parts"),
    );
    let task = Fetcher::new(reqwest::Client::new()).spawn(request);

    match task.join().await {
        Outcome::Rejected(err) => {
            assert_eq!(err.code(), Some("FETCH_HASH_MISMATCH"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Initial attempt plus the full retry budget.
    assert_eq!(
        repo.hits_containing(&advertised).len(),
        (cytrus_update::fetch::MAX_RETRIES + 1) as usize
    );
    assert!(!temp.path().join("out.bin").exists());
    assert!(!temp
        .path()
        .join("parts")
        .join(format!("{advertised}.tmp"))
        .exists());
}

#[tokio::test]
async fn missing_blob_fails_without_retries() {
    let repo = FixtureRepo::start().await;
    let temp = TempDir::new().unwrap();

    let hash = sha1_hex(b"never uploaded");
    let request = request_for(
        &repo,
        &hash,
        14,
        vec![FetchTarget::new(temp.path().join("out.bin"), false)],
        &temp.path().join("parts"),
    );
    let task = Fetcher::new(reqwest::Client::new()).spawn(request);

    match task.join().await {
        Outcome::Rejected(UpdateError::HttpStatus { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected http status rejection, got {other:?}"),
    }
    // A client error is not worth retrying.
    assert_eq!(repo.hits_containing(&hash).len(), 1);
}

#[tokio::test]
async fn shared_hash_fans_out_to_every_target() {
    let repo = FixtureRepo::start().await;
    let temp = TempDir::new().unwrap();

    let body = b"shared bytes".to_vec();
    let hash = repo.put_blob(GAME, body.clone());

    let request = request_for(
        &repo,
        &hash,
        body.len(),
        vec![
            FetchTarget::new(temp.path().join("first/copy.bin"), false),
            FetchTarget::new(temp.path().join("second/copy.bin"), true),
        ],
        &temp.path().join("parts"),
    );
    let task = Fetcher::new(reqwest::Client::new()).spawn(request);
    task.join().await.into_result().unwrap();

    assert_eq!(
        tokio::fs::read(temp.path().join("first/copy.bin")).await.unwrap(),
        body
    );
    assert_eq!(
        tokio::fs::read(temp.path().join("second/copy.bin")).await.unwrap(),
        body
    );
    // One download serves both targets.
    assert_eq!(repo.hits_containing(&hash).len(), 1);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let first = tokio::fs::metadata(temp.path().join("first/copy.bin"))
            .await
            .unwrap();
        let second = tokio::fs::metadata(temp.path().join("second/copy.bin"))
            .await
            .unwrap();
        assert_eq!(first.permissions().mode() & 0o777, 0o644);
        assert_eq!(second.permissions().mode() & 0o777, 0o744);
    }
}
