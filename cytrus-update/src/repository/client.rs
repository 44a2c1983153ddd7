//! HTTP client for the cytrus repository.
//!
//! All manifest operations resolve against the repository base URL and
//! retry timeouts with exponential backoff. Requests are dispatched to the
//! DNS-cached endpoints (see [`EndpointCache`]); the host name always rides
//! along for SNI and the `Host` header, only the socket addresses rotate.

use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Url;
use tracing::{debug, warn};

use super::endpoints::EndpointCache;
use super::games::GamesList;
use crate::config::{EngineConfig, Platform};
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{fold_key_case, Manifest, ReleaseMeta};

/// The repository protocol version this client speaks.
pub const CYTRUS_VERSION: u32 = 5;

/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 2;

/// Per-attempt timeout is this unit times the attempt number.
const ATTEMPT_TIMEOUT_UNIT: Duration = Duration::from_millis(2000);

/// Bounds for the backoff interval between attempts.
const BACKOFF_MIN: Duration = Duration::from_millis(1000);
const BACKOFF_MAX: Duration = Duration::from_millis(2000);

/// Client for one cytrus repository.
pub struct RepositoryClient {
    base: Url,
    endpoints: EndpointCache,
    http: Mutex<reqwest::Client>,
}

impl RepositoryClient {
    /// Creates a client for the repository configured in `config`.
    pub fn new(config: &EngineConfig) -> UpdateResult<Self> {
        // `Url::join` treats the last path segment as a file unless the
        // base ends with a slash.
        let mut base_str = config.repository_url.clone();
        if !base_str.ends_with('/') {
            base_str.push('/');
        }
        let base = Url::parse(&base_str).map_err(|e| UpdateError::Internal {
            message: format!("invalid repository url '{}': {e}", config.repository_url),
        })?;

        let host = base
            .host_str()
            .ok_or_else(|| UpdateError::Internal {
                message: format!("repository url '{base}' has no host"),
            })?
            .to_string();
        let port = base.port_or_known_default().unwrap_or(443);

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| UpdateError::Internal {
                message: format!("failed to build http client: {e}"),
            })?;

        Ok(Self {
            base,
            endpoints: EndpointCache::new(host, port, config.dns_refresh_clamped()),
            http: Mutex::new(http),
        })
    }

    /// The endpoint cache, exposed for inspection.
    pub fn endpoints(&self) -> &EndpointCache {
        &self.endpoints
    }

    /// Returns the current HTTP client, refreshing the endpoint pins when
    /// the DNS cache has gone stale.
    pub async fn http(&self) -> reqwest::Client {
        if !self.endpoints.is_fresh() {
            let addrs = self.endpoints.refresh().await;
            if !addrs.is_empty() {
                match reqwest::Client::builder()
                    .resolve_to_addrs(self.endpoints.host(), &addrs)
                    .build()
                {
                    Ok(client) => *self.http.lock() = client,
                    Err(e) => warn!(error = %e, "failed to rebuild pinned http client"),
                }
            }
        }
        self.http.lock().clone()
    }

    /// Resolves a repository-relative path to a full URL.
    pub fn url(&self, path: &str) -> UpdateResult<Url> {
        self.base.join(path).map_err(|e| UpdateError::Internal {
            message: format!("invalid repository path '{path}': {e}"),
        })
    }

    /// GET with the retry policy; returns the successful response.
    pub async fn get(&self, path: &str) -> UpdateResult<reqwest::Response> {
        let url = self.url(path)?;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let client = self.http().await;
            let result = client
                .get(url.clone())
                .timeout(ATTEMPT_TIMEOUT_UNIT * attempt)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    return Err(UpdateError::Network {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: format!("status {}", response.status()),
                    })
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt <= MAX_RETRIES => {
                    let backoff = backoff_interval(attempt);
                    debug!(
                        url = %url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "repository request timed out, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(UpdateError::Network {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    async fn get_value(&self, path: &str) -> UpdateResult<serde_json::Value> {
        let url = self.url(path)?.to_string();
        let response = self.get(path).await?;
        response
            .json()
            .await
            .map_err(|e| UpdateError::Network {
                url,
                attempts: 1,
                reason: format!("invalid body: {e}"),
            })
    }

    /// Fetches and validates the game list (`cytrus.json`).
    pub async fn get_games_list(&self) -> UpdateResult<GamesList> {
        let value = self.get_value("cytrus.json").await?;
        parse_games_list(value)
    }

    /// Fetches the per-fragment manifest of one release version.
    pub async fn get_release(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
    ) -> UpdateResult<Manifest> {
        let path = release_path(game_uid, channel, platform, version, "json");
        let value = self.get_value(&path).await?;
        Manifest::from_json_value(value).map_err(|e| UpdateError::json(path, e))
    }

    /// Fetches the fragment size summary of one release version.
    pub async fn get_release_meta(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
    ) -> UpdateResult<ReleaseMeta> {
        let path = release_path(game_uid, channel, platform, version, "meta");
        let value = self.get_value(&path).await?;
        serde_json::from_value(value).map_err(|e| UpdateError::json(path, e))
    }

    /// Fetches the configuration-fragment-only manifest of one release.
    pub async fn get_release_config(
        &self,
        game_uid: &str,
        channel: &str,
        platform: Platform,
        version: &str,
    ) -> UpdateResult<Manifest> {
        let path = release_path(game_uid, channel, platform, version, "config");
        let value = self.get_value(&path).await?;
        Manifest::from_json_value(value).map_err(|e| UpdateError::json(path, e))
    }

    /// Opens a streaming reader for a content-addressed blob.
    pub async fn get_hash(&self, game_uid: &str, hash: &str) -> UpdateResult<reqwest::Response> {
        self.get(&blob_path(game_uid, hash)).await
    }

    /// Fetches a blob wholesale.
    pub async fn get_hash_bytes(&self, game_uid: &str, hash: &str) -> UpdateResult<bytes::Bytes> {
        let path = blob_path(game_uid, hash);
        let url = self.url(&path)?.to_string();
        let response = self.get(&path).await?;
        response.bytes().await.map_err(|e| UpdateError::Network {
            url,
            attempts: 1,
            reason: format!("body read failed: {e}"),
        })
    }

    /// Opens a streaming reader for an information payload (a tar stream
    /// addressed like any other blob).
    pub async fn get_information(
        &self,
        game_uid: &str,
        hash: &str,
    ) -> UpdateResult<reqwest::Response> {
        self.get(&blob_path(game_uid, hash)).await
    }

    /// Full URL of a content-addressed blob, for the fetcher.
    pub fn blob_url(&self, game_uid: &str, hash: &str) -> UpdateResult<Url> {
        self.url(&blob_path(game_uid, hash))
    }
}

/// Validates and parses a `cytrus.json` document.
///
/// A document without a `version` field is legacy-cased; keys are folded to
/// lowerCamelCase before the version check.
fn parse_games_list(mut value: serde_json::Value) -> UpdateResult<GamesList> {
    if value.get("version").is_none() {
        value = fold_key_case(value);
    }
    let version = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;
    if version != CYTRUS_VERSION {
        return Err(UpdateError::CytrusVersionNotHandled {
            version,
            expected: CYTRUS_VERSION,
        });
    }
    serde_json::from_value(value).map_err(|e| UpdateError::json("cytrus.json", e))
}

/// Repository-relative path of a release manifest sibling.
fn release_path(
    game_uid: &str,
    channel: &str,
    platform: Platform,
    version: &str,
    extension: &str,
) -> String {
    format!(
        "{game_uid}/releases/{channel}/{platform}/{version}.{extension}",
        platform = platform.as_str()
    )
}

/// Repository-relative path of a content-addressed blob.
///
/// Blobs shard by the first two hex characters of their hash.
fn blob_path(game_uid: &str, hash: &str) -> String {
    let shard = hash.get(..2).unwrap_or(hash);
    format!("{game_uid}/hashes/{shard}/{hash}")
}

/// Backoff before retry `attempt + 1`, clamped to the policy bounds.
fn backoff_interval(attempt: u32) -> Duration {
    let exp = BACKOFF_MIN * 2u32.saturating_pow(attempt.saturating_sub(1));
    exp.clamp(BACKOFF_MIN, BACKOFF_MAX)
}
