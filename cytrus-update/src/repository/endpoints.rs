//! DNS-cached endpoint rotation.
//!
//! The repository host usually resolves to several frontends. Resolving once
//! per request would hammer the resolver and pin every request to whatever
//! the OS returns first, so the cache resolves the host, remembers the
//! answers until a refresh deadline, and hands out a freshly shuffled list
//! on each refresh. On resolution failure the last-known set is retained;
//! a repository that was reachable stays reachable through a resolver blip.
//!
//! The system resolver exposes no record TTLs, so the refresh interval is
//! configuration-driven and clamped to the same bounds a TTL would be.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

struct CacheState {
    addrs: Vec<SocketAddr>,
    refreshed_at: Option<Instant>,
}

/// Cached DNS answers for one host.
pub struct EndpointCache {
    host: String,
    port: u16,
    refresh: Duration,
    state: Mutex<CacheState>,
}

impl EndpointCache {
    /// Creates an empty cache for `host:port`.
    ///
    /// `refresh` should already be clamped by the caller
    /// (see [`crate::config::EngineConfig::dns_refresh_clamped`]).
    pub fn new(host: impl Into<String>, port: u16, refresh: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            refresh,
            state: Mutex::new(CacheState {
                addrs: Vec::new(),
                refreshed_at: None,
            }),
        }
    }

    /// The host this cache resolves.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the cached addresses, refreshing them when stale.
    ///
    /// The returned list is shuffled so that callers distributing requests
    /// in list order still spread load uniformly across frontends.
    pub async fn addrs(&self) -> Vec<SocketAddr> {
        if self.is_fresh() {
            return self.current();
        }
        self.refresh().await
    }

    /// True if another refresh is not due yet.
    pub fn is_fresh(&self) -> bool {
        let state = self.state.lock();
        state
            .refreshed_at
            .is_some_and(|at| at.elapsed() < self.refresh)
    }

    /// The current set without refreshing.
    pub fn current(&self) -> Vec<SocketAddr> {
        self.state.lock().addrs.clone()
    }

    /// Forces a resolution now.
    ///
    /// On failure the previous answers are kept and returned.
    pub async fn refresh(&self) -> Vec<SocketAddr> {
        match tokio::net::lookup_host((self.host.as_str(), self.port)).await {
            Ok(resolved) => {
                let mut addrs: Vec<SocketAddr> = resolved.collect();
                if addrs.is_empty() {
                    warn!(host = %self.host, "resolver returned no answers, keeping cached set");
                    return self.touch_and_current();
                }
                addrs.shuffle(&mut rand::thread_rng());
                debug!(host = %self.host, count = addrs.len(), "refreshed endpoint cache");
                let mut state = self.state.lock();
                state.addrs = addrs.clone();
                state.refreshed_at = Some(Instant::now());
                addrs
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "dns resolution failed, keeping cached set");
                self.touch_and_current()
            }
        }
    }

    /// Picks one cached address uniformly at random.
    pub fn pick(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state.addrs.choose(&mut rand::thread_rng()).copied()
    }

    fn touch_and_current(&self) -> Vec<SocketAddr> {
        // Push the deadline out even on failure; retrying the resolver on
        // every request would turn one outage into a request-rate outage.
        let mut state = self.state.lock();
        state.refreshed_at = Some(Instant::now());
        state.addrs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localhost_resolves() {
        let cache = EndpointCache::new("localhost", 8080, Duration::from_secs(60));
        let addrs = cache.addrs().await;
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 8080));
        assert!(cache.is_fresh());
    }

    #[tokio::test]
    async fn test_failed_resolution_retains_previous_set() {
        let cache = EndpointCache::new("localhost", 8080, Duration::from_millis(0));
        let first = cache.addrs().await;
        assert!(!first.is_empty());

        // Swap in an unresolvable host; the cached answers must survive.
        let poisoned = EndpointCache {
            host: "host.invalid.".to_string(),
            port: 8080,
            refresh: Duration::from_millis(0),
            state: Mutex::new(CacheState {
                addrs: first.clone(),
                refreshed_at: Some(Instant::now()),
            }),
        };
        let after = poisoned.refresh().await;
        assert_eq!(after, first);
    }

    #[tokio::test]
    async fn test_pick_from_empty_cache() {
        let cache = EndpointCache::new("host.invalid.", 443, Duration::from_secs(60));
        assert!(cache.pick().is_none());
    }

    #[tokio::test]
    async fn test_pick_returns_cached_addr() {
        let cache = EndpointCache::new("localhost", 443, Duration::from_secs(60));
        cache.refresh().await;
        let picked = cache.pick().unwrap();
        assert!(cache.current().contains(&picked));
    }
}
