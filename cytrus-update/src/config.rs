//! Engine configuration.
//!
//! This module defines [`EngineConfig`], the top-level configuration handed
//! to the engine by the host application. It combines the repository
//! endpoint, platform identity, and on-disk layout roots so that every
//! component is configured consistently.

use std::path::PathBuf;
use std::time::Duration;

/// Default lower clamp for the DNS cache refresh interval.
pub const DNS_REFRESH_MIN: Duration = Duration::from_secs(30);

/// Default upper clamp for the DNS cache refresh interval.
pub const DNS_REFRESH_MAX: Duration = Duration::from_secs(300);

/// The platform a release is installed for.
///
/// Spelled the way the repository spells it in manifest paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Darwin,
    Linux,
}

impl Platform {
    /// The platform the engine was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Darwin
        } else {
            Self::Linux
        }
    }

    /// The path segment used in release manifest URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Darwin => "darwin",
            Self::Linux => "linux",
        }
    }

    /// Whether file modes carry an executable bit on this platform.
    pub fn tracks_permissions(&self) -> bool {
        !matches!(self, Self::Windows)
    }
}

/// Top-level engine configuration.
///
/// Passed explicitly to every component that needs it; the engine keeps no
/// global state.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base URL of the cytrus repository, e.g. `https://cytrus.cdn.example.com`.
    pub repository_url: String,

    /// Short name of the repository, used in the state directory layout.
    pub repository_name: String,

    /// Application name, used to derive the download scratch directory.
    pub app_name: String,

    /// Platform identity used when requesting release manifests.
    pub platform: Platform,

    /// Root of the per-release state directories.
    pub data_root: PathBuf,

    /// Whether pre-released games are merged into the polled game list.
    pub pre_release: bool,

    /// DNS cache refresh interval, clamped to [`DNS_REFRESH_MIN`]..=[`DNS_REFRESH_MAX`].
    pub dns_refresh: Duration,
}

impl EngineConfig {
    /// Create a configuration with defaults for everything but the
    /// repository endpoint and the data root.
    pub fn new(
        repository_url: impl Into<String>,
        repository_name: impl Into<String>,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository_url: repository_url.into(),
            repository_name: repository_name.into(),
            app_name: "cytrus-update".to_string(),
            platform: Platform::current(),
            data_root: data_root.into(),
            pre_release: false,
            dns_refresh: Duration::from_secs(120),
        }
    }

    /// Set the application name (builder pattern).
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the platform (builder pattern).
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Enable or disable pre-release game visibility (builder pattern).
    pub fn with_pre_release(mut self, pre_release: bool) -> Self {
        self.pre_release = pre_release;
        self
    }

    /// The DNS refresh interval after clamping.
    pub fn dns_refresh_clamped(&self) -> Duration {
        self.dns_refresh.clamp(DNS_REFRESH_MIN, DNS_REFRESH_MAX)
    }

    /// Name of the scratch directory for partially downloaded blobs,
    /// created inside the install location while a download runs.
    pub fn download_parts_dir(&self) -> String {
        format!(".tmp-{}-download-parts", self.app_name)
    }

    /// State directory for one release.
    pub fn release_state_dir(&self, game_uid: &str, release: &str) -> PathBuf {
        self.data_root
            .join("repositories")
            .join(&self.repository_name)
            .join(game_uid)
            .join(release)
    }
}
