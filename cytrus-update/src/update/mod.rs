//! The update engine: actions, sequencer, progress.
//!
//! An update run is a queue of actions driven to completion by the
//! [`UpdateSequencer`]. The queue composition depends on the update kind;
//! actions communicate through a typed [`UpdateContext`] and report download
//! progress through a shared [`ProgressTracker`].

pub mod actions;
mod configuration;
mod context;
mod plan;
mod progress;
mod sequencer;
mod speed;

pub use configuration::{
    ConfigurationCheck, FragmentRule, ReleaseConfiguration, CONFIGURATION_FILE,
};
pub use context::{DownloadedArchive, HashLedger, UpdateContext};
pub use plan::build_queue;
pub use progress::{FragmentProgress, ProgressTracker};
pub use sequencer::{SequencerHandle, UpdateParams, UpdateSequencer};
pub use speed::SpeedMeter;

/// What kind of run the sequencer performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    /// Download only the configuration fragment, to learn the release's
    /// shape before committing to an install.
    PreInstall,
    /// First installation into an empty location.
    Install,
    /// Reconcile an existing installation against a newer version.
    Update,
    /// Rebuild local state by hashing the tree, then reconcile.
    Repair,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::Install => "install",
            Self::Update => "update",
            Self::Repair => "repair",
        }
    }
}

/// Overall download progress of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateProgress {
    /// Bytes downloaded, including bytes from before a resume.
    pub downloaded: u64,
    /// Total bytes the run expects to download.
    pub total: u64,
    /// Current download speed in bytes per second.
    pub speed_bps: u64,
}

/// Events emitted by a sequencer over its lifetime.
///
/// One event per meaningful state change; progress events are coalesced at
/// chunk granularity by the tracker.
#[derive(Clone, Debug)]
pub enum UpdateEvent {
    /// Download progress moved.
    Progress(UpdateProgress),
    /// The run finished successfully.
    Completed,
    /// The run was cancelled.
    Cancelled,
    /// The run failed.
    Error {
        /// Stable boundary code, when the failure has one.
        code: Option<&'static str>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(UpdateKind::PreInstall.as_str(), "pre-install");
        assert_eq!(UpdateKind::Install.as_str(), "install");
        assert_eq!(UpdateKind::Update.as_str(), "update");
        assert_eq!(UpdateKind::Repair.as_str(), "repair");
    }
}
