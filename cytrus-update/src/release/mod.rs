//! Per-release state: record, persistence, crash recovery.
//!
//! A [`Release`] wraps the persisted [`ReleaseState`] with the transitions
//! the engine performs around update runs: flagging a run in flight,
//! recording its outcome, and deciding on startup whether a crashed run
//! left work behind.

mod location;
mod state;
mod store;

pub use location::validate_install_location;
pub use state::{ReleaseState, SCHEMA_VERSION};
pub use store::{refresh_licenses, License, ReleaseStore, LICENSES_FILE, RELEASE_FILE};

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::update::UpdateKind;

/// What a crashed or dirty release needs on startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The local manifest cannot be trusted: repair.
    Repair,
    /// An update was interrupted: run it again.
    Update,
    /// A move was interrupted: resume it, skipping the installable check.
    ResumeMove,
}

/// One release with its persisted state.
pub struct Release {
    state: ReleaseState,
    store: ReleaseStore,
}

impl Release {
    /// Loads the release from its state directory, creating a fresh record
    /// when none exists.
    pub async fn open(
        store: ReleaseStore,
        game_uid: &str,
        release_name: &str,
    ) -> UpdateResult<Self> {
        let state = match store.load().await? {
            Some(state) => state,
            None => ReleaseState::new(game_uid, release_name),
        };
        Ok(Self { state, store })
    }

    pub fn state(&self) -> &ReleaseState {
        &self.state
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.store
    }

    /// Decides what a fresh start owes to the previous session.
    ///
    /// Order matters: distrust of local state (dirty, mid-repair,
    /// mid-install) outranks resuming an update, which outranks resuming a
    /// move.
    pub fn recovery_action(&self) -> Option<RecoveryAction> {
        let state = &self.state;
        if state.is_dirty
            || state.is_repairing.is_some()
            || (state.is_installing && state.location.is_some())
        {
            return Some(RecoveryAction::Repair);
        }
        if state.is_updating {
            return Some(RecoveryAction::Update);
        }
        if state.is_moving {
            return Some(RecoveryAction::ResumeMove);
        }
        None
    }

    /// Sets (or clears) the install location and persists.
    ///
    /// Clearing the location resets everything that depends on one.
    pub async fn set_location(&mut self, location: Option<PathBuf>) -> UpdateResult<()> {
        match location {
            Some(location) => self.state.location = Some(location),
            None => self.state.clear_location(),
        }
        self.store.save(&self.state).await
    }

    /// Records the repository's latest announced version.
    pub async fn set_repository_version(&mut self, version: &str) -> UpdateResult<()> {
        self.state.repository_version = Some(version.to_string());
        self.store.save(&self.state).await
    }

    /// Flags a run as in flight and persists, so a crash mid-run is
    /// detectable at the next startup.
    pub async fn begin_run(&mut self, kind: UpdateKind) -> UpdateResult<()> {
        if self.state.location.is_none() {
            return Err(UpdateError::LocationNotSet);
        }
        match kind {
            UpdateKind::Install => self.state.is_installing = true,
            UpdateKind::Update => self.state.is_updating = true,
            UpdateKind::Repair => {
                self.state.is_repairing = Some(
                    self.state
                        .repository_version
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                );
            }
            UpdateKind::PreInstall => {}
        }
        self.store.save(&self.state).await
    }

    /// Records a successful run: the version landed, local state is clean.
    pub async fn complete_run(
        &mut self,
        version: &str,
        installed_fragments: Vec<String>,
    ) -> UpdateResult<()> {
        info!(
            game = %self.state.game_uid,
            version = %version,
            "release run completed"
        );
        self.state.clear_run_flags();
        self.state.version = Some(version.to_string());
        self.state.installed_fragments = installed_fragments;
        self.state.is_dirty = false;
        self.state.update_downloaded_size = 0;
        self.state.update_downloaded_size_date = None;
        self.state.update_paused_by_user = false;
        self.store.save(&self.state).await
    }

    /// Records a failed run.
    ///
    /// The release goes dirty (next activation repairs first). A failed
    /// install also forgets its location: the half-written tree is not an
    /// installation. Returns the follow-up run the failure calls for.
    pub async fn fail_run(&mut self, error: &UpdateError) -> UpdateResult<Option<UpdateKind>> {
        warn!(
            game = %self.state.game_uid,
            error = %error,
            "release run failed"
        );
        let was_installing = self.state.is_installing;
        self.state.clear_run_flags();
        self.state.is_dirty = true;

        if was_installing {
            self.state.clear_location();
        }
        self.store.save(&self.state).await?;

        if matches!(error, UpdateError::LocalHashes { .. }) && !was_installing {
            return Ok(Some(UpdateKind::Repair));
        }
        Ok(None)
    }

    /// Records an interrupted run's progress for the next resume.
    pub async fn record_pause(
        &mut self,
        downloaded: u64,
        by_user: bool,
    ) -> UpdateResult<()> {
        self.state.update_downloaded_size = downloaded;
        self.state.update_downloaded_size_date = Some(now_ms());
        self.state.update_paused_by_user = by_user;
        self.store.save(&self.state).await
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
