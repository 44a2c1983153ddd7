//! The update steps.
//!
//! Every step of a run is a variant of [`Action`], enumerated explicitly so
//! the whole library is visible in one place. The sequencer executes actions
//! strictly in order against the shared [`UpdateContext`]; each action
//! honors the run's pause/cancel gate at its own suspension points.

mod configuration;
mod delete;
mod diff;
mod directories;
mod download;
mod hashes;
mod repair;

use crate::error::UpdateResult;
use crate::manifest::CONFIGURATION_FRAGMENT;
use crate::task::TaskGate;

use super::context::UpdateContext;

/// One step of an update run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Fetch the remote manifest (and its meta summary).
    GetRemoteHashes,
    /// Load the local manifest from the install location.
    GetLocalHashes,
    /// Rebuild the local manifest by hashing the tree.
    Repair,
    /// Reconcile local against remote for a fragment selection.
    CreateDiff { fragments: Vec<String> },
    /// Parse the downloaded configuration and refresh the selection.
    LoadConfiguration,
    /// Run the release's machine-compatibility check.
    CheckConfiguration,
    /// Record which game and release own the install location.
    WriteReleaseInfos,
    /// Pre-create the directories a fragment's files need.
    CreateDirectories { fragment: String },
    /// Download one fragment: files, packs, archive patches, permissions.
    DownloadFragment { fragment: String },
    /// Remove files the diff marked for deletion.
    DeleteFiles,
    /// Prune directories the deletions emptied.
    ClearEmptyDirectories,
    /// Persist the local manifest (and refresh licenses).
    SaveHashes,
}

impl Action {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetRemoteHashes => "GetRemoteHashes",
            Self::GetLocalHashes => "GetLocalHashes",
            Self::Repair => "Repair",
            Self::CreateDiff { .. } => "CreateDiff",
            Self::LoadConfiguration => "LoadConfiguration",
            Self::CheckConfiguration => "CheckConfiguration",
            Self::WriteReleaseInfos => "WriteReleaseInfos",
            Self::CreateDirectories { .. } => "CreateDirectories",
            Self::DownloadFragment { .. } => "DownloadFragment",
            Self::DeleteFiles => "DeleteFiles",
            Self::ClearEmptyDirectories => "ClearEmptyDirectories",
            Self::SaveHashes => "SaveHashes",
        }
    }

    /// True if a fragment-selection change leaves this queued action alone.
    ///
    /// Everything else is cleared from the queue and rebuilt against the new
    /// selection.
    pub fn survives_fragment_change(&self) -> bool {
        matches!(
            self,
            Self::GetRemoteHashes
                | Self::GetLocalHashes
                | Self::LoadConfiguration
                | Self::CheckConfiguration
                | Self::WriteReleaseInfos
        )
    }

    /// True if a fragment-selection change cancels this action while it is
    /// the one executing.
    ///
    /// Configuration-scoped work always finishes: the new selection still
    /// needs its result.
    pub fn cancelled_by_fragment_change(&self) -> bool {
        match self {
            Self::DownloadFragment { fragment } => fragment != CONFIGURATION_FRAGMENT,
            Self::CreateDiff { fragments } => {
                !fragments.iter().all(|f| f == CONFIGURATION_FRAGMENT)
            }
            _ => false,
        }
    }

    /// Executes the action against the run's context.
    pub async fn execute(
        &self,
        ctx: &mut UpdateContext,
        gate: &TaskGate,
    ) -> UpdateResult<()> {
        match self {
            Self::GetRemoteHashes => hashes::get_remote_hashes(ctx, gate).await,
            Self::GetLocalHashes => hashes::get_local_hashes(ctx, gate).await,
            Self::Repair => repair::repair(ctx, gate).await,
            Self::CreateDiff { fragments } => diff::create_diff(ctx, gate, fragments).await,
            Self::LoadConfiguration => configuration::load_configuration(ctx, gate).await,
            Self::CheckConfiguration => configuration::check_configuration(ctx, gate).await,
            Self::WriteReleaseInfos => configuration::write_release_infos(ctx, gate).await,
            Self::CreateDirectories { fragment } => {
                directories::create_directories(ctx, gate, fragment).await
            }
            Self::DownloadFragment { fragment } => {
                download::download_fragment(ctx, gate, fragment).await
            }
            Self::DeleteFiles => delete::delete_files(ctx, gate).await,
            Self::ClearEmptyDirectories => {
                directories::clear_empty_directories(ctx, gate).await
            }
            Self::SaveHashes => hashes::save_hashes(ctx, gate).await,
        }
    }
}
