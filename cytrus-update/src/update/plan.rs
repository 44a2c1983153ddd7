//! Action queue composition.
//!
//! The queue shape per update kind:
//!
//! ```text
//! PRE_INSTALL: GetRemoteHashes → CreateDiff[cfg] → DownloadFragment[cfg] → LoadConfiguration
//! INSTALL:     prelude → content
//! UPDATE:      prelude (+GetLocalHashes) → content
//! REPAIR:      prelude (+Repair) → content
//!
//! prelude: GetRemoteHashes → [GetLocalHashes|Repair] → CreateDiff[cfg]
//!          → DownloadFragment[cfg] → LoadConfiguration → CheckConfiguration
//!          → WriteReleaseInfos
//! content: CreateDiff[sel] → ∀f {CreateDirectories, DownloadFragment}
//!          → DeleteFiles → ClearEmptyDirectories → SaveHashes
//! ```

use std::collections::VecDeque;

use super::actions::Action;
use super::UpdateKind;
use crate::manifest::CONFIGURATION_FRAGMENT;

/// Builds the initial action queue for an update kind.
pub fn build_queue(kind: UpdateKind, fragments: &[String]) -> VecDeque<Action> {
    let mut queue = VecDeque::new();
    queue.push_back(Action::GetRemoteHashes);

    match kind {
        UpdateKind::PreInstall => {
            push_configuration_download(&mut queue);
            queue.push_back(Action::LoadConfiguration);
            return queue;
        }
        UpdateKind::Install => {}
        UpdateKind::Update => queue.push_back(Action::GetLocalHashes),
        UpdateKind::Repair => queue.push_back(Action::Repair),
    }

    push_configuration_download(&mut queue);
    queue.push_back(Action::LoadConfiguration);
    queue.push_back(Action::CheckConfiguration);
    queue.push_back(Action::WriteReleaseInfos);
    push_content(&mut queue, fragments);
    queue
}

/// Rebuilds a queue after the fragment selection changed mid-run.
///
/// Actions that survive a selection change keep their position; everything
/// else is dropped, a SaveHashes checkpoints what already landed, and the
/// content plan is rebuilt against the new selection.
pub fn rebuild_for_fragment_change(queue: &mut VecDeque<Action>, fragments: &[String]) {
    queue.retain(Action::survives_fragment_change);
    queue.push_back(Action::SaveHashes);
    push_content(queue, fragments);
}

fn push_configuration_download(queue: &mut VecDeque<Action>) {
    queue.push_back(Action::CreateDiff {
        fragments: vec![CONFIGURATION_FRAGMENT.to_string()],
    });
    queue.push_back(Action::DownloadFragment {
        fragment: CONFIGURATION_FRAGMENT.to_string(),
    });
}

fn push_content(queue: &mut VecDeque<Action>, fragments: &[String]) {
    // The configuration fragment is mandatory: keeping it in the diff
    // selection protects its files from the deselected-fragment tear-down.
    let mut selection = vec![CONFIGURATION_FRAGMENT.to_string()];
    for fragment in fragments {
        if !selection.contains(fragment) {
            selection.push(fragment.clone());
        }
    }
    queue.push_back(Action::CreateDiff {
        fragments: selection,
    });
    for fragment in fragments {
        queue.push_back(Action::CreateDirectories {
            fragment: fragment.clone(),
        });
        queue.push_back(Action::DownloadFragment {
            fragment: fragment.clone(),
        });
    }
    queue.push_back(Action::DeleteFiles);
    queue.push_back(Action::ClearEmptyDirectories);
    queue.push_back(Action::SaveHashes);
}
