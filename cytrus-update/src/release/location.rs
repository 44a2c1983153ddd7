//! Install-location preflight checks.
//!
//! Run before an install or move commits to a directory. Each failure maps
//! to one of the boundary error codes the host surfaces to the user.

use std::path::Path;

use sysinfo::Disks;

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::RELEASE_INFOS_FILE;

/// Validates a prospective install location.
///
/// The directory must exist, must not already hold a game, must be empty,
/// must be writable, and the volume must have `required_space` bytes free.
pub async fn validate_install_location(path: &Path, required_space: u64) -> UpdateResult<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| UpdateError::LocationNotFound {
            path: path.to_path_buf(),
        })?;
    if !metadata.is_dir() {
        return Err(UpdateError::LocationNotFound {
            path: path.to_path_buf(),
        });
    }

    if path.join(RELEASE_INFOS_FILE).is_file() {
        return Err(UpdateError::LocationIsAGameDirectory {
            path: path.to_path_buf(),
        });
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| UpdateError::io(path, e))?;
    if entries
        .next_entry()
        .await
        .map_err(|e| UpdateError::io(path, e))?
        .is_some()
    {
        return Err(UpdateError::LocationNotEmpty {
            path: path.to_path_buf(),
        });
    }

    check_writable(path).await?;
    check_free_space(path, required_space)?;
    Ok(())
}

/// Verifies the location accepts writes by probing with a scratch file.
async fn check_writable(path: &Path) -> UpdateResult<()> {
    let probe = path.join(".cytrus-write-probe");
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            Ok(())
        }
        Err(_) => Err(UpdateError::UserPermissions {
            path: path.to_path_buf(),
        }),
    }
}

/// Compares the hosting volume's free space against the requirement.
fn check_free_space(path: &Path, required_space: u64) -> UpdateResult<()> {
    if required_space == 0 {
        return Ok(());
    }

    let disks = Disks::new_with_refreshed_list();
    let available = disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space());

    match available {
        Some(available) if available < required_space => Err(UpdateError::NotEnoughSpace {
            required: required_space,
            available,
        }),
        // No matching mount means we cannot tell; let the write fail loudly
        // later rather than blocking on a guess.
        _ => Ok(()),
    }
}
