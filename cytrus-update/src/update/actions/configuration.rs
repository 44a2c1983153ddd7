//! Configuration-driven steps: load, check, record identity.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{self, ReleaseInfos};
use crate::task::TaskGate;
use crate::update::configuration::ReleaseConfiguration;
use crate::update::context::UpdateContext;

/// Upper bound on the validator script's runtime.
const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Parses the downloaded configuration and refreshes the selection.
///
/// Replacing `ctx.fragments` is the signal the sequencer watches for: a
/// changed selection rebuilds the remaining queue.
pub(super) async fn load_configuration(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
) -> UpdateResult<()> {
    gate.checkpoint().await?;

    let Some(configuration) = ReleaseConfiguration::read(&ctx.location).await? else {
        debug!("release ships no configuration file, keeping selection");
        return Ok(());
    };

    let selection = configuration.select_fragments(&ctx.fragments);
    if selection != ctx.fragments {
        info!(
            previous = ?ctx.fragments,
            selected = ?selection,
            "configuration changed the fragment selection"
        );
        ctx.fragments = selection;
    }
    ctx.configuration = Some(configuration);
    Ok(())
}

/// Runs the release's validator script, if it ships one.
///
/// The script's exit code indexes the configuration's results table; a hit
/// fails the run with that message.
pub(super) async fn check_configuration(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
) -> UpdateResult<()> {
    gate.checkpoint().await?;

    let Some(check) = ctx.configuration.as_ref().and_then(|c| c.check.clone()) else {
        return Ok(());
    };

    let command_path = ctx.location.join(&check.command);
    debug!(command = %command_path.display(), "running configuration check");

    let output = tokio::time::timeout(
        CHECK_TIMEOUT,
        tokio::process::Command::new(&command_path)
            .args(&check.args)
            .current_dir(&ctx.location)
            .output(),
    )
    .await
    .map_err(|_| UpdateError::BadConfiguration {
        message: format!("validator '{}' timed out", check.command),
    })?
    .map_err(|e| UpdateError::BadConfiguration {
        message: format!("validator '{}' failed to run: {e}", check.command),
    })?;

    let code = output.status.code().unwrap_or(-1);
    if let Some(message) = check.results.get(&code.to_string()) {
        return Err(UpdateError::BadConfiguration {
            message: message.clone(),
        });
    }
    debug!(code, "configuration check passed");
    Ok(())
}

/// Writes `.release.infos.json` so the tree knows which release owns it.
pub(super) async fn write_release_infos(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
) -> UpdateResult<()> {
    gate.checkpoint().await?;
    manifest::write_release_infos(
        &ctx.location,
        &ReleaseInfos {
            game_uid: ctx.game_uid.clone(),
            release: ctx.release_name.clone(),
        },
    )
    .await
}
