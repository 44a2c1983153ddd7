//! The per-release update sequencer.
//!
//! A sequencer drives one action queue to completion as a controllable
//! task. It owns the current action exclusively, forwards pause/resume/stop
//! to it through the shared gate, saves the local manifest every ten
//! seconds while active, and rebuilds the remaining queue whenever the
//! fragment selection changes mid-run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actions::Action;
use super::context::{HashLedger, UpdateContext};
use super::plan;
use super::progress::ProgressTracker;
use super::{UpdateEvent, UpdateKind};
use crate::config::EngineConfig;
use crate::error::{UpdateError, UpdateResult};
use crate::repository::RepositoryClient;
use crate::task::{self, ControlHandle, TaskGate, TaskState};

/// Interval of the periodic local-manifest save.
const SAVE_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Inputs of one sequencer run.
#[derive(Clone)]
pub struct UpdateParams {
    pub config: EngineConfig,
    pub client: Arc<RepositoryClient>,
    pub game_uid: String,
    pub release_name: String,
    pub version: String,
    pub location: PathBuf,
    pub kind: UpdateKind,
    pub fragments: Vec<String>,
    /// Bytes downloaded by earlier runs of this update, for the progress
    /// carry-over.
    pub already_downloaded: u64,
}

/// Handle to a running (or settled) sequencer.
///
/// Clones steer the same run. Owners forward pause/resume/stop, subscribe
/// to lifecycle events, and push fragment-selection changes.
#[derive(Clone)]
pub struct SequencerHandle {
    control: ControlHandle<()>,
    events: broadcast::Sender<UpdateEvent>,
    selection: watch::Sender<Vec<String>>,
}

impl SequencerHandle {
    /// Assembles a handle from its channels.
    ///
    /// Used by [`UpdateSequencer::spawn`]; exposed so schedulers can be
    /// exercised against stub runs.
    pub fn new(
        control: ControlHandle<()>,
        events: broadcast::Sender<UpdateEvent>,
        selection: watch::Sender<Vec<String>>,
    ) -> Self {
        Self {
            control,
            events,
            selection,
        }
    }

    /// Pauses the run at its next suspension point.
    pub async fn pause(&self) -> UpdateResult<()> {
        self.control.pause().await
    }

    /// Resumes a paused run.
    pub async fn resume(&self) -> UpdateResult<()> {
        self.control.resume().await
    }

    /// Stops the run. Queued actions are discarded; a final `Cancelled`
    /// event is emitted once the current action quiesces.
    pub async fn stop(&self) -> UpdateResult<()> {
        self.control.cancel().await
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    /// Pushes a new fragment selection into the run.
    ///
    /// A selection identical to the current one is ignored; the run only
    /// rebuilds its queue on an actual change.
    pub fn set_fragments(&self, fragments: Vec<String>) {
        self.selection.send_if_modified(|current| {
            if *current == fragments {
                return false;
            }
            *current = fragments;
            true
        });
    }

    /// Current task state of the run.
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    /// True once the run has settled.
    pub fn is_settled(&self) -> bool {
        self.control.is_settled()
    }

    /// Resolves when the run settles.
    pub async fn settled(&self) {
        self.control.settled().await
    }
}

/// The per-release action sequencer.
pub struct UpdateSequencer;

impl UpdateSequencer {
    /// Spawns a run and returns its handle.
    pub fn spawn(params: UpdateParams) -> SequencerHandle {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let progress = Arc::new(ProgressTracker::new(events.clone()));
        progress.set_already_downloaded(params.already_downloaded);
        let (selection_tx, selection_rx) = watch::channel(params.fragments.clone());

        let mut ctx = UpdateContext {
            config: params.config,
            client: params.client,
            game_uid: params.game_uid.clone(),
            release_name: params.release_name.clone(),
            version: params.version,
            location: params.location,
            kind: params.kind,
            fragments: params.fragments,
            remote_manifest: None,
            remote_meta: None,
            diff: None,
            configuration: None,
            ledger: Arc::new(HashLedger::new()),
            progress,
        };

        let name = format!(
            "sequencer:{}:{}:{}",
            params.game_uid,
            params.release_name,
            params.kind.as_str()
        );
        let events_in_task = events.clone();
        let task = task::spawn(name, move |controls| async move {
            let gate = controls.gate();
            let result = run(&mut ctx, &gate, selection_rx).await;
            match &result {
                Ok(()) => {
                    info!(game = %ctx.game_uid, "update completed");
                    let _ = events_in_task.send(UpdateEvent::Completed);
                }
                Err(UpdateError::Cancelled) => {
                    info!(game = %ctx.game_uid, "update cancelled");
                    let _ = events_in_task.send(UpdateEvent::Cancelled);
                }
                Err(e) => {
                    warn!(game = %ctx.game_uid, error = %e, "update failed");
                    let _ = events_in_task.send(UpdateEvent::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                }
            }
            result
        });

        SequencerHandle::new(task.handle(), events, selection_tx)
    }
}

/// Runs the queue, bracketed by the periodic-save worker.
async fn run(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
    selection_rx: watch::Receiver<Vec<String>>,
) -> UpdateResult<()> {
    info!(
        kind = ctx.kind.as_str(),
        game = %ctx.game_uid,
        version = %ctx.version,
        fragments = ?ctx.fragments,
        "sequencer starting"
    );

    let saver_cancel = CancellationToken::new();
    let saver = tokio::spawn(periodic_save(
        ctx.ledger.clone(),
        ctx.location.clone(),
        gate.clone(),
        saver_cancel.clone(),
    ));

    let result = drive(ctx, gate, selection_rx).await;

    // The saver finishes its in-flight write before we settle, so no save
    // ever lands after the outcome is observable.
    saver_cancel.cancel();
    let _ = saver.await;
    result
}

/// Executes actions in order, rebuilding the queue on selection changes.
async fn drive(
    ctx: &mut UpdateContext,
    gate: &TaskGate,
    mut selection_rx: watch::Receiver<Vec<String>>,
) -> UpdateResult<()> {
    let mut queue = plan::build_queue(ctx.kind, &ctx.fragments);
    let mut planned = ctx.fragments.clone();
    let mut selection_open = true;

    while let Some(action) = queue.pop_front() {
        // Selection changes that arrived between actions.
        if selection_open && selection_rx.has_changed().unwrap_or(false) {
            let selection = selection_rx.borrow_and_update().clone();
            if selection != ctx.fragments {
                queue.push_front(action);
                apply_fragment_change(ctx, &mut queue, &mut planned, selection);
                continue;
            }
        }

        debug!(action = action.name(), "executing action");
        let outcome = {
            let fut = action.execute(ctx, gate);
            tokio::pin!(fut);
            loop {
                tokio::select! {
                    biased;
                    changed = selection_rx.changed(),
                        if selection_open && action.cancelled_by_fragment_change() =>
                    {
                        match changed {
                            Ok(()) => break ExecOutcome::SelectionChanged,
                            Err(_) => selection_open = false,
                        }
                    }
                    result = &mut fut => break ExecOutcome::Done(result),
                }
            }
        };

        match outcome {
            ExecOutcome::Done(result) => {
                result?;
                // LoadConfiguration replaces the selection in place; the
                // queue was built for the previous one.
                if ctx.kind != UpdateKind::PreInstall && ctx.fragments != planned {
                    let selection = ctx.fragments.clone();
                    apply_fragment_change(ctx, &mut queue, &mut planned, selection);
                }
            }
            ExecOutcome::SelectionChanged => {
                let selection = selection_rx.borrow_and_update().clone();
                if selection == ctx.fragments {
                    // Nothing actually changed; rerun the interrupted
                    // action (its part files are still there to resume).
                    queue.push_front(action);
                } else {
                    info!(
                        action = action.name(),
                        "action cancelled by fragment change"
                    );
                    // The dropped action cannot clean up its scratch space.
                    let _ = tokio::fs::remove_dir_all(ctx.parts_dir()).await;
                    apply_fragment_change(ctx, &mut queue, &mut planned, selection);
                }
            }
        }
        gate.checkpoint().await?;
    }
    Ok(())
}

enum ExecOutcome {
    Done(UpdateResult<()>),
    SelectionChanged,
}

fn apply_fragment_change(
    ctx: &mut UpdateContext,
    queue: &mut VecDeque<Action>,
    planned: &mut Vec<String>,
    selection: Vec<String>,
) {
    if ctx.kind == UpdateKind::PreInstall {
        return;
    }
    info!(selection = ?selection, "rebuilding queue for new fragment selection");
    ctx.fragments = selection.clone();
    *planned = selection;
    plan::rebuild_for_fragment_change(queue, &ctx.fragments);
}

/// Saves the ledger every [`SAVE_INTERVAL`] while the run is active.
///
/// Skipped while paused or stopping; the sequencer cancels and awaits this
/// worker before settling, which serializes the last write with the run's
/// lifecycle.
async fn periodic_save(
    ledger: Arc<HashLedger>,
    location: PathBuf,
    gate: TaskGate,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SAVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if gate.paused() || gate.is_cancelled() {
                    continue;
                }
                if let Err(e) = ledger.save(&location).await {
                    warn!(error = %e, "periodic hash save failed");
                }
            }
        }
    }
}
