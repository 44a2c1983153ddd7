//! Controllable tasks.
//!
//! A controllable task is a unit of async work that can be paused, resumed,
//! and cancelled, reports progress to any number of subscribers, and settles
//! exactly once with a terminal [`Outcome`]. It is the primitive under the
//! fetcher, the action library, and the update sequencer.
//!
//! # State machine
//!
//! ```text
//! Resumed ⇄ Paused ──► { Fulfilled | Cancelled | Rejected }
//! ```
//!
//! Control operations are atomic: `pause`, `resume`, and `cancel` hold an
//! exclusive operation lock, and a concurrent control request fails with a
//! precondition error without touching state. Once a task settles, every
//! further control request fails the same way.
//!
//! Cancellation is cooperative. The task body awaits
//! [`TaskGate::checkpoint`] at its suspension points; a checkpoint parks
//! the body while paused and returns [`UpdateError::Cancelled`] once a cancel
//! has been requested. A body that resolves while the task is paused does not
//! settle until the next resume, so observers never see a fulfilment arrive
//! during a paused interval.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{UpdateError, UpdateResult};

/// Capacity of the progress broadcast channel.
///
/// Progress delivery is best-effort: a subscriber that lags behind this many
/// events drops the oldest ones.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a controllable task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Running (the initial state).
    Resumed,
    /// Paused; progress is silent and fulfilment is deferred.
    Paused,
    /// Settled successfully.
    Fulfilled,
    /// Settled by cancellation.
    Cancelled,
    /// Settled with an error.
    Rejected,
}

impl TaskState {
    /// True once the task has settled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fulfilled | Self::Cancelled | Self::Rejected)
    }
}

/// Terminal outcome of a controllable task.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The body ran to completion.
    Fulfilled(T),
    /// The task was cancelled before completion.
    Cancelled,
    /// The body failed.
    Rejected(UpdateError),
}

impl<T> Outcome<T> {
    /// The state this outcome settles the task into.
    pub fn state(&self) -> TaskState {
        match self {
            Self::Fulfilled(_) => TaskState::Fulfilled,
            Self::Cancelled => TaskState::Cancelled,
            Self::Rejected(_) => TaskState::Rejected,
        }
    }

    /// Unwraps the fulfilment value, converting the other outcomes to errors.
    pub fn into_result(self) -> UpdateResult<T> {
        match self {
            Self::Fulfilled(value) => Ok(value),
            Self::Cancelled => Err(UpdateError::Cancelled),
            Self::Rejected(err) => Err(err),
        }
    }
}

// =============================================================================
// Control core
// =============================================================================

/// Progress-type-agnostic control state shared by all surfaces of a task.
struct ControlCore {
    name: String,
    state: watch::Sender<TaskState>,
    cancel: CancellationToken,
    /// Exclusive lock held for the duration of each control operation.
    op_lock: tokio::sync::Mutex<()>,
}

impl ControlCore {
    fn new(name: String) -> Self {
        let (state, _) = watch::channel(TaskState::Resumed);
        Self {
            name,
            state,
            cancel: CancellationToken::new(),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn current_state(&self) -> TaskState {
        *self.state.borrow()
    }
}

/// Body-side pause/cancel gate of a task, independent of the progress type.
///
/// Cloneable so that a task body can fan work out to concurrent branches
/// that all honor the same pause gate and cancel token; components like the
/// fetcher take a gate rather than the full typed controls.
#[derive(Clone)]
pub struct TaskGate {
    core: Arc<ControlCore>,
}

impl TaskGate {
    /// Suspension point: parks while paused, fails once cancelled.
    ///
    /// Task bodies call this at every natural boundary (between requests,
    /// between chunks, between files). Returns [`UpdateError::Cancelled`]
    /// when a cancel has been requested, which the runner converts to the
    /// cancelled outcome.
    pub async fn checkpoint(&self) -> UpdateResult<()> {
        let mut rx = self.core.state.subscribe();
        loop {
            if self.core.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if *rx.borrow_and_update() != TaskState::Paused {
                return Ok(());
            }
            tokio::select! {
                _ = self.core.cancel.cancelled() => return Err(UpdateError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(UpdateError::Cancelled);
                    }
                }
            }
        }
    }

    /// True once a cancel has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    /// True while the task is paused.
    ///
    /// Streaming bodies poll this to release held resources (an open
    /// response, a file handle) before parking on [`Self::checkpoint`].
    pub fn paused(&self) -> bool {
        self.core.current_state() == TaskState::Paused
    }

    /// The cancel token, for `select!`-style racing in streaming loops.
    pub fn cancelled_token(&self) -> &CancellationToken {
        &self.core.cancel
    }
}

// =============================================================================
// Control handle (owner side)
// =============================================================================

/// Owner-side control surface of a task.
///
/// Cloneable; all clones steer the same task.
pub struct ControlHandle<P> {
    core: Arc<ControlCore>,
    progress: broadcast::Sender<P>,
}

impl<P> Clone for ControlHandle<P> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            progress: self.progress.clone(),
        }
    }
}

impl<P> fmt::Debug for ControlHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("name", &self.core.name)
            .field("state", &self.core.current_state())
            .finish()
    }
}

impl<P: Clone + Send + 'static> ControlHandle<P> {
    /// Pauses the task.
    ///
    /// Fails with a precondition error if the task is not running or another
    /// control operation is in flight.
    pub async fn pause(&self) -> UpdateResult<()> {
        let _op = self.try_op_lock()?;
        match self.core.current_state() {
            TaskState::Resumed => {
                debug!(task = %self.core.name, "pausing");
                self.core.state.send_replace(TaskState::Paused);
                Ok(())
            }
            state => Err(UpdateError::precondition(format!(
                "cannot pause task '{}' in state {state:?}",
                self.core.name
            ))),
        }
    }

    /// Resumes a paused task.
    pub async fn resume(&self) -> UpdateResult<()> {
        let _op = self.try_op_lock()?;
        match self.core.current_state() {
            TaskState::Paused => {
                debug!(task = %self.core.name, "resuming");
                self.core.state.send_replace(TaskState::Resumed);
                Ok(())
            }
            state => Err(UpdateError::precondition(format!(
                "cannot resume task '{}' in state {state:?}",
                self.core.name
            ))),
        }
    }

    /// Cancels the task and waits for it to quiesce.
    ///
    /// Resolves once the task has settled as [`TaskState::Cancelled`]; no
    /// progress event fires after that. Fails with a precondition error if
    /// the task has already settled.
    pub async fn cancel(&self) -> UpdateResult<()> {
        {
            let _op = self.try_op_lock()?;
            if self.core.current_state().is_terminal() {
                return Err(UpdateError::precondition(format!(
                    "cannot cancel settled task '{}'",
                    self.core.name
                )));
            }
            debug!(task = %self.core.name, "cancel requested");
            self.core.cancel.cancel();
        }

        // Outside the op lock: waiting for settlement must not block other
        // observers from reading state.
        let mut rx = self.core.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        Ok(())
    }

    /// Subscribes to progress events.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<P> {
        self.progress.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.current_state()
    }

    /// True once the task has settled.
    pub fn is_settled(&self) -> bool {
        self.core.current_state().is_terminal()
    }

    /// Resolves when the task settles (without consuming the outcome).
    pub async fn settled(&self) {
        let mut rx = self.core.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    fn try_op_lock(&self) -> UpdateResult<tokio::sync::MutexGuard<'_, ()>> {
        self.core.op_lock.try_lock().map_err(|_| {
            UpdateError::precondition(format!(
                "concurrent control operation on task '{}'",
                self.core.name
            ))
        })
    }
}

// =============================================================================
// Task controls (body side)
// =============================================================================

/// Body-side surface of a task: the gate plus the typed progress emitter.
pub struct TaskControls<P> {
    gate: TaskGate,
    progress: broadcast::Sender<P>,
}

impl<P> Clone for TaskControls<P> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            progress: self.progress.clone(),
        }
    }
}

impl<P: Clone + Send + 'static> TaskControls<P> {
    /// See [`TaskGate::checkpoint`].
    pub async fn checkpoint(&self) -> UpdateResult<()> {
        self.gate.checkpoint().await
    }

    /// Emits a progress event to all subscribers.
    ///
    /// Silently dropped while the task is paused or cancelled, preserving
    /// the contract that notifications cease until resume.
    pub fn emit(&self, progress: P) {
        if !self.gate.paused() && !self.gate.is_cancelled() {
            let _ = self.progress.send(progress);
        }
    }

    /// True once a cancel has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.gate.is_cancelled()
    }

    /// True while the task is paused.
    pub fn paused(&self) -> bool {
        self.gate.paused()
    }

    /// The cancel token, for `select!`-style racing in streaming loops.
    pub fn cancelled_token(&self) -> &CancellationToken {
        self.gate.cancelled_token()
    }

    /// The progress-type-agnostic gate, for handing to sub-components.
    pub fn gate(&self) -> TaskGate {
        self.gate.clone()
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// A spawned controllable task.
///
/// Carries the control handle and the one-shot outcome. Dropping the task
/// does not stop the underlying work; cancel it first.
pub struct ControlledTask<T, P> {
    handle: ControlHandle<P>,
    outcome: oneshot::Receiver<Outcome<T>>,
}

impl<T, P: Clone + Send + 'static> ControlledTask<T, P> {
    /// The owner-side control handle.
    pub fn handle(&self) -> ControlHandle<P> {
        self.handle.clone()
    }

    /// Awaits the terminal outcome.
    pub async fn join(self) -> Outcome<T> {
        match self.outcome.await {
            Ok(outcome) => outcome,
            // The runner never drops the sender before settling; reaching
            // this means the runtime tore the task down (e.g. panic).
            Err(_) => Outcome::Rejected(UpdateError::Internal {
                message: "task runner dropped before settling".to_string(),
            }),
        }
    }
}

/// Spawns a task body as a controllable task on the current runtime.
///
/// The body receives a [`TaskControls`] and must await
/// [`TaskControls::checkpoint`] at its suspension points. Its `Result` maps
/// onto the outcome: `Ok` to fulfilled, `Err(Cancelled)` to cancelled,
/// any other error to rejected. A body resolving while the task is paused
/// settles only on the next resume (or cancel, whichever comes first).
pub fn spawn<T, P, F, Fut>(name: impl Into<String>, body: F) -> ControlledTask<T, P>
where
    T: Send + 'static,
    P: Clone + Send + 'static,
    F: FnOnce(TaskControls<P>) -> Fut,
    Fut: std::future::Future<Output = UpdateResult<T>> + Send + 'static,
{
    let core = Arc::new(ControlCore::new(name.into()));
    let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);

    let controls = TaskControls {
        gate: TaskGate {
            core: Arc::clone(&core),
        },
        progress: progress.clone(),
    };
    let handle = ControlHandle {
        core: Arc::clone(&core),
        progress,
    };
    let (outcome_tx, outcome_rx) = oneshot::channel();

    let fut = body(controls);
    tokio::spawn(async move {
        let result = fut.await;

        let mut outcome = match result {
            Ok(value) => Outcome::Fulfilled(value),
            Err(UpdateError::Cancelled) => Outcome::Cancelled,
            Err(err) => Outcome::Rejected(err),
        };

        // Defer fulfilment (or rejection) while paused. A cancel arriving
        // during the deferral wins the race and settles as cancelled.
        if !matches!(outcome, Outcome::Cancelled) {
            let mut rx = core.state.subscribe();
            tokio::select! {
                _ = rx.wait_for(|s| *s != TaskState::Paused) => {}
                _ = core.cancel.cancelled() => {
                    outcome = Outcome::Cancelled;
                }
            }
        }

        debug!(task = %core.name, state = ?outcome.state(), "task settled");
        core.state.send_replace(outcome.state());
        let _ = outcome_tx.send(outcome);
    });

    ControlledTask {
        handle,
        outcome: outcome_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    /// A body that counts checkpoints until told to finish.
    async fn ticking_body(
        controls: TaskControls<u64>,
        ticks: u64,
        tick: Duration,
    ) -> UpdateResult<u64> {
        for i in 0..ticks {
            controls.checkpoint().await?;
            controls.emit(i);
            sleep(tick).await;
        }
        Ok(ticks)
    }

    #[tokio::test]
    async fn test_fulfilled_outcome() {
        let task = spawn("t", |c| ticking_body(c, 3, Duration::from_millis(1)));
        match task.join().await {
            Outcome::Fulfilled(n) => assert_eq!(n, 3),
            other => panic!("expected fulfilled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_outcome() {
        let task: ControlledTask<(), ()> = spawn("t", |_c| async {
            Err(UpdateError::precondition("boom"))
        });
        let outcome = task.join().await;
        assert!(matches!(outcome, Outcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_cancel_settles_as_cancelled() {
        let task = spawn("t", |c| ticking_body(c, 1000, Duration::from_millis(5)));
        let handle = task.handle();

        sleep(Duration::from_millis(10)).await;
        handle.cancel().await.unwrap();
        assert_eq!(handle.state(), TaskState::Cancelled);

        assert!(matches!(task.join().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_operations_on_settled_task_fail() {
        let task = spawn("t", |c| ticking_body(c, 1, Duration::from_millis(1)));
        let handle = task.handle();
        task.join().await.into_result().unwrap();

        assert!(handle.pause().await.is_err());
        assert!(handle.resume().await.is_err());
        assert!(handle.cancel().await.is_err());
    }

    #[tokio::test]
    async fn test_pause_stops_progress_until_resume() {
        let task = spawn("t", |c| ticking_body(c, 50, Duration::from_millis(2)));
        let handle = task.handle();
        let mut progress = handle.subscribe_progress();

        // Let a couple of events through, then pause.
        let _ = progress.recv().await.unwrap();
        handle.pause().await.unwrap();
        assert_eq!(handle.state(), TaskState::Paused);

        // Drain whatever was in flight, then verify silence.
        sleep(Duration::from_millis(20)).await;
        while progress.try_recv().is_ok() {}
        sleep(Duration::from_millis(20)).await;
        assert!(progress.try_recv().is_err());

        handle.resume().await.unwrap();
        let _ = progress.recv().await.unwrap();

        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_fulfilment_deferred_while_paused() {
        let task = spawn("t", |c| ticking_body(c, 1, Duration::from_millis(1)));
        let handle = task.handle();
        handle.pause().await.unwrap();

        // Body finishes quickly, but the task must not settle while paused.
        sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.state(), TaskState::Paused);
        assert!(!handle.is_settled());

        handle.resume().await.unwrap();
        assert!(matches!(task.join().await, Outcome::Fulfilled(1)));
    }

    #[tokio::test]
    async fn test_cancel_wins_deferred_fulfilment() {
        let task = spawn("t", |c| ticking_body(c, 1, Duration::from_millis(1)));
        let handle = task.handle();
        handle.pause().await.unwrap();
        sleep(Duration::from_millis(20)).await;

        handle.cancel().await.unwrap();
        assert!(matches!(task.join().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_pause_requires_running_state() {
        let task = spawn("t", |c| ticking_body(c, 100, Duration::from_millis(2)));
        let handle = task.handle();

        handle.pause().await.unwrap();
        let err = handle.pause().await.unwrap_err();
        assert!(matches!(err, UpdateError::Precondition { .. }));

        handle.resume().await.unwrap();
        let err = handle.resume().await.unwrap_err();
        assert!(matches!(err, UpdateError::Precondition { .. }));

        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_checkpoint_returns_cancelled() {
        let task: ControlledTask<(), ()> = spawn("t", |c| async move {
            loop {
                c.checkpoint().await?;
                sleep(Duration::from_millis(2)).await;
            }
        });
        let handle = task.handle();
        sleep(Duration::from_millis(10)).await;
        handle.cancel().await.unwrap();
        assert!(matches!(task.join().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_gate_is_shared_with_clones() {
        let task: ControlledTask<(), ()> = spawn("t", |c| async move {
            let gate = c.gate();
            loop {
                gate.checkpoint().await?;
                sleep(Duration::from_millis(2)).await;
            }
        });
        let handle = task.handle();
        sleep(Duration::from_millis(10)).await;
        handle.cancel().await.unwrap();
        assert!(matches!(task.join().await, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_multiple_progress_subscribers() {
        let task = spawn("t", |c| ticking_body(c, 20, Duration::from_millis(2)));
        let handle = task.handle();
        let mut a = handle.subscribe_progress();
        let mut b = handle.subscribe_progress();

        let first_a = a.recv().await.unwrap();
        let first_b = b.recv().await.unwrap();
        // Both subscribers observe the same stream.
        assert_eq!(first_a, first_b);

        handle.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn test_outcome_into_result() {
        assert!(Outcome::Fulfilled(1).into_result().is_ok());
        assert!(matches!(
            Outcome::<u32>::Cancelled.into_result(),
            Err(UpdateError::Cancelled)
        ));
    }
}
