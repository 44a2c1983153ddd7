//! The global update scheduler.
//!
//! At most one sequencer runs at any time; every other queued update waits
//! or sits paused. The queue is a long-lived daemon receiving commands over
//! a channel, with a cloneable [`QueueHandle`] as its public surface.
//!
//! Global gating: connectivity loss and a busy host (its own updater
//! downloading) pause the running update without marking it user-paused,
//! so it auto-resumes when the gate clears. User-paused updates are only
//! ever restarted by an explicit user resume.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::update::SequencerHandle;

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Identity of one queued update.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpdateKey {
    pub game_uid: String,
    pub release: String,
}

impl UpdateKey {
    pub fn new(game_uid: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            game_uid: game_uid.into(),
            release: release.into(),
        }
    }
}

impl fmt::Display for UpdateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.game_uid, self.release)
    }
}

/// Something the queue can run: typically a release wrapping an update
/// sequencer, but anything producing a [`SequencerHandle`] schedules the
/// same way.
pub trait QueueableUpdate: Send + Sync + 'static {
    fn key(&self) -> UpdateKey;

    /// Builds and spawns the underlying run, returning its handle.
    ///
    /// Called once per queue entry; later restarts go through the handle's
    /// pause/resume.
    fn begin(&self)
        -> Pin<Box<dyn Future<Output = UpdateResult<SequencerHandle>> + Send + '_>>;
}

/// Point-in-time view of the queue, for the host UI.
#[derive(Clone, Debug)]
pub struct QueueSnapshot {
    /// Keys in queue order; index 0 is the head.
    pub keys: Vec<UpdateKey>,
    /// The actively running update, if any.
    pub running: Option<UpdateKey>,
    /// True while a global gate (offline, busy host) holds everything.
    pub globally_paused: bool,
}

enum QueueCommand {
    Add {
        update: Arc<dyn QueueableUpdate>,
        reply: oneshot::Sender<UpdateResult<()>>,
    },
    SetIndex {
        key: UpdateKey,
        index: usize,
        reply: oneshot::Sender<UpdateResult<()>>,
    },
    PauseCurrent {
        by_user: bool,
        reply: oneshot::Sender<UpdateResult<()>>,
    },
    Resume {
        key: UpdateKey,
        by_user: bool,
        reply: oneshot::Sender<UpdateResult<()>>,
    },
    SetOnline(bool),
    SetHostBusy(bool),
    Finished {
        key: UpdateKey,
    },
    Snapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
}

/// Cloneable public surface of the queue daemon.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    /// Appends an update. It starts immediately when nothing else runs.
    pub async fn add(&self, update: Arc<dyn QueueableUpdate>) -> UpdateResult<()> {
        self.request(|reply| QueueCommand::Add { update, reply }).await
    }

    /// Moves an update to a position; position 0 preempts the current run.
    pub async fn set_index(&self, key: UpdateKey, index: usize) -> UpdateResult<()> {
        self.request(|reply| QueueCommand::SetIndex { key, index, reply })
            .await
    }

    /// Pauses the running update and lets the next eligible one start.
    pub async fn pause_current(&self, by_user: bool) -> UpdateResult<()> {
        self.request(|reply| QueueCommand::PauseCurrent { by_user, reply })
            .await
    }

    /// Promotes an update to the head and starts or resumes it.
    pub async fn resume(&self, key: UpdateKey, by_user: bool) -> UpdateResult<()> {
        self.request(|reply| QueueCommand::Resume { key, by_user, reply })
            .await
    }

    /// Feeds the connectivity gate.
    pub async fn set_online(&self, online: bool) {
        let _ = self.tx.send(QueueCommand::SetOnline(online)).await;
    }

    /// Feeds the busy-host gate (the host's own updater is downloading).
    pub async fn set_host_busy(&self, busy: bool) {
        let _ = self.tx.send(QueueCommand::SetHostBusy(busy)).await;
    }

    /// Current queue contents.
    pub async fn snapshot(&self) -> UpdateResult<QueueSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(QueueCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| queue_gone())
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<UpdateResult<()>>) -> QueueCommand,
    ) -> UpdateResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| queue_gone())?
    }

    async fn send(&self, command: QueueCommand) -> UpdateResult<()> {
        self.tx.send(command).await.map_err(|_| queue_gone())
    }
}

fn queue_gone() -> UpdateError {
    UpdateError::Internal {
        message: "update queue daemon is gone".to_string(),
    }
}

struct QueueEntry {
    update: Arc<dyn QueueableUpdate>,
    handle: Option<SequencerHandle>,
    paused_by_user: bool,
}

impl QueueEntry {
    fn key(&self) -> UpdateKey {
        self.update.key()
    }
}

/// The queue daemon.
pub struct UpdateQueue {
    entries: Vec<QueueEntry>,
    /// True while `entries[0]` is actively executing.
    running: bool,
    offline: bool,
    host_busy: bool,
    rx: mpsc::Receiver<QueueCommand>,
    /// Loopback sender used by settled-watchers.
    tx: mpsc::Sender<QueueCommand>,
}

impl UpdateQueue {
    /// Creates the daemon and its handle.
    pub fn new() -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let queue = Self {
            entries: Vec::new(),
            running: false,
            offline: false,
            host_busy: false,
            rx,
            tx: tx.clone(),
        };
        (queue, QueueHandle { tx })
    }

    /// Runs the daemon until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("update queue starting");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("update queue stopping");
                    return;
                }

                Some(command) = self.rx.recv() => {
                    self.handle_command(command).await;
                }
            }
        }
    }

    fn globally_paused(&self) -> bool {
        self.offline || self.host_busy
    }

    async fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Add { update, reply } => {
                let _ = reply.send(self.add(update).await);
            }
            QueueCommand::SetIndex { key, index, reply } => {
                let _ = reply.send(self.set_index(&key, index).await);
            }
            QueueCommand::PauseCurrent { by_user, reply } => {
                let _ = reply.send(self.pause_current(by_user).await);
            }
            QueueCommand::Resume { key, by_user, reply } => {
                let _ = reply.send(self.resume(&key, by_user).await);
            }
            QueueCommand::SetOnline(online) => {
                self.set_gate(|q| q.offline = !online).await;
            }
            QueueCommand::SetHostBusy(busy) => {
                self.set_gate(|q| q.host_busy = busy).await;
            }
            QueueCommand::Finished { key } => {
                self.finished(&key).await;
            }
            QueueCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn add(&mut self, update: Arc<dyn QueueableUpdate>) -> UpdateResult<()> {
        let key = update.key();
        if self.entries.iter().any(|e| e.key() == key) {
            return Err(UpdateError::UpdateRunning {
                game_uid: key.game_uid,
                release: key.release,
            });
        }
        debug!(update = %key, "queued");
        self.entries.push(QueueEntry {
            update,
            handle: None,
            paused_by_user: false,
        });
        self.try_start(false).await;
        Ok(())
    }

    async fn set_index(&mut self, key: &UpdateKey, index: usize) -> UpdateResult<()> {
        let old = self.position(key)?;
        let index = index.min(self.entries.len() - 1);
        if old == index {
            return Ok(());
        }

        let head_involved = old == 0 || index == 0;
        if head_involved && self.running {
            self.pause_running(false).await;
        }

        let entry = self.entries.remove(old);
        self.entries.insert(index, entry);

        if head_involved {
            self.try_start(false).await;
        }
        Ok(())
    }

    async fn pause_current(&mut self, by_user: bool) -> UpdateResult<()> {
        if !self.running {
            return Err(UpdateError::precondition("no update is running"));
        }
        self.pause_running(by_user).await;

        // The paused update yields its slot unless it is alone.
        if self.entries.len() > 1 {
            let entry = self.entries.remove(0);
            self.entries.push(entry);
        }
        self.try_start(false).await;
        Ok(())
    }

    async fn resume(&mut self, key: &UpdateKey, by_user: bool) -> UpdateResult<()> {
        let position = self.position(key)?;
        if self.running && position != 0 {
            self.pause_running(false).await;
        }
        let mut entry = self.entries.remove(position);
        entry.paused_by_user = false;
        self.entries.insert(0, entry);
        self.try_start(by_user).await;
        Ok(())
    }

    async fn set_gate(&mut self, apply: impl FnOnce(&mut Self)) {
        let was_paused = self.globally_paused();
        apply(self);
        let now_paused = self.globally_paused();

        if !was_paused && now_paused {
            info!("queue globally paused");
            if self.running {
                self.pause_running(false).await;
            }
        } else if was_paused && !now_paused {
            info!("queue globally resumed");
            self.try_start(false).await;
        }
    }

    async fn finished(&mut self, key: &UpdateKey) {
        let Some(position) = self.entries.iter().position(|e| e.key() == *key) else {
            return;
        };
        debug!(update = %key, "finished");
        if position == 0 {
            self.running = false;
        }
        self.entries.remove(position);
        self.try_start(false).await;
    }

    /// Starts (or resumes) the first eligible entry, moving it to the head.
    ///
    /// User-paused entries are skipped unless the caller is a user resume
    /// acting on the head.
    async fn try_start(&mut self, user_resume: bool) {
        if self.running || self.globally_paused() {
            return;
        }
        let Some(position) = self
            .entries
            .iter()
            .position(|e| !e.paused_by_user || user_resume)
        else {
            return;
        };
        if position != 0 {
            let entry = self.entries.remove(position);
            self.entries.insert(0, entry);
        }

        let key = self.entries[0].key();
        if let Some(handle) = self.entries[0].handle.clone() {
            info!(update = %key, "resuming head update");
            if let Err(e) = handle.resume().await {
                warn!(update = %key, error = %e, "failed to resume update");
                return;
            }
            self.entries[0].paused_by_user = false;
        } else {
            info!(update = %key, "starting head update");
            let update = Arc::clone(&self.entries[0].update);
            match update.begin().await {
                Ok(handle) => {
                    self.watch_settled(key, &handle);
                    self.entries[0].handle = Some(handle);
                }
                Err(e) => {
                    warn!(update = %key, error = %e, "failed to start update");
                    self.entries.remove(0);
                    return;
                }
            }
        }
        self.running = true;
    }

    async fn pause_running(&mut self, by_user: bool) {
        if let Some(entry) = self.entries.first_mut() {
            if let Some(handle) = &entry.handle {
                if let Err(e) = handle.pause().await {
                    warn!(update = %entry.key(), error = %e, "failed to pause update");
                }
            }
            entry.paused_by_user = by_user;
        }
        self.running = false;
    }

    fn watch_settled(&self, key: UpdateKey, handle: &SequencerHandle) {
        let tx = self.tx.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.settled().await;
            let _ = tx.send(QueueCommand::Finished { key }).await;
        });
    }

    fn position(&self, key: &UpdateKey) -> UpdateResult<usize> {
        self.entries
            .iter()
            .position(|e| e.key() == *key)
            .ok_or_else(|| {
                UpdateError::precondition(format!("update {key} is not queued"))
            })
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            keys: self.entries.iter().map(QueueEntry::key).collect(),
            running: self.running.then(|| self.entries[0].key()),
            globally_paused: self.globally_paused(),
        }
    }
}
