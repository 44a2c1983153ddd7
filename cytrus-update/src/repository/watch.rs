//! Game list polling.
//!
//! The watcher polls `cytrus.json` on an interval and emits an event when
//! the effective game list actually changes, so downstream consumers see
//! one event per meaningful change rather than one per poll.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::RepositoryClient;
use super::games::{GameEntry, GamesList};

/// Capacity of the event channel; a consumer this far behind re-reads the
/// list on its next event anyway.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Events emitted by the watcher.
#[derive(Clone, Debug)]
pub enum GameListEvent {
    /// The effective game list changed.
    Update(BTreeMap<String, GameEntry>),

    /// A poll failed; the previous list stays in effect.
    CheckFailed(String),
}

/// Polls the repository game list.
pub struct GameListWatcher {
    client: Arc<RepositoryClient>,
    interval: Duration,
    pre_release: bool,
    events: broadcast::Sender<GameListEvent>,
}

impl GameListWatcher {
    /// Creates a watcher polling every `interval`.
    pub fn new(client: Arc<RepositoryClient>, interval: Duration, pre_release: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            interval,
            pre_release,
            events,
        }
    }

    /// Subscribes to watcher events.
    pub fn subscribe(&self) -> broadcast::Receiver<GameListEvent> {
        self.events.subscribe()
    }

    /// Runs the poll loop until shutdown.
    ///
    /// `initial` seeds the comparison state; the first poll only emits if
    /// the repository already moved past it.
    pub async fn run(self, initial: GamesList, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "game list watcher starting");
        let mut current = initial.effective(self.pre_release);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the cadence starts
        // one interval after seeding.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("game list watcher stopping");
                    return;
                }

                _ = ticker.tick() => {
                    match self.client.get_games_list().await {
                        Ok(list) => {
                            let effective = list.effective(self.pre_release);
                            if effective != current {
                                debug!(games = effective.len(), "game list changed");
                                current = effective.clone();
                                let _ = self.events.send(GameListEvent::Update(effective));
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "game list poll failed");
                            let _ = self.events.send(GameListEvent::CheckFailed(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}
