//! Game-content update engine speaking the cytrus v5 repository protocol.
//!
//! Given a release identifier (game uid, channel, target version, install
//! location, fragment selection), the engine reconciles a local installation
//! against the remote content repository so the tree exactly matches the
//! remote manifest, with pause/resume/cancel, multi-release queuing, and
//! resilience to network and process failure.
//!
//! # Architecture
//!
//! ```text
//! UpdateQueue ──► UpdateSequencer ──► Action library
//!                      │                   │
//!                      │                   ├── DiffEngine (pure)
//!                      │                   ├── Fetcher ──► RepositoryClient
//!                      │                   └── D2PCodec
//!                      └── ControllableTask (pause/resume/cancel/progress)
//! ```
//!
//! The queue runs at most one sequencer at a time. A sequencer drives a
//! composed queue of actions against a typed context; actions use the
//! fetcher and repository client for network work, and everything
//! suspendable is built on the controllable-task gate.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cytrus_update::{
//!     EngineConfig, RepositoryClient, UpdateKind, UpdateParams, UpdateSequencer,
//! };
//!
//! let config = EngineConfig::new("https://cytrus.cdn.example.com", "prod", data_root);
//! let client = Arc::new(RepositoryClient::new(&config)?);
//!
//! let handle = UpdateSequencer::spawn(UpdateParams {
//!     config,
//!     client,
//!     game_uid: "dofus".into(),
//!     release_name: "main".into(),
//!     version: "5.0_1.2.3".into(),
//!     location: install_dir,
//!     kind: UpdateKind::Install,
//!     fragments: vec!["main".into(), "en".into()],
//!     already_downloaded: 0,
//! });
//!
//! let mut events = handle.subscribe();
//! while let Ok(event) = events.recv().await {
//!     // progress, completed, cancelled, error
//! }
//! ```

pub mod config;
pub mod d2p;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod hash;
pub mod manifest;
pub mod queue;
pub mod release;
pub mod repository;
pub mod task;
pub mod update;

pub use config::{EngineConfig, Platform};
pub use error::{UpdateError, UpdateResult};
pub use queue::{QueueHandle, QueueableUpdate, UpdateKey, UpdateQueue};
pub use release::{Release, RecoveryAction, ReleaseState, ReleaseStore};
pub use repository::{GameListEvent, GameListWatcher, GamesList, RepositoryClient};
pub use task::{ControlHandle, ControlledTask, Outcome, TaskGate, TaskState};
pub use update::{
    SequencerHandle, UpdateEvent, UpdateKind, UpdateParams, UpdateProgress, UpdateSequencer,
};
