//! Repository access (cytrus v5).
//!
//! The repository serves the game list, per-release manifests, and
//! content-addressed blobs over HTTPS. This module provides:
//!
//! - [`EndpointCache`]: DNS-cached endpoint rotation for the repository host
//! - [`RepositoryClient`]: manifest and blob fetching with retry
//! - [`GameListWatcher`]: periodic polling of the game list
//! - the game list model

mod client;
mod endpoints;
mod games;
mod watch;

pub use client::{RepositoryClient, CYTRUS_VERSION};
pub use endpoints::EndpointCache;
pub use games::{GameEntry, GamesList};
pub use watch::{GameListEvent, GameListWatcher};
