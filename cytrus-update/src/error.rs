//! Error types for the update engine.
//!
//! All fallible operations in the crate return [`UpdateResult`]. The variants
//! map onto the error classes surfaced at the engine boundary; each boundary
//! variant has a stable machine-readable code (see [`UpdateError::code`]).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors that can occur during an update run or around it.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The engine is offline and the operation requires the repository.
    #[error("cannot update while offline")]
    Offline,

    /// An update for this release is already queued or running.
    #[error("an update is already running for {game_uid}/{release}")]
    UpdateRunning { game_uid: String, release: String },

    /// The release has no install location configured.
    #[error("no install location set")]
    LocationNotSet,

    /// The configured install location does not exist.
    #[error("install location not found: {path}")]
    LocationNotFound { path: PathBuf },

    /// The chosen install location already contains another game.
    #[error("install location is a game directory: {path}")]
    LocationIsAGameDirectory { path: PathBuf },

    /// The chosen install location is not empty.
    #[error("install location is not empty: {path}")]
    LocationNotEmpty { path: PathBuf },

    /// Not enough free disk space at the install location.
    #[error("not enough space: need {required} bytes, {available} available")]
    NotEnoughSpace { required: u64, available: u64 },

    /// The process lacks permissions on the install location.
    #[error("insufficient permissions on {path}")]
    UserPermissions { path: PathBuf },

    /// The repository speaks a cytrus version this engine does not handle.
    #[error("unhandled cytrus version {version} (expected {expected})")]
    CytrusVersionNotHandled { version: u32, expected: u32 },

    /// The release configuration rejected this machine.
    #[error("bad configuration: {message}")]
    BadConfiguration { message: String },

    /// The local hashes file is missing, legacy, or unreadable.
    ///
    /// The sequencer promotes this to a repair run.
    #[error("local hashes unusable: {reason}")]
    LocalHashes { reason: String },

    /// A downloaded blob did not hash to its content address.
    #[error("hash mismatch for {hash}: got {actual}")]
    HashMismatch { hash: String, actual: String },

    /// A d2p archive header did not announce version 2.1.
    #[error("unsupported d2p version {major}.{minor}")]
    D2pWrongVersion { major: u8, minor: u8 },

    /// A d2p archive could not be read.
    #[error("d2p archive not found or unreadable: {path}")]
    D2pNotFound { path: PathBuf },

    /// A d2p archive body was truncated or self-inconsistent.
    #[error("malformed d2p archive {path}: {reason}")]
    D2pMalformed { path: PathBuf, reason: String },

    /// A network request failed after exhausting its retry budget.
    #[error("request to {url} failed after {attempts} attempts: {reason}")]
    Network {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The server answered with a non-success status.
    #[error("request to {url} answered {status}")]
    HttpStatus { url: String, status: u16 },

    /// A control operation was invalid in the task's current state.
    #[error("precondition failed: {message}")]
    Precondition { message: String },

    /// The task observed a cancel request and quiesced.
    ///
    /// Used as control flow inside task bodies; never surfaced as a
    /// terminal error (cancellation settles as an outcome, not a failure).
    #[error("cancelled")]
    Cancelled,

    /// Filesystem I/O failure.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("invalid json in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invariant breach inside the engine. Fatal; logged by the caller.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl UpdateError {
    /// Shorthand for an I/O error tagged with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a JSON error tagged with what was being parsed.
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for a precondition violation.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Returns the stable boundary code for this error, if it has one.
    ///
    /// Codes are part of the external contract and never change spelling.
    pub fn code(&self) -> Option<&'static str> {
        Some(match self {
            Self::Offline => "CANNOT_UPDATE_WHILE_OFFLINE",
            Self::UpdateRunning { .. } => "UPDATE_RUNNING",
            Self::LocationNotSet => "LOCATION_NOT_SET",
            Self::LocationNotFound { .. } => "LOCATION_NOT_FOUND",
            Self::LocationIsAGameDirectory { .. } => "LOCATION_IS_A_GAME_DIRECTORY",
            Self::LocationNotEmpty { .. } => "LOCATION_NOT_EMPTY",
            Self::NotEnoughSpace { .. } => "NOT_ENOUGH_SPACE",
            Self::UserPermissions { .. } => "USER_PERMISSIONS",
            Self::CytrusVersionNotHandled { .. } => "CYTRUS_VERSION_NOT_HANDLED",
            Self::BadConfiguration { .. } => "BAD_CONFIGURATION",
            Self::LocalHashes { .. } => "LOCAL_HASHES_ERROR",
            Self::HashMismatch { .. } => "FETCH_HASH_MISMATCH",
            Self::D2pWrongVersion { .. } => "D2P_WRONG_VERSION",
            Self::D2pNotFound { .. } => "D2P_NOT_FOUND",
            _ => return None,
        })
    }

    /// Returns true if this failure class is worth retrying.
    ///
    /// Only transient network failures qualify; integrity and protocol
    /// errors have their own clean-and-retry paths. Server-side statuses
    /// count as transient, client-side ones do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_codes_are_stable() {
        assert_eq!(
            UpdateError::Offline.code(),
            Some("CANNOT_UPDATE_WHILE_OFFLINE")
        );
        assert_eq!(
            UpdateError::LocalHashes {
                reason: "missing".into()
            }
            .code(),
            Some("LOCAL_HASHES_ERROR")
        );
        assert_eq!(
            UpdateError::D2pWrongVersion { major: 1, minor: 0 }.code(),
            Some("D2P_WRONG_VERSION")
        );
        assert_eq!(
            UpdateError::HashMismatch {
                hash: "aa".into(),
                actual: "bb".into()
            }
            .code(),
            Some("FETCH_HASH_MISMATCH")
        );
    }

    #[test]
    fn test_internal_errors_have_no_code() {
        let err = UpdateError::Internal {
            message: "queue invariant".into(),
        };
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_display_messages() {
        let err = UpdateError::NotEnoughSpace {
            required: 100,
            available: 10,
        };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("10"));

        let err = UpdateError::CytrusVersionNotHandled {
            version: 4,
            expected: 5,
        };
        assert!(err.to_string().contains('4'));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_transient_classification() {
        let net = UpdateError::Network {
            url: "https://example.test/a".into(),
            attempts: 3,
            reason: "timeout".into(),
        };
        assert!(net.is_transient());
        assert!(!UpdateError::LocationNotSet.is_transient());
    }
}
