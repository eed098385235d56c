//! Error taxonomy for listener acquisition and process handover.
//!
//! Every variant is fatal to whatever phase raised it. Acquisition errors
//! abort startup; reload errors abort the process. Nothing here is meant to
//! be retried.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HandoverError>;

#[derive(Debug, thiserror::Error)]
pub enum HandoverError {
    /// A fresh listening socket could not be created or bound.
    #[error("failed to bind {key}: {source}")]
    Bind {
        key: String,
        #[source]
        source: io::Error,
    },

    /// An inherited descriptor could not be turned back into a listener.
    #[error("failed to adopt inherited listener {key}: {reason}")]
    Adoption { key: String, reason: String },

    /// The handover environment is inconsistent.
    #[error("malformed handover environment: {0}")]
    MalformedEnvironment(String),

    /// A registered socket could not be duplicated for the successor.
    #[error("listener {key} is not duplicable: {source}")]
    NotDuplicable {
        key: String,
        #[source]
        source: io::Error,
    },

    /// The OS refused to launch the successor process.
    #[error("failed to spawn successor process: {0}")]
    Spawn(#[source] io::Error),

    /// A successor has already been launched from this generation.
    #[error("a reload is already in progress for this generation")]
    ReloadInProgress,

    /// The registry no longer accepts new listeners.
    #[error("listener registry is sealed; acquire every listener before waiting for signals")]
    Sealed,

    /// The parent passed listeners the successor never asked for.
    #[error("inherited listeners were never acquired: {0:?}")]
    UnclaimedInherited(Vec<String>),

    /// Subscribing to OS signals failed.
    #[error("failed to subscribe to signals: {0}")]
    Signal(#[source] io::Error),

    /// Another signal subscription is already live in this process.
    #[error("a signal coordinator is already subscribed in this process")]
    AlreadySubscribed,

    /// The signal source ended before delivering a signal.
    #[error("signal source closed before any signal arrived")]
    SignalSourceClosed,
}

impl HandoverError {
    pub(crate) fn adoption(key: impl ToString, reason: impl Into<String>) -> Self {
        HandoverError::Adoption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
