//! Error types for mesos-dns-sync.

use thiserror::Error;

/// Errors that can occur in the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// HTTP transport error while talking to the master.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Master answered SUBSCRIBE with a non-success status.
    #[error("SUBSCRIBE rejected with HTTP status {0}")]
    SubscribeStatus(reqwest::StatusCode),

    /// The master redirected us; another node is the leader.
    #[error("not the leading master")]
    NotLeader,

    /// Violation of the length-prefixed record framing.
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// Frame payload was not valid JSON.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// A subscriber with the same name already exists.
    #[error("subscriber {0:?} is already subscribed")]
    AlreadySubscribed(String),

    /// `subscribe()` did not complete within its caller-side timeout.
    #[error("subscribe timed out")]
    SubscribeTimeout,

    /// The mirror actor has shut down.
    #[error("mirror is not running")]
    MirrorClosed,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
