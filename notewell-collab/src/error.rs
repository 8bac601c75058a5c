use thiserror::Error;

/// Result type for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors surfaced by the collaboration core.
///
/// Most failures are absorbed internally (logged and dropped, or retried by
/// the reconnect loop); only operations with a meaningful caller-side
/// recovery return these.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("snapshot service error: {0}")]
    Snapshot(String),
}
