use thiserror::Error;

/// Failures surfaced by the sync core. None of these ever reach the
/// presentation loop: every caller logs and keeps its last-known state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or TLS failure talking to the backend.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Payload did not have the shape we expected.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Read endpoint returned no row.
    #[error("no record in {table}")]
    NotFound { table: String },

    /// Backend answered with a non-success status.
    #[error("authority returned {status}: {body}")]
    Authority { status: u16, body: String },

    /// Row came back without a field we need.
    #[error("record missing `{0}`")]
    MissingField(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
