// =============================================================================
// Error taxonomy
// =============================================================================
//
// Failures are scoped to the narrowest unit that can absorb them:
//   - a malformed frame is dropped and counted, the subscription lives on;
//   - a malformed page aborts that one backfill call;
//   - indicator errors go straight back to the caller, no retry.
// =============================================================================

use thiserror::Error;

/// Errors raised by the ingestion layer (REST backfill, live streams, storage
/// sinks fed by ingestion).
#[derive(Debug, Error)]
pub enum IngestError {
    /// A connection failed to open or was rejected by the remote end.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single live frame could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A historical page had invalid or non-increasing timestamps, or rows
    /// that could not be decoded.
    #[error("malformed page: {0}")]
    MalformedPage(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Request weight is above the self-imposed ceiling.
    #[error("rate limited: used weight {used} exceeds {limit}")]
    RateLimited { used: u32, limit: u32 },

    #[error("unknown kline interval '{0}'")]
    UnknownInterval(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<IngestError>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal channel closed")]
    ChannelClosed,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// Whether a network call that failed with this error is worth retrying.
    ///
    /// Client-side HTTP errors (4xx other than 429) and data errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited { .. } | Self::Socket(_) => true,
            Self::Request(e) => !e.is_decode(),
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Errors surfaced synchronously by the indicator engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndicatorError {
    #[error("unknown indicator '{0}'")]
    UnknownIndicator(String),

    #[error("insufficient data: need {required} values, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("non-finite input value at index {index}")]
    NonFiniteInput { index: usize },

    #[error("custom indicator '{name}' failed: {reason}")]
    Custom { name: String, reason: String },
}

/// Errors raised by storage adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}
