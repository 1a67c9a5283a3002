use crate::audio::EngineError;

/// Result alias that carries the custom [`SyncError`] type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A decoded parameter string named the same key more than once.
    #[error("parameter `{key}` appears more than once")]
    MalformedOrDuplicateKey { key: String },
    /// The audio engine does not know the requested event.
    #[error("audio event `{event}` could not be resolved")]
    EventResolution { event: String },
    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("cannot {operation} while the bridge is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// Failure reported by the audio engine.
    #[error("audio engine error: {0}")]
    Engine(#[from] EngineError),
    /// Configuration parsed but describes something unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Configuration could not be parsed.
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// Free-form error message, mostly used for poisoned locks.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for SyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
