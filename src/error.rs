use thiserror::Error;

/// Errors that can occur while ingesting, storing or persisting metrics.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A custom error with a free-form message.
    #[error("Custom error: {0}")]
    Custom(String),

    /// An I/O error from the standard library.
    #[error("Std Io error: {0}")]
    StdIo(#[from] std::io::Error),

    /// A framing sentinel did not match while decoding a message or a file.
    #[error("Bad canary in {context}: {found:#x}")]
    BadCanary {
        /// What was being decoded (message, snapshot, dump trailer).
        context: &'static str,
        /// The value found in place of the sentinel.
        found: i64,
    },

    /// A metric was re-registered with a different type.
    #[error("Mismatching types for metric {0}")]
    TypeMismatch(String),

    /// A value update referenced a metric that was never registered.
    #[error("No such metric {0}")]
    UnknownMetric(String),

    /// A message carried a type outside the protocol range.
    #[error("No such message type {0}")]
    UnknownMessage(u32),

    /// The profile directory lock file belongs to a live peer.
    #[error("Profile lock is held by {owner}")]
    LockHeld {
        /// Identity recorded in the lock file (`hostname:pid`).
        owner: String,
    },
}

impl From<String> for ProxyError {
    fn from(value: String) -> Self {
        Self::Custom(value)
    }
}

impl From<&str> for ProxyError {
    fn from(value: &str) -> Self {
        Self::Custom(value.to_string())
    }
}
