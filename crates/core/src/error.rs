use std::{sync::Arc, time::Duration};

/// Result alias that carries the custom [`ScanError`] type.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Common error type for the core crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    /// Invalid channel limits, sample rate or ranges detected while building
    /// the engine. Construction aborts and nothing is retained.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A hardware write or read did not complete within its timeout.
    #[error("{operation} did not complete within {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },
    /// The call is not allowed in the current engine state. No state changed.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
    /// Fault reported by the hardware backend.
    #[error("device error: {0}")]
    Device(String),
    #[error("{0}")]
    Io(Arc<std::io::Error>),
    #[error("invalid configuration file: {0}")]
    Json(Arc<serde_json::Error>),
}

impl ScanError {
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn precondition<T: Into<String>>(msg: T) -> Self {
        Self::PreconditionViolation(msg.into())
    }

    pub fn device<T: Into<String>>(msg: T) -> Self {
        Self::Device(msg.into())
    }

    /// Whether the error ends the current streaming run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. } | Self::Device(_))
    }
}

impl From<std::io::Error> for ScanError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}
