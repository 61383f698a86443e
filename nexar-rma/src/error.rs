use crate::types::MdIndex;

pub type Result<T> = std::result::Result<T, RmaError>;

#[derive(Debug, thiserror::Error)]
pub enum RmaError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("no resources available, retry later")]
    NoResource,

    #[error("out of memory: {what}")]
    NoMemory { what: &'static str },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("memory domain {md} does not support {operation}")]
    Unsupported { md: MdIndex, operation: &'static str },

    #[error("memory domain {md} I/O error: {reason}")]
    IoError { md: MdIndex, reason: String },

    #[error("no lane can reach remote key (md_map {md_map:#x})")]
    Unreachable { md_map: u64 },

    #[error("malformed remote key: {0}")]
    InvalidRkey(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RmaError {
    /// Create an `InvalidParam` error.
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Transient backpressure: the caller may retry or fall back to a
    /// request-based path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoResource)
    }
}
