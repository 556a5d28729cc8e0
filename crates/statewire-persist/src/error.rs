#![forbid(unsafe_code)]

use thiserror::Error;

use statewire_core::StoreError;

pub type Result<T> = std::result::Result<T, PersistError>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported envelope version {found} (expected {expected})")]
    UnsupportedVersion { found: u64, expected: u64 },

    #[error("malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("invalid storage key: {key:?}")]
    InvalidKey { key: String },

    #[error("storage backend error: {message}")]
    Backend { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PersistError {
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            message: message.into(),
        }
    }
}
