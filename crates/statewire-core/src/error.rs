#![forbid(unsafe_code)]

//! Error taxonomy for the reactive runtime.
//!
//! Only direct API misuse surfaces as [`StoreError`]. Failures inside derived
//! machinery (computed registrations, observer callbacks) are caught at their
//! boundary and reported through the [`Delegate`](crate::Delegate) instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Boxed error returned by fallible compute functions.
pub type BoxError = Box<dyn std::error::Error + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The key is bound to a cell of a different element type.
    #[error("type conflict for `{key}`: cell holds {existing}, requested {requested}")]
    TypeConflict {
        key: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// The key is absent and no initial value was supplied.
    #[error("no initial value for absent key `{key}` ({type_name})")]
    MissingInitialValue { key: String, type_name: &'static str },
}

impl StoreError {
    #[must_use]
    pub fn type_conflict<T>(key: &str, existing: &'static str) -> Self {
        Self::TypeConflict {
            key: key.to_owned(),
            existing,
            requested: std::any::type_name::<T>(),
        }
    }

    #[must_use]
    pub fn missing_initial<T>(key: &str) -> Self {
        Self::MissingInitialValue {
            key: key.to_owned(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The key the error refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::TypeConflict { key, .. } | Self::MissingInitialValue { key, .. } => key,
        }
    }
}

/// A computed registration failed to produce a value.
///
/// Never returned to callers; it is built for logging at the registration
/// boundary and handed to the delegate.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("compute for `{target}` failed: {source}")]
    Failed {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("compute for `{target}` panicked: {message}")]
    Panicked { target: String, message: String },

    #[error("compute for `{target}` could not write its result: {source}")]
    Write {
        target: String,
        #[source]
        source: StoreError,
    },
}

impl ComputeError {
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::Failed { target, .. }
            | Self::Panicked { target, .. }
            | Self::Write { target, .. } => target,
        }
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
