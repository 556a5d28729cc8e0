#![forbid(unsafe_code)]

//! Versioned storage envelope.
//!
//! ```text
//! { "version": 1, "timestamp": "<ISO-8601>", "data": { "<key>": <json> } }
//! ```
//!
//! The version is checked before the rest of the document is interpreted, so
//! a future layout is reported as [`PersistError::UnsupportedVersion`] rather
//! than as a shape mismatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PersistError, Result};

/// The only envelope layout this crate reads and writes.
pub const ENVELOPE_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Wrap `data` in a current-version envelope stamped with the current time.
    #[must_use]
    pub fn new(data: Map<String, Value>) -> Self {
        Self::at(data, Utc::now())
    }

    #[must_use]
    pub fn at(data: Map<String, Value>, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            timestamp,
            data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(bytes)?;
        let found = raw
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| PersistError::malformed("missing numeric `version`"))?;
        if found != ENVELOPE_VERSION {
            return Err(PersistError::UnsupportedVersion {
                found,
                expected: ENVELOPE_VERSION,
            });
        }
        Ok(serde_json::from_value(raw)?)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
