#![forbid(unsafe_code)]

//! The serializer capability.
//!
//! Types opt in by implementing [`Persistable`]. Encoding follows a fixed
//! order with no probing: primitives pass through as JSON scalars, dates and
//! collections become structured JSON, and anything else must choose a path
//! explicitly with [`persist_via_serde!`](crate::persist_via_serde) or
//! [`persist_via_display!`](crate::persist_via_display).
//!
//! Date/time values use the tagged form
//! `{"__type":"DateTime","value":"<ISO-8601>"}`.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
pub use serde_json::Value;
use serde_json::{Map, json};

/// Result of encoding one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    /// A JSON scalar carried unchanged.
    Primitive(Value),
    /// Structured JSON that decodes losslessly.
    Structured(Value),
    /// Textual last resort. Decoding, if possible at all, is lossy.
    Textual(String),
    /// The value could not be encoded at all. Persisting it is skipped.
    Failed(String),
}

impl Encoded {
    /// Whether this value took the textual fallback.
    #[must_use]
    pub fn is_textual(&self) -> bool {
        matches!(self, Self::Textual(_))
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The JSON to store. Textual output is logged as a degraded path; a
    /// failed encoding becomes `null`.
    #[must_use]
    pub fn into_json(self) -> Value {
        match self {
            Self::Primitive(value) | Self::Structured(value) => value,
            Self::Textual(text) => {
                tracing::warn!(len = text.len(), "serialization fallback: storing textual form");
                Value::String(text)
            }
            Self::Failed(message) => {
                tracing::warn!(error = %message, "encoding failed: storing null");
                Value::Null
            }
        }
    }
}

/// Opt-in serialization capability for persisted cells.
pub trait Persistable: Sized {
    fn encode(&self) -> Encoded;

    /// `None` when `value` does not describe a `Self`.
    fn decode(value: &Value) -> Option<Self>;
}

/// Structured encoding through `serde`. Used by [`persist_via_serde!`](crate::persist_via_serde).
pub fn encode_serde<T: Serialize>(value: &T) -> Encoded {
    match serde_json::to_value(value) {
        Ok(json) => Encoded::Structured(json),
        Err(err) => Encoded::Failed(format!("{}: {err}", std::any::type_name::<T>())),
    }
}

pub fn decode_serde<T: DeserializeOwned>(value: &Value) -> Option<T> {
    serde_json::from_value(value.clone()).ok()
}

impl Persistable for bool {
    fn encode(&self) -> Encoded {
        Encoded::Primitive(Value::Bool(*self))
    }

    fn decode(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

macro_rules! impl_signed {
    ($($ty:ty),+) => {$(
        impl Persistable for $ty {
            fn encode(&self) -> Encoded {
                Encoded::Primitive(json!(*self))
            }

            fn decode(value: &Value) -> Option<Self> {
                value.as_i64().and_then(|n| <$ty>::try_from(n).ok())
            }
        }
    )+};
}

macro_rules! impl_unsigned {
    ($($ty:ty),+) => {$(
        impl Persistable for $ty {
            fn encode(&self) -> Encoded {
                Encoded::Primitive(json!(*self))
            }

            fn decode(value: &Value) -> Option<Self> {
                value.as_u64().and_then(|n| <$ty>::try_from(n).ok())
            }
        }
    )+};
}

impl_signed!(i8, i16, i32, i64, isize);
impl_unsigned!(u8, u16, u32, u64, usize);

impl Persistable for f64 {
    fn encode(&self) -> Encoded {
        // Non-finite values have no JSON number form and encode as null.
        Encoded::Primitive(json!(*self))
    }

    fn decode(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl Persistable for f32 {
    fn encode(&self) -> Encoded {
        Encoded::Primitive(json!(f64::from(*self)))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode(value: &Value) -> Option<Self> {
        value.as_f64().map(|n| n as f32)
    }
}

impl Persistable for String {
    fn encode(&self) -> Encoded {
        Encoded::Primitive(Value::String(self.clone()))
    }

    fn decode(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl Persistable for DateTime<Utc> {
    fn encode(&self) -> Encoded {
        Encoded::Structured(json!({
            "__type": "DateTime",
            "value": self.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }))
    }

    fn decode(value: &Value) -> Option<Self> {
        if value.get("__type")?.as_str()? != "DateTime" {
            return None;
        }
        let text = value.get("value")?.as_str()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl<T: Persistable> Persistable for Option<T> {
    fn encode(&self) -> Encoded {
        match self {
            Some(inner) => inner.encode(),
            None => Encoded::Primitive(Value::Null),
        }
    }

    fn decode(value: &Value) -> Option<Self> {
        if value.is_null() {
            return Some(None);
        }
        T::decode(value).map(Some)
    }
}

impl<T: Persistable> Persistable for Vec<T> {
    fn encode(&self) -> Encoded {
        let mut items = Vec::with_capacity(self.len());
        for item in self {
            match item.encode() {
                Encoded::Failed(message) => return Encoded::Failed(message),
                encoded => items.push(encoded.into_json()),
            }
        }
        Encoded::Structured(Value::Array(items))
    }

    fn decode(value: &Value) -> Option<Self> {
        value.as_array()?.iter().map(T::decode).collect()
    }
}

fn encode_map<'a, T: Persistable + 'a>(entries: impl Iterator<Item = (&'a String, &'a T)>) -> Encoded {
    let mut map = Map::new();
    for (key, item) in entries {
        match item.encode() {
            Encoded::Failed(message) => return Encoded::Failed(format!("`{key}`: {message}")),
            encoded => {
                map.insert(key.clone(), encoded.into_json());
            }
        }
    }
    Encoded::Structured(Value::Object(map))
}

impl<T: Persistable> Persistable for BTreeMap<String, T> {
    fn encode(&self) -> Encoded {
        encode_map(self.iter())
    }

    fn decode(value: &Value) -> Option<Self> {
        value
            .as_object()?
            .iter()
            .map(|(key, item)| T::decode(item).map(|decoded| (key.clone(), decoded)))
            .collect()
    }
}

impl<T: Persistable, H: BuildHasher + Default> Persistable for HashMap<String, T, H> {
    fn encode(&self) -> Encoded {
        encode_map(self.iter())
    }

    fn decode(value: &Value) -> Option<Self> {
        value
            .as_object()?
            .iter()
            .map(|(key, item)| T::decode(item).map(|decoded| (key.clone(), decoded)))
            .collect()
    }
}

/// Implement [`Persistable`] through the type's `serde` impls.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Layout { split: f32 }
/// statewire_persist::persist_via_serde!(Layout);
/// ```
#[macro_export]
macro_rules! persist_via_serde {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::Persistable for $ty {
            fn encode(&self) -> $crate::Encoded {
                $crate::encode::encode_serde(self)
            }

            fn decode(value: &$crate::encode::Value) -> ::core::option::Option<Self> {
                $crate::encode::decode_serde(value)
            }
        }
    )+};
}

/// Implement [`Persistable`] through `Display` and `FromStr`. Logged as a
/// textual fallback on every save.
#[macro_export]
macro_rules! persist_via_display {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::Persistable for $ty {
            fn encode(&self) -> $crate::Encoded {
                $crate::Encoded::Textual(::std::string::ToString::to_string(self))
            }

            fn decode(value: &$crate::encode::Value) -> ::core::option::Option<Self> {
                value.as_str()?.parse().ok()
            }
        }
    )+};
}
