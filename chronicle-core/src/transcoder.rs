//! Canonical byte encoding for event payloads.
//!
//! The transcoder maps structured values to and from a self-describing
//! intermediate form (`serde_json::Value`) serialized as UTF-8 JSON. Values
//! that have no natural JSON representation are wrapped as
//! `{"_type_": tag, "_data_": ...}` using a registry of named
//! [`Transcoding`]s; decoding looks the tag up and unwraps the data.
//!
//! The contract is round-trip identity for every value built from
//! registered types. An unregistered tag is an [`EncodingError`] at write
//! time and a [`DecodingError`] at read time; neither is ever silently
//! ignored.

use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Key naming the codec of a wrapped value.
pub const TYPE_KEY: &str = "_type_";
/// Key holding the wrapped data.
pub const DATA_KEY: &str = "_data_";

/// Error raised when a value cannot be encoded to the canonical form.
///
/// Encoding failures indicate a schema bug and are fatal.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// No codec is registered under the requested tag.
    #[error("no transcoding registered for type tag `{0}`")]
    UnknownTranscoding(String),
    /// The value has no representation in the canonical form.
    #[error("value cannot be represented canonically: {0}")]
    Unrepresentable(String),
    /// Serialization to the intermediate form failed.
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Error raised when canonical bytes cannot be decoded.
///
/// Decoding failures indicate a schema bug or corrupt data and are fatal.
#[derive(Debug, Error)]
pub enum DecodingError {
    /// A wrapped value names a tag with no registered codec.
    #[error("unknown type tag `{found}`, expected one of {expected:?}")]
    UnknownTranscoding {
        found: String,
        expected: Vec<String>,
    },
    /// The payload is not valid canonical data.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Deserialization from the intermediate form failed.
    #[error("deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),
    /// A stored record carries a different topic than the requested type.
    #[error("stored topic `{found}` does not match `{expected}`")]
    TopicMismatch {
        expected: &'static str,
        found: String,
    },
    /// A stored record's topic is not part of the requested event set.
    #[error("unknown topic `{topic}`, expected one of {expected:?}")]
    UnknownTopic {
        topic: String,
        expected: &'static [&'static str],
    },
}

impl DecodingError {
    /// Build the error for a topic outside a sum type's closed set.
    #[must_use]
    pub fn unknown_topic(topic: &str, expected: &'static [&'static str]) -> Self {
        Self::UnknownTopic {
            topic: topic.to_string(),
            expected,
        }
    }
}

/// A named codec for one value representation.
///
/// `encode` maps the in-memory representation of a value to a JSON-native
/// one; `decode` inverts it. The `name` is the stable tag recorded in the
/// wrapped form, and the sole key readers use to find the codec again.
pub trait Transcoding: Send + Sync {
    /// Stable tag identifying this codec.
    fn name(&self) -> &'static str;

    /// Encode the raw representation into a JSON-native value.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::Unrepresentable`] when the value does not
    /// belong to this codec.
    fn encode(&self, data: &Value) -> Result<Value, EncodingError>;

    /// Decode a JSON-native value back into the raw representation.
    ///
    /// # Errors
    ///
    /// Returns [`DecodingError::Malformed`] when the data is not a valid
    /// encoding produced by this codec.
    fn decode(&self, data: &Value) -> Result<Value, DecodingError>;
}

/// Transcoding for UUIDs as hyphenated hex strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidAsHex;

impl Transcoding for UuidAsHex {
    fn name(&self) -> &'static str {
        "uuid_hex"
    }

    fn encode(&self, data: &Value) -> Result<Value, EncodingError> {
        match data {
            Value::String(s) => {
                let id = uuid::Uuid::parse_str(s)
                    .map_err(|e| EncodingError::Unrepresentable(format!("invalid uuid: {e}")))?;
                Ok(Value::String(id.hyphenated().to_string()))
            }
            other => Err(EncodingError::Unrepresentable(format!(
                "expected a uuid string, got {other}"
            ))),
        }
    }

    fn decode(&self, data: &Value) -> Result<Value, DecodingError> {
        match data {
            Value::String(s) => {
                uuid::Uuid::parse_str(s)
                    .map_err(|e| DecodingError::Malformed(format!("invalid uuid: {e}")))?;
                Ok(data.clone())
            }
            other => Err(DecodingError::Malformed(format!(
                "expected a uuid string, got {other}"
            ))),
        }
    }
}

/// Transcoding for timestamps as ISO-8601 / RFC 3339 strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct DatetimeAsIso;

impl Transcoding for DatetimeAsIso {
    fn name(&self) -> &'static str {
        "datetime_iso"
    }

    fn encode(&self, data: &Value) -> Result<Value, EncodingError> {
        match data {
            Value::String(s) => {
                let parsed = chrono::DateTime::parse_from_rfc3339(s).map_err(|e| {
                    EncodingError::Unrepresentable(format!("invalid datetime: {e}"))
                })?;
                Ok(Value::String(parsed.to_rfc3339()))
            }
            other => Err(EncodingError::Unrepresentable(format!(
                "expected a datetime string, got {other}"
            ))),
        }
    }

    fn decode(&self, data: &Value) -> Result<Value, DecodingError> {
        match data {
            Value::String(s) => {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map_err(|e| DecodingError::Malformed(format!("invalid datetime: {e}")))?;
                Ok(data.clone())
            }
            other => Err(DecodingError::Malformed(format!(
                "expected a datetime string, got {other}"
            ))),
        }
    }
}

/// Registry-backed transcoder producing canonical UTF-8 JSON bytes.
///
/// The transcoder is populated at startup and read-only afterwards, so it is
/// safe to share across threads.
#[derive(Default)]
pub struct JsonTranscoder {
    types: HashMap<&'static str, Box<dyn Transcoding>>,
}

impl JsonTranscoder {
    /// An empty transcoder with no registered codecs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transcoder with the built-in codecs ([`UuidAsHex`],
    /// [`DatetimeAsIso`]) registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut transcoder = Self::new();
        transcoder.register(UuidAsHex);
        transcoder.register(DatetimeAsIso);
        transcoder
    }

    /// Register a codec under its tag, replacing any previous registration.
    pub fn register<T: Transcoding + 'static>(&mut self, transcoding: T) {
        self.types.insert(transcoding.name(), Box::new(transcoding));
    }

    fn registered_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.types.keys().map(ToString::to_string).collect();
        tags.sort_unstable();
        tags
    }

    /// Wrap `data` in the canonical tagged form using the codec registered
    /// under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodingError::UnknownTranscoding`] if no codec is
    /// registered under `name`, or the codec's own error if the value does
    /// not belong to it.
    pub fn wrap(&self, name: &str, data: &Value) -> Result<Value, EncodingError> {
        let transcoding = self
            .types
            .get(name)
            .ok_or_else(|| EncodingError::UnknownTranscoding(name.to_string()))?;
        Ok(json!({ TYPE_KEY: name, DATA_KEY: transcoding.encode(data)? }))
    }

    /// Serialize a value to canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodingError`] if serialization fails.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodingError> {
        serde_json::to_vec(value).map_err(EncodingError::Serialize)
    }

    /// Parse canonical bytes into the intermediate form, unwrapping every
    /// tagged value through the registry.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodingError`] for malformed bytes or an unknown tag.
    pub fn decode_value(&self, bytes: &[u8]) -> Result<Value, DecodingError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(DecodingError::Deserialize)?;
        self.unwrap_tags(value)
    }

    /// Parse canonical bytes directly into a typed value.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodingError`] for malformed bytes, an unknown tag, or a
    /// shape mismatch.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, DecodingError> {
        let value = self.decode_value(bytes)?;
        serde_json::from_value(value).map_err(DecodingError::Deserialize)
    }

    fn unwrap_tags(&self, value: Value) -> Result<Value, DecodingError> {
        match value {
            Value::Object(map) => {
                if let (Some(Value::String(tag)), Some(data)) =
                    (map.get(TYPE_KEY), map.get(DATA_KEY))
                    && map.len() == 2
                {
                    let transcoding = self.types.get(tag.as_str()).ok_or_else(|| {
                        DecodingError::UnknownTranscoding {
                            found: tag.clone(),
                            expected: self.registered_tags(),
                        }
                    })?;
                    return transcoding.decode(data);
                }

                let mut unwrapped = Map::with_capacity(map.len());
                for (key, nested) in map {
                    unwrapped.insert(key, self.unwrap_tags(nested)?);
                }
                Ok(Value::Object(unwrapped))
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.unwrap_tags(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            leaf => Ok(leaf),
        }
    }
}

impl std::fmt::Debug for JsonTranscoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonTranscoder")
            .field("types", &self.registered_tags())
            .finish()
    }
}
