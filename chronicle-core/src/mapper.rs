//! Packing domain events into stored records and unpacking them.
//!
//! The mapper composes the byte pipeline: at write time
//! `transcode -> compress? -> encrypt?`, at read time the inverse followed
//! by upcasting. It also chooses the stored topic (the event type's
//! canonical name) and lifts the `originator_id` / `originator_version`
//! attributes out of the payload into stored-event columns, injecting them
//! back when materializing.
//!
//! The mapper is stateless between events and cheap to clone; all parts are
//! shared behind `Arc`s and safe for concurrent use.

use std::{borrow::Cow, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    cipher::{Cipher, CipherError},
    compress::Compressor,
    event::{DomainEvent, StoredEvent},
    transcoder::{DecodingError, EncodingError, JsonTranscoder},
    upcast::{UpcastError, UpcasterRegistry},
};

/// Reserved payload key recording the schema version at write time.
///
/// The mapper owns this key: it is stripped before upcasters run and never
/// reaches materialized events. A payload without it is version 1.
const SCHEMA_KEY: &str = "_schema_";

const ORIGINATOR_ID_KEY: &str = "originator_id";
const ORIGINATOR_VERSION_KEY: &str = "originator_version";

/// Error raised while packing or unpacking a stored event.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Decoding(#[from] DecodingError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Upcast(#[from] UpcastError),
}

/// Bidirectional mapping between domain events and stored records.
#[derive(Clone)]
pub struct Mapper {
    transcoder: Arc<JsonTranscoder>,
    compressor: Option<Arc<dyn Compressor>>,
    cipher: Option<Arc<dyn Cipher>>,
    upcasters: Arc<UpcasterRegistry>,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new(JsonTranscoder::with_defaults())
    }
}

impl Mapper {
    /// A mapper over the given transcoder, with no compression, no
    /// encryption, and no upcasters.
    #[must_use]
    pub fn new(transcoder: JsonTranscoder) -> Self {
        Self {
            transcoder: Arc::new(transcoder),
            compressor: None,
            cipher: None,
            upcasters: Arc::new(UpcasterRegistry::new()),
        }
    }

    /// Enable a compression stage.
    #[must_use]
    pub fn with_compressor<C: Compressor + 'static>(mut self, compressor: C) -> Self {
        self.compressor = Some(Arc::new(compressor));
        self
    }

    /// Enable an encryption stage.
    #[must_use]
    pub fn with_cipher<C: Cipher + 'static>(mut self, cipher: C) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Install the upcaster registry consulted on read.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterRegistry) -> Self {
        self.upcasters = Arc::new(upcasters);
        self
    }

    #[must_use]
    pub fn transcoder(&self) -> &JsonTranscoder {
        &self.transcoder
    }

    /// Pack a domain event into its stored representation.
    ///
    /// # Errors
    ///
    /// Returns a [`MapperError`] if the event cannot be encoded.
    pub fn to_stored<E: DomainEvent>(&self, event: &E) -> Result<StoredEvent, MapperError> {
        let value = serde_json::to_value(event).map_err(EncodingError::Serialize)?;
        let Value::Object(mut attrs) = value else {
            return Err(EncodingError::Unrepresentable(
                "event payload must serialize to an object".to_string(),
            )
            .into());
        };

        attrs.remove(ORIGINATOR_ID_KEY);
        attrs.remove(ORIGINATOR_VERSION_KEY);
        attrs.insert(SCHEMA_KEY.to_string(), json!(E::SCHEMA_VERSION));

        let state = self.write_pipeline(&Value::Object(attrs))?;
        Ok(StoredEvent {
            originator_id: event.originator_id(),
            originator_version: event.originator_version(),
            topic: E::TOPIC.to_string(),
            state,
        })
    }

    /// Materialize a domain event from its stored representation, upcasting
    /// older payloads to the current schema.
    ///
    /// # Errors
    ///
    /// Returns a [`MapperError`] if the stored topic does not match `E`, the
    /// byte pipeline cannot be inverted, or the payload cannot be upcast or
    /// deserialized.
    pub fn to_domain<E: DomainEvent>(&self, stored: &StoredEvent) -> Result<E, MapperError> {
        if stored.topic != E::TOPIC {
            return Err(DecodingError::TopicMismatch {
                expected: E::TOPIC,
                found: stored.topic.clone(),
            }
            .into());
        }

        let mut value = self.read_pipeline(&stored.state)?;
        let attrs = value.as_object_mut().ok_or_else(|| {
            DecodingError::Malformed("stored payload is not an object".to_string())
        })?;

        let recorded = attrs
            .remove(SCHEMA_KEY)
            .as_ref()
            .and_then(Value::as_u64)
            .map_or(1, |v| u32::try_from(v).unwrap_or(u32::MAX));

        if recorded > E::SCHEMA_VERSION {
            return Err(DecodingError::Malformed(format!(
                "stored schema version {recorded} of `{}` is newer than the supported version {}",
                stored.topic,
                E::SCHEMA_VERSION
            ))
            .into());
        }

        let mut value = if recorded < E::SCHEMA_VERSION {
            tracing::debug!(
                topic = %stored.topic,
                from = recorded,
                to = E::SCHEMA_VERSION,
                "upcasting stored payload"
            );
            self.upcasters
                .upcast(&stored.topic, recorded, E::SCHEMA_VERSION, value)?
        } else {
            value
        };

        let attrs = value.as_object_mut().ok_or_else(|| {
            DecodingError::Malformed("upcast payload is not an object".to_string())
        })?;
        attrs.insert(
            ORIGINATOR_ID_KEY.to_string(),
            Value::String(stored.originator_id.to_string()),
        );
        attrs.insert(
            ORIGINATOR_VERSION_KEY.to_string(),
            json!(stored.originator_version),
        );

        serde_json::from_value(value)
            .map_err(DecodingError::Deserialize)
            .map_err(MapperError::from)
    }

    /// Pack an arbitrary value (a snapshot) under an explicit topic and
    /// stream position, through the same byte pipeline as events.
    ///
    /// # Errors
    ///
    /// Returns a [`MapperError`] if the value cannot be encoded.
    pub fn pack<T: Serialize>(
        &self,
        topic: &str,
        originator_id: Uuid,
        originator_version: u64,
        value: &T,
    ) -> Result<StoredEvent, MapperError> {
        let value = serde_json::to_value(value).map_err(EncodingError::Serialize)?;
        let state = self.write_pipeline(&value)?;
        Ok(StoredEvent {
            originator_id,
            originator_version,
            topic: topic.to_string(),
            state,
        })
    }

    /// Invert [`pack`](Self::pack).
    ///
    /// # Errors
    ///
    /// Returns a [`MapperError`] if the stored topic does not match or the
    /// payload cannot be decoded.
    pub fn unpack<T: DeserializeOwned>(
        &self,
        expected_topic: &'static str,
        stored: &StoredEvent,
    ) -> Result<T, MapperError> {
        if stored.topic != expected_topic {
            return Err(DecodingError::TopicMismatch {
                expected: expected_topic,
                found: stored.topic.clone(),
            }
            .into());
        }

        let value = self.read_pipeline(&stored.state)?;
        serde_json::from_value(value)
            .map_err(DecodingError::Deserialize)
            .map_err(MapperError::from)
    }

    fn write_pipeline(&self, value: &Value) -> Result<Vec<u8>, MapperError> {
        let bytes = self.transcoder.encode(value)?;
        let bytes = match &self.compressor {
            Some(compressor) => compressor.compress(&bytes),
            None => bytes,
        };
        Ok(match &self.cipher {
            Some(cipher) => cipher.encrypt(&bytes),
            None => bytes,
        })
    }

    fn read_pipeline(&self, state: &[u8]) -> Result<Value, MapperError> {
        let bytes: Cow<'_, [u8]> = match &self.cipher {
            Some(cipher) => Cow::Owned(cipher.decrypt(state)?),
            None => Cow::Borrowed(state),
        };
        let bytes: Cow<'_, [u8]> = match &self.compressor {
            Some(compressor) => Cow::Owned(compressor.decompress(&bytes).map_err(|e| {
                DecodingError::Malformed(format!("decompression failed: {e}"))
            })?),
            None => bytes,
        };
        Ok(self.transcoder.decode_value(&bytes)?)
    }
}

impl std::fmt::Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("compression", &self.compressor.is_some())
            .field("encryption", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}
