//! Domain event contracts and stored-event wire records.
//!
//! `DomainEvent` is the trait every concrete event struct implements; it
//! intentionally avoids persistence concerns beyond naming its topic and
//! schema version. `AggregateEvent` is the closed sum of one aggregate
//! family's event types and carries the topic dispatch used when reading
//! records back. Serialization itself is handled by the [`mapper`].
//!
//! [`mapper`]: crate::mapper

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::mapper::{Mapper, MapperError};

/// A concrete, immutable fact about what happened to an aggregate.
///
/// Each event type carries a unique [`Self::TOPIC`] identifying it on disk,
/// and a [`Self::SCHEMA_VERSION`] that the mapper records inside the stored
/// payload so older payloads can be upcast on read.
///
/// The serde representation of an event must be a JSON object whose fields
/// include `originator_id` and `originator_version`; the mapper lifts those
/// two attributes out of the payload into stored-event columns and injects
/// them back when materializing.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Canonical name of this event type, recorded on disk.
    ///
    /// Topics are the stable identifier of an event class. Renaming a type
    /// requires keeping its old topic.
    const TOPIC: &'static str;

    /// Schema version of this event type's payload. Bump it when the
    /// attribute layout changes and register an upcaster for the transition.
    const SCHEMA_VERSION: u32 = 1;

    /// Identifier of the stream this event belongs to.
    fn originator_id(&self) -> Uuid;

    /// 1-based position of this event within its stream.
    fn originator_version(&self) -> u64;

    /// Creation time of the event.
    fn timestamp(&self) -> DateTime<Utc>;
}

/// The closed set of event types belonging to one aggregate family.
///
/// Implemented by an event enum whose variants each wrap a [`DomainEvent`].
/// The implementation routes stored records back to the correct variant by
/// topic when rebuilding aggregates:
///
/// ```ignore
/// impl AggregateEvent for WorldEvent {
///     const TOPICS: &'static [&'static str] = &[WorldCreated::TOPIC, SomethingHappened::TOPIC];
///
///     fn from_stored(stored: &StoredEvent, mapper: &Mapper) -> Result<Self, MapperError> {
///         match stored.topic.as_str() {
///             WorldCreated::TOPIC => Ok(Self::Created(mapper.to_domain(stored)?)),
///             SomethingHappened::TOPIC => Ok(Self::Happened(mapper.to_domain(stored)?)),
///             other => Err(DecodingError::unknown_topic(other, Self::TOPICS).into()),
///         }
///     }
///     // ...
/// }
/// ```
pub trait AggregateEvent: Sized + Send + Sync {
    /// The topics this sum type can materialize.
    const TOPICS: &'static [&'static str];

    /// Topic of this event instance.
    fn topic(&self) -> &'static str;

    /// Identifier of the stream this event belongs to.
    fn originator_id(&self) -> Uuid;

    /// 1-based position of this event within its stream.
    fn originator_version(&self) -> u64;

    /// Pack this event into its stored representation.
    ///
    /// # Errors
    ///
    /// Returns a [`MapperError`] if the payload cannot be encoded.
    fn to_stored(&self, mapper: &Mapper) -> Result<StoredEvent, MapperError>;

    /// Materialize an event from its stored representation.
    ///
    /// # Errors
    ///
    /// Returns a [`MapperError`] if the topic is not recognized or the
    /// payload cannot be decoded.
    fn from_stored(stored: &StoredEvent, mapper: &Mapper) -> Result<Self, MapperError>;
}

/// The on-disk unit: one event, mapped to an opaque payload.
///
/// `(originator_id, originator_version)` is unique across the whole store.
/// Once written, a stored event is never mutated or deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEvent {
    pub originator_id: Uuid,
    pub originator_version: u64,
    /// Canonical name of the event (or snapshot) class.
    pub topic: String,
    /// Opaque payload produced by the mapper pipeline.
    pub state: Vec<u8>,
}

/// One entry of the globally ordered notification log.
///
/// `id` is assigned by the recorder at commit time from a single global
/// counter; committed ids are strictly increasing and each committed batch
/// occupies a contiguous block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub originator_id: Uuid,
    pub originator_version: u64,
    pub topic: String,
    pub state: Vec<u8>,
}

impl Notification {
    /// Pair a stored event with its assigned notification id.
    #[must_use]
    pub fn from_stored(id: u64, stored: &StoredEvent) -> Self {
        Self {
            id,
            originator_id: stored.originator_id,
            originator_version: stored.originator_version,
            topic: stored.topic.clone(),
            state: stored.state.clone(),
        }
    }
}
