//! Shared test fixtures: a small event-sourced `World` aggregate.
//!
//! Used by this crate's unit tests and, behind the `test-util` feature, by
//! downstream integration suites. The aggregate keeps a history of things
//! that happened to it; commands emit events into a pending list which the
//! repository drains on save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    aggregate::Aggregate,
    event::{AggregateEvent, DomainEvent, StoredEvent},
    mapper::{Mapper, MapperError},
    transcoder::DecodingError,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldCreated {
    pub originator_id: Uuid,
    pub originator_version: u64,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for WorldCreated {
    const TOPIC: &'static str = "world.created";

    fn originator_id(&self) -> Uuid {
        self.originator_id
    }

    fn originator_version(&self) -> u64 {
        self.originator_version
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SomethingHappened {
    pub originator_id: Uuid,
    pub originator_version: u64,
    pub timestamp: DateTime<Utc>,
    pub what: String,
}

impl DomainEvent for SomethingHappened {
    const TOPIC: &'static str = "world.something-happened";

    fn originator_id(&self) -> Uuid {
        self.originator_id
    }

    fn originator_version(&self) -> u64 {
        self.originator_version
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// The closed event set of the `World` family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorldEvent {
    Created(WorldCreated),
    Happened(SomethingHappened),
}

impl AggregateEvent for WorldEvent {
    const TOPICS: &'static [&'static str] = &[WorldCreated::TOPIC, SomethingHappened::TOPIC];

    fn topic(&self) -> &'static str {
        match self {
            Self::Created(_) => WorldCreated::TOPIC,
            Self::Happened(_) => SomethingHappened::TOPIC,
        }
    }

    fn originator_id(&self) -> Uuid {
        match self {
            Self::Created(e) => e.originator_id,
            Self::Happened(e) => e.originator_id,
        }
    }

    fn originator_version(&self) -> u64 {
        match self {
            Self::Created(e) => e.originator_version,
            Self::Happened(e) => e.originator_version,
        }
    }

    fn to_stored(&self, mapper: &Mapper) -> Result<StoredEvent, MapperError> {
        match self {
            Self::Created(e) => mapper.to_stored(e),
            Self::Happened(e) => mapper.to_stored(e),
        }
    }

    fn from_stored(stored: &StoredEvent, mapper: &Mapper) -> Result<Self, MapperError> {
        match stored.topic.as_str() {
            WorldCreated::TOPIC => Ok(Self::Created(mapper.to_domain(stored)?)),
            SomethingHappened::TOPIC => Ok(Self::Happened(mapper.to_domain(stored)?)),
            other => Err(DecodingError::unknown_topic(other, Self::TOPICS).into()),
        }
    }
}

/// A world where things happen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    originator_id: Uuid,
    version: u64,
    pub history: Vec<String>,
    #[serde(skip)]
    pending: Vec<WorldEvent>,
}

impl World {
    /// Start a new world, emitting its created event.
    #[must_use]
    pub fn create() -> Self {
        let event = WorldEvent::Created(WorldCreated {
            originator_id: Uuid::new_v4(),
            originator_version: 1,
            timestamp: Utc::now(),
        });
        let mut world = <Self as Aggregate>::create(&event);
        world.pending.push(event);
        world
    }

    /// Record that something happened.
    pub fn make_it_so(&mut self, what: impl Into<String>) {
        let event = WorldEvent::Happened(SomethingHappened {
            originator_id: self.originator_id,
            originator_version: self.version + 1,
            timestamp: Utc::now(),
            what: what.into(),
        });
        self.apply(&event);
        self.pending.push(event);
    }
}

impl Aggregate for World {
    const TOPIC: &'static str = "world";

    type Event = WorldEvent;

    fn originator_id(&self) -> Uuid {
        self.originator_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn create(event: &WorldEvent) -> Self {
        let mut world = Self {
            originator_id: event.originator_id(),
            version: 0,
            history: Vec::new(),
            pending: Vec::new(),
        };
        world.apply(event);
        world
    }

    fn apply(&mut self, event: &WorldEvent) {
        match event {
            WorldEvent::Created(e) => {
                self.originator_id = e.originator_id;
            }
            WorldEvent::Happened(e) => {
                self.history.push(e.what.clone());
            }
        }
        self.version = event.originator_version();
    }

    fn collect_events(&mut self) -> Vec<WorldEvent> {
        std::mem::take(&mut self.pending)
    }
}

/// A `world.created` event for stream `id` at version 1.
#[must_use]
pub fn world_created(id: Uuid) -> WorldEvent {
    WorldEvent::Created(WorldCreated {
        originator_id: id,
        originator_version: 1,
        timestamp: Utc::now(),
    })
}

/// A `world.something-happened` event for stream `id`.
#[must_use]
pub fn world_event(id: Uuid, version: u64, what: &str) -> WorldEvent {
    WorldEvent::Happened(SomethingHappened {
        originator_id: id,
        originator_version: version,
        timestamp: Utc::now(),
        what: what.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_emit_pending_events_with_sequential_versions() {
        let mut world = World::create();
        world.make_it_so("dinosaurs");
        world.make_it_so("trucks");

        assert_eq!(world.version(), 3);
        assert_eq!(world.history, vec!["dinosaurs", "trucks"]);

        let events = world.collect_events();
        let versions: Vec<u64> = events.iter().map(AggregateEvent::originator_version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(world.collect_events().is_empty());
    }

    #[test]
    fn folding_collected_events_reproduces_the_state() {
        let mut world = World::create();
        world.make_it_so("dinosaurs");
        world.make_it_so("trucks");
        let expected_history = world.history.clone();
        let events = world.collect_events();

        let mut replayed: Option<World> = None;
        for event in &events {
            match replayed.as_mut() {
                Some(state) => state.apply(event),
                None => replayed = Some(<World as Aggregate>::create(event)),
            }
        }

        let replayed = replayed.unwrap();
        assert_eq!(replayed.history, expected_history);
        assert_eq!(replayed.version(), 3);
    }
}
