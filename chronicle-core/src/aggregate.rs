//! The aggregate contract consumed by the repository.
//!
//! Aggregates themselves are transient: reconstituted per request by
//! folding events, never persisted as such. This module only defines the
//! interface the persistence core consumes; how applications author
//! aggregates (command methods, event constructors) is their own business.

use uuid::Uuid;

use crate::event::AggregateEvent;

/// A consistency boundary: a stream of events identified by a stable id
/// with a monotonic per-stream version.
///
/// An aggregate accumulates the events it emits in a pending list; the
/// repository drains that list on save via
/// [`collect_events`](Self::collect_events) and replays stored history
/// through [`create`](Self::create) and [`apply`](Self::apply) on load.
///
/// The version of the next emitted event is the loaded version plus one
/// plus its index within the pending batch; the recorder's uniqueness
/// constraint turns concurrent writers at the same loaded version into
/// exactly one winner.
pub trait Aggregate: Sized + Send {
    /// Canonical name identifying this aggregate's snapshots on disk.
    const TOPIC: &'static str;

    /// The closed sum of this aggregate family's event types.
    type Event: AggregateEvent;

    /// Identifier of this aggregate's stream.
    fn originator_id(&self) -> Uuid;

    /// Version of the last event applied to this instance.
    fn version(&self) -> u64;

    /// Construct the initial state from the stream's first event.
    fn create(event: &Self::Event) -> Self;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Self::Event);

    /// Return the pending events emitted since the last save, clearing the
    /// list.
    fn collect_events(&mut self) -> Vec<Self::Event>;
}
