//! The event store facade: mapper and recorder composed.
//!
//! `put` maps each domain event to its stored form and appends the batch
//! atomically; `get` selects a stream's stored events and materializes them
//! back through the mapper, upcasting as needed. Conflicts surface as
//! [`StoreError::Conflict`], the optimistic-concurrency signal callers
//! react to by reloading and retrying.

use nonempty::NonEmpty;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::AggregateEvent,
    mapper::{Mapper, MapperError},
    recorder::{InsertError, RecordConflict, Recorder},
};

/// Error from event store operations.
#[derive(Debug, Error)]
pub enum StoreError<E>
where
    E: std::error::Error,
{
    /// Optimistic-concurrency failure: reload and retry.
    #[error(transparent)]
    Conflict(#[from] RecordConflict),
    /// An event could not be packed or materialized.
    #[error(transparent)]
    Mapper(#[from] MapperError),
    /// Backend failure.
    #[error("persistence operation failed: {0}")]
    Operation(#[source] E),
}

impl<E: std::error::Error> From<InsertError<E>> for StoreError<E> {
    fn from(error: InsertError<E>) -> Self {
        match error {
            InsertError::Conflict(conflict) => Self::Conflict(conflict),
            InsertError::Operation(source) => Self::Operation(source),
        }
    }
}

/// Facade over a mapper and a recorder.
#[derive(Clone, Debug)]
pub struct EventStore<R> {
    mapper: Mapper,
    recorder: R,
}

impl<R> EventStore<R> {
    #[must_use]
    pub const fn new(mapper: Mapper, recorder: R) -> Self {
        Self { mapper, recorder }
    }

    #[must_use]
    pub const fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    #[must_use]
    pub const fn recorder(&self) -> &R {
        &self.recorder
    }
}

impl<R: Recorder> EventStore<R> {
    /// Map and append a batch of domain events atomically, returning the
    /// assigned notification ids. An empty batch is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when another writer already stored
    /// one of the versions, [`StoreError::Mapper`] when an event cannot be
    /// encoded, or [`StoreError::Operation`] on backend failure.
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn put<E: AggregateEvent>(
        &self,
        events: &[E],
    ) -> Result<Vec<u64>, StoreError<R::Error>> {
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            stored.push(event.to_stored(&self.mapper)?);
        }

        let Some(batch) = NonEmpty::from_vec(stored) else {
            tracing::trace!("no pending events to store");
            return Ok(Vec::new());
        };

        let ids = self.recorder.insert_events(batch).await?;
        tracing::debug!(assigned = ?ids, "events stored");
        Ok(ids)
    }

    /// Read a stream's events, materialized through the mapper.
    ///
    /// `gt`/`lte` bound the versions; `desc` + `limit` reads the latest
    /// events first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Mapper`] when a stored record cannot be
    /// materialized, or [`StoreError::Operation`] on backend failure.
    #[tracing::instrument(skip(self))]
    pub async fn get<E: AggregateEvent>(
        &self,
        originator_id: Uuid,
        gt: Option<u64>,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<E>, StoreError<R::Error>> {
        let stored = self
            .recorder
            .select_events(originator_id, gt, lte, desc, limit)
            .await
            .map_err(StoreError::Operation)?;

        stored
            .iter()
            .map(|record| E::from_stored(record, &self.mapper).map_err(StoreError::from))
            .collect()
    }
}
