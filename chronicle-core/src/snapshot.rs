//! Snapshot persistence for optimized aggregate loading.
//!
//! A snapshot is structurally a stored event living in its own namespace:
//! its topic names the aggregate class and its state encodes the full
//! aggregate at some version, packed through the same byte pipeline as
//! events. A snapshot at version V is semantically equivalent to folding
//! events 1..=V from empty.
//!
//! The decision of *when* to snapshot belongs to the application; the core
//! only stores and retrieves them.

use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{
    aggregate::Aggregate,
    mapper::Mapper,
    recorder::Recorder,
    store::StoreError,
};

/// Facade over the recorder's snapshot namespace.
#[derive(Clone, Debug)]
pub struct SnapshotStore<R> {
    mapper: Mapper,
    recorder: R,
}

impl<R> SnapshotStore<R> {
    #[must_use]
    pub const fn new(mapper: Mapper, recorder: R) -> Self {
        Self { mapper, recorder }
    }
}

impl<R: Recorder> SnapshotStore<R> {
    /// Store a snapshot of the aggregate at its current version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Mapper`] when the aggregate cannot be encoded,
    /// or [`StoreError::Operation`] on backend failure.
    #[tracing::instrument(skip(self, aggregate), fields(topic = A::TOPIC))]
    pub async fn put<A>(&self, aggregate: &A) -> Result<(), StoreError<R::Error>>
    where
        A: Aggregate + Serialize,
    {
        let stored = self.mapper.pack(
            A::TOPIC,
            aggregate.originator_id(),
            aggregate.version(),
            aggregate,
        )?;

        tracing::debug!(
            originator_id = %stored.originator_id,
            originator_version = stored.originator_version,
            "snapshot stored"
        );
        self.recorder
            .insert_snapshot(stored)
            .await
            .map_err(StoreError::Operation)
    }

    /// Load the newest snapshot with `originator_version <= lte` (or the
    /// newest overall), returning the aggregate and the version it was
    /// taken at.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Mapper`] when the snapshot cannot be decoded,
    /// or [`StoreError::Operation`] on backend failure.
    #[tracing::instrument(skip(self), fields(topic = A::TOPIC))]
    pub async fn get<A>(
        &self,
        originator_id: Uuid,
        lte: Option<u64>,
    ) -> Result<Option<(A, u64)>, StoreError<R::Error>>
    where
        A: Aggregate + DeserializeOwned,
    {
        let mut rows = self
            .recorder
            .select_snapshots(originator_id, lte, true, Some(1))
            .await
            .map_err(StoreError::Operation)?;

        let Some(stored) = rows.pop() else {
            tracing::trace!("no snapshot found");
            return Ok(None);
        };

        let version = stored.originator_version;
        let aggregate = self.mapper.unpack(A::TOPIC, &stored)?;
        tracing::trace!(version, "snapshot loaded");
        Ok(Some((aggregate, version)))
    }
}
