//! Aggregate reconstruction and persistence.
//!
//! The repository folds a stream's events onto the latest qualifying
//! snapshot to produce the aggregate at the requested version:
//!
//! 1. Look up the highest snapshot at or below the requested version (when
//!    snapshotting is configured).
//! 2. Load events with `gt = snapshot version`, `lte = requested version`.
//! 3. Fold: the first event of a fresh stream constructs the aggregate via
//!    [`Aggregate::create`]; every further event goes through
//!    [`Aggregate::apply`].
//! 4. If neither snapshot nor events exist, the aggregate is unknown.
//!
//! Repositories are stateless factories: they hold no references to
//! aggregate instances between requests; the caller owns the aggregate's
//! lifetime.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    aggregate::Aggregate,
    recorder::Recorder,
    snapshot::SnapshotStore,
    store::{EventStore, StoreError},
};

/// No stored history exists for the requested stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("aggregate {originator_id} not found")]
pub struct AggregateNotFound {
    pub originator_id: Uuid,
}

/// Error from repository loads.
#[derive(Debug, Error)]
pub enum RepositoryError<E>
where
    E: std::error::Error,
{
    #[error(transparent)]
    NotFound(#[from] AggregateNotFound),
    #[error(transparent)]
    Store(#[from] StoreError<E>),
}

/// Reconstructs aggregates of one family from their stored history.
pub struct Repository<A, R> {
    events: EventStore<R>,
    snapshots: Option<SnapshotStore<R>>,
    _aggregate: std::marker::PhantomData<fn() -> A>,
}

impl<A, R> Repository<A, R> {
    #[must_use]
    pub const fn new(events: EventStore<R>) -> Self {
        Self {
            events,
            snapshots: None,
            _aggregate: std::marker::PhantomData,
        }
    }

    /// Enable snapshot-based loading and [`take_snapshot`].
    ///
    /// [`take_snapshot`]: Self::take_snapshot
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: SnapshotStore<R>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    #[must_use]
    pub const fn event_store(&self) -> &EventStore<R> {
        &self.events
    }
}

impl<A, R> Repository<A, R>
where
    A: Aggregate,
    R: Recorder,
{
    /// Reconstruct the aggregate at its latest version.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] when no history exists, or a
    /// [`StoreError`] when loading or decoding fails.
    pub async fn get(&self, originator_id: Uuid) -> Result<A, RepositoryError<R::Error>>
    where
        A: DeserializeOwned,
    {
        self.reconstruct(originator_id, None).await
    }

    /// Reconstruct the aggregate as it was at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] when no history exists at or
    /// below `version`, or a [`StoreError`] when loading or decoding fails.
    pub async fn get_at(
        &self,
        originator_id: Uuid,
        version: u64,
    ) -> Result<A, RepositoryError<R::Error>>
    where
        A: DeserializeOwned,
    {
        self.reconstruct(originator_id, Some(version)).await
    }

    #[tracing::instrument(skip(self), fields(topic = A::TOPIC))]
    async fn reconstruct(
        &self,
        originator_id: Uuid,
        at: Option<u64>,
    ) -> Result<A, RepositoryError<R::Error>>
    where
        A: DeserializeOwned,
    {
        let base = match &self.snapshots {
            Some(snapshots) => snapshots.get::<A>(originator_id, at).await?,
            None => None,
        };

        let gt = base.as_ref().map(|(_, version)| *version);
        let events: Vec<A::Event> = self.events.get(originator_id, gt, at, false, None).await?;

        tracing::debug!(
            from_snapshot = gt,
            events_to_replay = events.len(),
            "reconstructing aggregate"
        );

        let mut aggregate = base.map(|(aggregate, _)| aggregate);
        for event in &events {
            match aggregate.as_mut() {
                Some(state) => state.apply(event),
                None => aggregate = Some(A::create(event)),
            }
        }

        aggregate.ok_or_else(|| AggregateNotFound { originator_id }.into())
    }

    /// Collect the aggregate's pending events and append them atomically,
    /// returning the assigned notification ids.
    ///
    /// On [`StoreError::Conflict`] the aggregate's history moved underneath
    /// the caller; reload and retry at the application level.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when mapping or persistence fails.
    pub async fn save(&self, aggregate: &mut A) -> Result<Vec<u64>, StoreError<R::Error>> {
        let events = aggregate.collect_events();
        self.events.put(&events).await
    }

    /// Snapshot the aggregate at its current version.
    ///
    /// Returns `false` (and stores nothing) when the repository was built
    /// without a snapshot store.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when encoding or persistence fails.
    pub async fn take_snapshot(&self, aggregate: &A) -> Result<bool, StoreError<R::Error>>
    where
        A: Serialize,
    {
        match &self.snapshots {
            Some(snapshots) => {
                snapshots.put(aggregate).await?;
                Ok(true)
            }
            None => {
                tracing::trace!(topic = A::TOPIC, "snapshotting disabled, skipping");
                Ok(false)
            }
        }
    }
}
