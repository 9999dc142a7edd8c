//! The transactional backend contract.
//!
//! A recorder owns the two persisted tables of the core — stored events and
//! snapshots — and assigns globally monotonic notification ids at commit.
//! Three interchangeable implementations exist: the in-memory reference
//! backend in [`inmemory`], the embedded SQLite backend
//! (`chronicle-sqlite`), and the client-server PostgreSQL backend
//! (`chronicle-postgres`).
//!
//! # Contract
//!
//! - [`insert_events`](Recorder::insert_events) appends a non-empty batch
//!   atomically: either every event is durably present with its assigned
//!   notification id, or none is. Ids come from a single global counter and
//!   each committed batch occupies a contiguous block.
//! - A duplicate `(originator_id, originator_version)` — the optimistic
//!   concurrency check — fails the whole batch with
//!   [`InsertError::Conflict`]. Everything else is
//!   [`InsertError::Operation`].
//! - [`select_notifications`](Recorder::select_notifications) only returns
//!   committed rows; ids below
//!   [`max_notification_id`](Recorder::max_notification_id) that are not
//!   yet visible belong to in-flight or aborted transactions and may appear
//!   later (or never). The notification log reader deals with those holes.

use std::future::Future;

use nonempty::NonEmpty;
use thiserror::Error;
use uuid::Uuid;

use crate::event::{Notification, StoredEvent};

/// A write-write conflict detected by the uniqueness constraint on
/// `(originator_id, originator_version)`.
///
/// The losing writer is expected to reload the aggregate and retry at the
/// application level; the core attempts no retries of its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "record conflict: version {originator_version} of stream {originator_id} is already stored \
     (hint: reload the aggregate and retry)"
)]
pub struct RecordConflict {
    pub originator_id: Uuid,
    pub originator_version: u64,
}

impl RecordConflict {
    /// Attribute a backend-reported conflict to an attempted batch.
    ///
    /// SQL backends learn of the collision from the database's unique-key
    /// violation, which does not say which row collided; the head of the
    /// batch identifies the attempted write.
    #[must_use]
    pub fn for_batch(batch: &NonEmpty<StoredEvent>) -> Self {
        Self {
            originator_id: batch.head.originator_id,
            originator_version: batch.head.originator_version,
        }
    }
}

/// Error from an append operation.
#[derive(Debug, Error)]
pub enum InsertError<E>
where
    E: std::error::Error,
{
    /// Optimistic-concurrency failure; no row was written.
    #[error(transparent)]
    Conflict(#[from] RecordConflict),
    /// Backend failure: I/O, lost connection, timeout. The write may or may
    /// not have committed; the caller reconciles via a read.
    #[error("persistence operation failed: {0}")]
    Operation(#[source] E),
}

/// Check an append batch for internal duplicates before touching a backend.
///
/// # Errors
///
/// Returns the first duplicated `(originator_id, originator_version)` pair
/// as a [`RecordConflict`].
pub fn check_batch(batch: &NonEmpty<StoredEvent>) -> Result<(), RecordConflict> {
    let mut seen = std::collections::HashSet::with_capacity(batch.len());
    for event in batch {
        if !seen.insert((event.originator_id, event.originator_version)) {
            return Err(RecordConflict {
                originator_id: event.originator_id,
                originator_version: event.originator_version,
            });
        }
    }
    Ok(())
}

/// Transactional append and range query over the two persisted tables.
///
/// All methods may block on I/O; implementations provide their own internal
/// write serialization and are safe for concurrent calls.
pub trait Recorder: Send + Sync {
    /// Backend-specific operational error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append a batch of stored events in one transaction and return the
    /// notification ids assigned to it, in batch order.
    ///
    /// # Errors
    ///
    /// Returns [`InsertError::Conflict`] if any `(originator_id,
    /// originator_version)` already exists (no row is written), or
    /// [`InsertError::Operation`] on backend failure.
    fn insert_events(
        &self,
        batch: NonEmpty<StoredEvent>,
    ) -> impl Future<Output = Result<Vec<u64>, InsertError<Self::Error>>> + Send;

    /// Read a stream's stored events, filtered by version range, in
    /// ascending (or descending) version order, optionally limited.
    ///
    /// `gt` and `lte` bound the `originator_version`; the limit applies
    /// after ordering, so `desc` + `limit` reads the latest events.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the query fails.
    fn select_events(
        &self,
        originator_id: Uuid,
        gt: Option<u64>,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send;

    /// Read up to `limit` committed notifications with `id >= start` (and
    /// `id <= stop`, when given), ordered by id.
    ///
    /// A notification, once returned, is never returned with different
    /// content.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the query fails.
    fn select_notifications(
        &self,
        start: u64,
        limit: usize,
        stop: Option<u64>,
    ) -> impl Future<Output = Result<Vec<Notification>, Self::Error>> + Send;

    /// The greatest committed notification id, or 0 when the store is
    /// empty.
    ///
    /// Callers must not assume every id at or below this value is visible;
    /// see the module docs.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the query fails.
    fn max_notification_id(&self) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    /// Insert or replace a snapshot record.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the write fails.
    fn insert_snapshot(
        &self,
        snapshot: StoredEvent,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Read a stream's snapshots, filtered by version bound, newest first
    /// by default.
    ///
    /// # Errors
    ///
    /// Returns a backend error when the query fails.
    fn select_snapshots(
        &self,
        originator_id: Uuid,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<StoredEvent>, Self::Error>> + Send;
}

pub mod inmemory;
