//! In-memory recorder for tests and examples.
//!
//! Keeps streams in a hash map behind a single lock. Notification ids come
//! from a plain monotonic counter, so ordering is deterministic and ids are
//! always contiguous — there are no in-flight gaps to worry about.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    event::{Notification, StoredEvent},
    recorder::{InsertError, RecordConflict, Recorder, check_batch},
};

/// Thread-safe in-memory implementation of [`Recorder`].
#[derive(Clone, Default)]
pub struct InMemoryRecorder {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<Uuid, Vec<StoredEvent>>,
    notifications: Vec<Notification>,
    snapshots: HashMap<Uuid, Vec<StoredEvent>>,
    next_notification_id: u64,
}

impl InMemoryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRecorder").finish_non_exhaustive()
    }
}

fn select_versions(
    rows: &[StoredEvent],
    gt: Option<u64>,
    lte: Option<u64>,
    desc: bool,
    limit: Option<usize>,
) -> Vec<StoredEvent> {
    let mut selected: Vec<StoredEvent> = rows
        .iter()
        .filter(|e| gt.is_none_or(|gt| e.originator_version > gt))
        .filter(|e| lte.is_none_or(|lte| e.originator_version <= lte))
        .cloned()
        .collect();

    selected.sort_by_key(|e| e.originator_version);
    if desc {
        selected.reverse();
    }
    if let Some(limit) = limit {
        selected.truncate(limit);
    }
    selected
}

impl Recorder for InMemoryRecorder {
    type Error = Infallible;

    #[tracing::instrument(skip(self, batch), fields(event_count = batch.len()))]
    async fn insert_events(
        &self,
        batch: NonEmpty<StoredEvent>,
    ) -> Result<Vec<u64>, InsertError<Self::Error>> {
        check_batch(&batch)?;

        let mut inner = self.inner.write().expect("in-memory recorder lock poisoned");

        for event in &batch {
            let exists = inner.streams.get(&event.originator_id).is_some_and(|s| {
                s.iter()
                    .any(|e| e.originator_version == event.originator_version)
            });
            if exists {
                return Err(RecordConflict {
                    originator_id: event.originator_id,
                    originator_version: event.originator_version,
                }
                .into());
            }
        }

        let mut ids = Vec::with_capacity(batch.len());
        for event in batch {
            inner.next_notification_id += 1;
            let id = inner.next_notification_id;
            ids.push(id);
            inner
                .notifications
                .push(Notification::from_stored(id, &event));
            inner
                .streams
                .entry(event.originator_id)
                .or_default()
                .push(event);
        }

        drop(inner);
        tracing::debug!(assigned = ?ids, "events recorded");
        Ok(ids)
    }

    async fn select_events(
        &self,
        originator_id: Uuid,
        gt: Option<u64>,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        let inner = self.inner.read().expect("in-memory recorder lock poisoned");
        Ok(inner
            .streams
            .get(&originator_id)
            .map(|rows| select_versions(rows, gt, lte, desc, limit))
            .unwrap_or_default())
    }

    async fn select_notifications(
        &self,
        start: u64,
        limit: usize,
        stop: Option<u64>,
    ) -> Result<Vec<Notification>, Self::Error> {
        let inner = self.inner.read().expect("in-memory recorder lock poisoned");
        Ok(inner
            .notifications
            .iter()
            .filter(|n| n.id >= start)
            .filter(|n| stop.is_none_or(|stop| n.id <= stop))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn max_notification_id(&self) -> Result<u64, Self::Error> {
        let inner = self.inner.read().expect("in-memory recorder lock poisoned");
        Ok(inner.next_notification_id)
    }

    async fn insert_snapshot(&self, snapshot: StoredEvent) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().expect("in-memory recorder lock poisoned");
        let rows = inner.snapshots.entry(snapshot.originator_id).or_default();
        rows.retain(|s| s.originator_version != snapshot.originator_version);
        rows.push(snapshot);
        rows.sort_by_key(|s| s.originator_version);
        Ok(())
    }

    async fn select_snapshots(
        &self,
        originator_id: Uuid,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        let inner = self.inner.read().expect("in-memory recorder lock poisoned");
        Ok(inner
            .snapshots
            .get(&originator_id)
            .map(|rows| select_versions(rows, None, lte, desc, limit))
            .unwrap_or_default())
    }
}
