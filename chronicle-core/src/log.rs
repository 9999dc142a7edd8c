//! The notification log: every recorded event as one globally ordered
//! sequence.
//!
//! Two read surfaces exist over the recorder's notifications:
//!
//! - [`NotificationLog`] addresses the log as named sections (`"1,10"`
//!   meaning ids 1..=10) with cursors to the neighboring sections, the
//!   shape HTTP-style consumers paginate with.
//! - [`NotificationLogReader`] is a pull-based, idempotent, restartable
//!   stream for followers (projections, replicas, downstream
//!   applications).
//!
//! # Gap handling
//!
//! Notification ids are assigned before commit, so a reader can observe a
//! hole below the current maximum: some writer holds an id but has not
//! committed yet. Holes from in-flight writers close within a bounded
//! window; holes from aborted transactions never do. The reader re-polls a
//! persisting hole until `gap_tolerance` elapses and then advances past it,
//! treating it as aborted. Consequently, once a consumer has accepted id N,
//! no id < N will later be yielded by that reader — consumers restarting
//! from a recorded position keep exactly-once processing of ids.

use std::time::Duration;

use thiserror::Error;

use crate::{event::Notification, recorder::Recorder};

/// Default number of notifications per section and per reader page.
pub const DEFAULT_SECTION_SIZE: usize = 10;

/// Default time a reader waits for an id gap to close before skipping it.
pub const DEFAULT_GAP_TOLERANCE: Duration = Duration::from_secs(5);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One slice of the notification log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    /// Normalized `"start,end"` identifier of this section.
    pub section_id: String,
    /// Committed notifications in the requested id range, in id order.
    pub items: Vec<Notification>,
    /// First id of the following section, when this one is full.
    pub next_id: Option<u64>,
    /// First id of the preceding section, when one exists.
    pub previous_id: Option<u64>,
}

/// Error from section access.
#[derive(Debug, Error)]
pub enum SectionError<E>
where
    E: std::error::Error,
{
    /// The section id is not of the form `"start,end"` with
    /// `1 <= start <= end`.
    #[error("invalid section id `{0}`, expected `start,end`")]
    InvalidSectionId(String),
    /// Backend failure.
    #[error("persistence operation failed: {0}")]
    Operation(#[source] E),
}

/// Section-addressed access to the notification log.
#[derive(Clone, Debug)]
pub struct NotificationLog<R> {
    recorder: R,
    section_size: usize,
}

impl<R> NotificationLog<R> {
    #[must_use]
    pub const fn new(recorder: R) -> Self {
        Self {
            recorder,
            section_size: DEFAULT_SECTION_SIZE,
        }
    }

    /// Override the maximum number of notifications per section.
    #[must_use]
    pub const fn with_section_size(mut self, section_size: usize) -> Self {
        self.section_size = section_size;
        self
    }
}

impl<R: Recorder> NotificationLog<R> {
    /// Read the section named `section_id` (`"start,end"`, inclusive ids).
    ///
    /// Ranges wider than the configured section size are clipped. Only
    /// committed notifications appear; a section re-read later may contain
    /// more items (holes filled in), never different ones.
    ///
    /// # Errors
    ///
    /// Returns [`SectionError::InvalidSectionId`] for a malformed name, or
    /// [`SectionError::Operation`] on backend failure.
    #[tracing::instrument(skip(self))]
    pub async fn section(&self, section_id: &str) -> Result<Section, SectionError<R::Error>> {
        let (start, requested_end) = parse_section_id(section_id)
            .ok_or_else(|| SectionError::InvalidSectionId(section_id.to_string()))?;

        let end = requested_end.min(start + self.section_size as u64 - 1);
        let limit = usize::try_from(end - start + 1).unwrap_or(self.section_size);

        let items = self
            .recorder
            .select_notifications(start, limit, Some(end))
            .await
            .map_err(SectionError::Operation)?;

        let next_id = (items.len() == limit).then_some(end + 1);
        let previous_id = (start > self.section_size as u64)
            .then(|| start - self.section_size as u64);

        Ok(Section {
            section_id: format!("{start},{end}"),
            items,
            next_id,
            previous_id,
        })
    }
}

fn parse_section_id(section_id: &str) -> Option<(u64, u64)> {
    let (start, end) = section_id.split_once(',')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    (start >= 1 && end >= start).then_some((start, end))
}

/// A restartable follower of the notification log.
///
/// Construct one reading position with [`read`](Self::read), then drain it
/// page by page. The reader is idempotent: restarting from the last
/// accepted id + 1 resumes exactly where a previous run stopped.
#[derive(Clone, Debug)]
pub struct NotificationLogReader<R> {
    recorder: R,
    section_size: usize,
    gap_tolerance: Duration,
    poll_interval: Duration,
}

impl<R> NotificationLogReader<R> {
    #[must_use]
    pub const fn new(recorder: R) -> Self {
        Self {
            recorder,
            section_size: DEFAULT_SECTION_SIZE,
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the page size.
    #[must_use]
    pub const fn with_section_size(mut self, section_size: usize) -> Self {
        self.section_size = section_size;
        self
    }

    /// Override how long a persisting id gap is re-polled before being
    /// treated as an aborted transaction and skipped.
    #[must_use]
    pub const fn with_gap_tolerance(mut self, gap_tolerance: Duration) -> Self {
        self.gap_tolerance = gap_tolerance;
        self
    }

    /// Override the pause between re-polls while waiting out a gap.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start reading at notification id `start`.
    #[must_use]
    pub const fn read(&self, start: u64) -> LogReading<'_, R> {
        LogReading {
            reader: self,
            next_id: start,
        }
    }
}

/// One reading position over the log.
pub struct LogReading<'a, R> {
    reader: &'a NotificationLogReader<R>,
    next_id: u64,
}

impl<R: Recorder> LogReading<'_, R> {
    /// The id the next returned notification will have (or exceed, after a
    /// skipped gap).
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.next_id
    }

    /// Return the next page of notifications in id order, or an empty page
    /// once the reader has caught up with the committed log.
    ///
    /// Blocks up to the configured gap tolerance while a hole at the read
    /// frontier persists; see the module docs for the policy.
    ///
    /// # Errors
    ///
    /// Returns a backend error when a query fails.
    pub async fn next_page(&mut self) -> Result<Vec<Notification>, R::Error> {
        let mut waited = Duration::ZERO;

        loop {
            let page = self
                .reader
                .recorder
                .select_notifications(self.next_id, self.reader.section_size, None)
                .await?;

            let Some(first) = page.first() else {
                let max = self.reader.recorder.max_notification_id().await?;
                if max < self.next_id {
                    // Caught up with the committed log.
                    return Ok(Vec::new());
                }
                // Ids were assigned past our cursor but nothing is visible
                // yet: a gap at the head of the log.
                if waited >= self.reader.gap_tolerance {
                    tracing::warn!(
                        from = self.next_id,
                        to = max,
                        "notification gap persisted beyond tolerance, skipping"
                    );
                    self.next_id = max + 1;
                    return Ok(Vec::new());
                }
                tokio::time::sleep(self.reader.poll_interval).await;
                waited += self.reader.poll_interval;
                continue;
            };

            if first.id == self.next_id {
                return Ok(self.accept(page));
            }

            // The page starts past our cursor: an in-flight writer holds
            // ids below `first.id`. Wait for it to commit, then give up.
            if waited >= self.reader.gap_tolerance {
                tracing::warn!(
                    from = self.next_id,
                    to = first.id,
                    "notification gap persisted beyond tolerance, skipping"
                );
                return Ok(self.accept(page));
            }
            tokio::time::sleep(self.reader.poll_interval).await;
            waited += self.reader.poll_interval;
        }
    }

    /// Accept the maximal contiguous prefix of `page` and advance past it.
    ///
    /// Ids behind an interior hole stay unread; the next call starts at the
    /// hole and applies the gap policy there.
    fn accept(&mut self, mut page: Vec<Notification>) -> Vec<Notification> {
        let mut take = 1;
        while take < page.len() && page[take].id == page[take - 1].id + 1 {
            take += 1;
        }
        page.truncate(take);

        self.next_id = page[page.len() - 1].id + 1;
        page
    }

    /// Drain every committed notification from the current position,
    /// applying the gap policy at each page boundary.
    ///
    /// # Errors
    ///
    /// Returns a backend error when a query fails.
    pub async fn read_to_end(&mut self) -> Result<Vec<Notification>, R::Error> {
        let mut all = Vec::new();
        loop {
            let page = self.next_page().await?;
            if page.is_empty() && self.caught_up().await? {
                return Ok(all);
            }
            all.extend(page);
        }
    }

    async fn caught_up(&self) -> Result<bool, R::Error> {
        Ok(self.reader.recorder.max_notification_id().await? < self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    use nonempty::NonEmpty;
    use uuid::Uuid;

    use super::*;
    use crate::{
        event::StoredEvent,
        recorder::{InsertError, inmemory::InMemoryRecorder},
    };

    fn stored(id: Uuid, version: u64) -> StoredEvent {
        StoredEvent {
            originator_id: id,
            originator_version: version,
            topic: "world.something-happened".to_string(),
            state: Vec::new(),
        }
    }

    async fn record(recorder: &InMemoryRecorder, count: u64) -> Uuid {
        let id = Uuid::new_v4();
        let batch: Vec<StoredEvent> = (1..=count).map(|v| stored(id, v)).collect();
        recorder
            .insert_events(NonEmpty::from_vec(batch).unwrap())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn partial_section_has_no_next_cursor() {
        let recorder = InMemoryRecorder::new();
        record(&recorder, 4).await;

        let log = NotificationLog::new(recorder);
        let section = log.section("1,10").await.unwrap();

        assert_eq!(section.section_id, "1,10");
        assert_eq!(section.items.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(section.next_id, None);
        assert_eq!(section.previous_id, None);
    }

    #[tokio::test]
    async fn full_section_points_at_its_neighbors() {
        let recorder = InMemoryRecorder::new();
        record(&recorder, 25).await;

        let log = NotificationLog::new(recorder);

        let first = log.section("1,10").await.unwrap();
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.next_id, Some(11));
        assert_eq!(first.previous_id, None);

        let second = log.section("11,20").await.unwrap();
        assert_eq!(second.next_id, Some(21));
        assert_eq!(second.previous_id, Some(1));
    }

    #[tokio::test]
    async fn oversized_requests_are_clipped_to_the_section_size() {
        let recorder = InMemoryRecorder::new();
        record(&recorder, 25).await;

        let log = NotificationLog::new(recorder);
        let section = log.section("1,1000").await.unwrap();

        assert_eq!(section.section_id, "1,10");
        assert_eq!(section.items.len(), 10);
    }

    #[tokio::test]
    async fn malformed_section_ids_are_rejected() {
        let log = NotificationLog::new(InMemoryRecorder::new());

        for bad in ["", "10", "0,10", "5,4", "a,b"] {
            let result = log.section(bad).await;
            assert!(
                matches!(result, Err(SectionError::InvalidSectionId(_))),
                "expected `{bad}` to be rejected"
            );
        }
    }

    #[tokio::test]
    async fn reader_pages_through_the_log_and_stops_when_caught_up() {
        let recorder = InMemoryRecorder::new();
        record(&recorder, 25).await;

        let reader = NotificationLogReader::new(recorder.clone());
        let mut reading = reader.read(1);

        let all = reading.read_to_end().await.unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(all.last().unwrap().id, 25);
        assert_eq!(reading.position(), 26);
        assert!(reading.next_page().await.unwrap().is_empty());

        // New notifications resume the same reading position.
        record(&recorder, 2).await;
        let more = reading.read_to_end().await.unwrap();
        assert_eq!(more.iter().map(|n| n.id).collect::<Vec<_>>(), vec![26, 27]);
    }

    #[tokio::test]
    async fn reader_restarts_from_a_recorded_position() {
        let recorder = InMemoryRecorder::new();
        record(&recorder, 12).await;

        let reader = NotificationLogReader::new(recorder);
        let mut resumed = reader.read(6);

        let page = resumed.next_page().await.unwrap();
        assert_eq!(page.first().unwrap().id, 6);
    }

    /// Recorder wrapper that hides a configurable set of notification ids,
    /// simulating in-flight or aborted transactions.
    #[derive(Clone)]
    struct HidingRecorder {
        inner: InMemoryRecorder,
        hidden: Arc<Mutex<HashSet<u64>>>,
    }

    impl HidingRecorder {
        fn new(inner: InMemoryRecorder, hidden: impl IntoIterator<Item = u64>) -> Self {
            Self {
                inner,
                hidden: Arc::new(Mutex::new(hidden.into_iter().collect())),
            }
        }

        fn reveal(&self, id: u64) {
            self.hidden.lock().unwrap().remove(&id);
        }
    }

    impl Recorder for HidingRecorder {
        type Error = std::convert::Infallible;

        async fn insert_events(
            &self,
            batch: NonEmpty<StoredEvent>,
        ) -> Result<Vec<u64>, InsertError<Self::Error>> {
            self.inner.insert_events(batch).await
        }

        async fn select_events(
            &self,
            originator_id: Uuid,
            gt: Option<u64>,
            lte: Option<u64>,
            desc: bool,
            limit: Option<usize>,
        ) -> Result<Vec<StoredEvent>, Self::Error> {
            self.inner
                .select_events(originator_id, gt, lte, desc, limit)
                .await
        }

        async fn select_notifications(
            &self,
            start: u64,
            limit: usize,
            stop: Option<u64>,
        ) -> Result<Vec<Notification>, Self::Error> {
            let hidden = self.hidden.lock().unwrap().clone();
            // Over-fetch so hiding rows does not shrink the page below the
            // limit the caller asked for.
            let page = self
                .inner
                .select_notifications(start, limit + hidden.len(), stop)
                .await?;
            Ok(page
                .into_iter()
                .filter(|n| !hidden.contains(&n.id))
                .take(limit)
                .collect())
        }

        async fn max_notification_id(&self) -> Result<u64, Self::Error> {
            self.inner.max_notification_id().await
        }

        async fn insert_snapshot(&self, snapshot: StoredEvent) -> Result<(), Self::Error> {
            self.inner.insert_snapshot(snapshot).await
        }

        async fn select_snapshots(
            &self,
            originator_id: Uuid,
            lte: Option<u64>,
            desc: bool,
            limit: Option<usize>,
        ) -> Result<Vec<StoredEvent>, Self::Error> {
            self.inner
                .select_snapshots(originator_id, lte, desc, limit)
                .await
        }
    }

    #[tokio::test]
    async fn interior_hole_stops_the_accepted_prefix() {
        let inner = InMemoryRecorder::new();
        record(&inner, 5).await;
        let recorder = HidingRecorder::new(inner, [3]);

        let reader = NotificationLogReader::new(recorder)
            .with_gap_tolerance(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));
        let mut reading = reader.read(1);

        // Ids before the hole are safe and returned immediately.
        let page = reading.next_page().await.unwrap();
        assert_eq!(page.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(reading.position(), 3);
    }

    #[tokio::test]
    async fn gap_that_closes_in_time_is_waited_out() {
        let inner = InMemoryRecorder::new();
        record(&inner, 5).await;
        let recorder = HidingRecorder::new(inner, [3]);

        let reader = NotificationLogReader::new(recorder.clone())
            .with_gap_tolerance(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(10));
        let mut reading = reader.read(3);

        let revealer = recorder.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            revealer.reveal(3);
        });

        let page = reading.next_page().await.unwrap();
        assert_eq!(page.first().unwrap().id, 3);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn gap_that_persists_is_skipped_after_the_tolerance() {
        let inner = InMemoryRecorder::new();
        record(&inner, 5).await;
        let recorder = HidingRecorder::new(inner, [3]);

        let reader = NotificationLogReader::new(recorder)
            .with_gap_tolerance(Duration::from_millis(40))
            .with_poll_interval(Duration::from_millis(10));
        let mut reading = reader.read(3);

        // The hole at 3 never closes; the reader advances past it.
        let page = reading.next_page().await.unwrap();
        assert_eq!(page.iter().map(|n| n.id).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(reading.position(), 6);
    }

    #[tokio::test]
    async fn head_gap_with_nothing_visible_is_skipped_after_the_tolerance() {
        let inner = InMemoryRecorder::new();
        record(&inner, 2).await;
        // Both remaining ids are in flight.
        let recorder = HidingRecorder::new(inner, [1, 2]);

        let reader = NotificationLogReader::new(recorder.clone())
            .with_gap_tolerance(Duration::from_millis(40))
            .with_poll_interval(Duration::from_millis(10));
        let mut reading = reader.read(1);

        let page = reading.next_page().await.unwrap();
        assert!(page.is_empty());
        assert_eq!(reading.position(), 3);
    }
}
