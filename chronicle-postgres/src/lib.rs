//! PostgreSQL-backed recorder for Chronicle.
//!
//! This crate implements [`chronicle_core::recorder::Recorder`] over a
//! client-server PostgreSQL database.
//!
//! Notification ids come from a `BIGSERIAL` column. A plain sequence hands
//! out ids in call order, not commit order, so concurrent transactions
//! would interleave their blocks; the insert transaction therefore takes
//! `LOCK TABLE stored_events IN EXCLUSIVE MODE` first, serializing writers
//! with respect to the counter. Committed ids form contiguous blocks in
//! commit order, and holes only appear where a transaction aborted after
//! its ids were assigned. Concurrent reads are unaffected by the lock
//! (`EXCLUSIVE` still admits `ACCESS SHARE`).
//!
//! Optimistic concurrency rests on the primary key
//! `(originator_id, originator_version)`; a unique violation maps to
//! [`RecordConflict`].

use std::time::Duration;

use chronicle_core::{
    event::{Notification, StoredEvent},
    recorder::{InsertError, RecordConflict, Recorder, check_batch},
};
use nonempty::NonEmpty;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, postgres::PgRow};
use uuid::Uuid;

/// Error type for the PostgreSQL recorder.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error during recorder operations.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The database returned a position that does not fit the model.
    #[error("invalid position value from database: {0}")]
    InvalidPosition(i64),
    /// A requested position does not fit the database's integer type.
    #[error("position out of range: {0}")]
    PositionOutOfRange(u64),
    /// The database did not return an inserted notification id.
    #[error("database did not return an inserted notification id")]
    MissingReturnedId,
}

fn to_db_position(position: u64) -> Result<i64, Error> {
    i64::try_from(position).map_err(|_| Error::PositionOutOfRange(position))
}

fn from_db_position(position: i64) -> Result<u64, Error> {
    u64::try_from(position).map_err(|_| Error::InvalidPosition(position))
}

/// A PostgreSQL-backed [`Recorder`].
///
/// Originator ids are stored as `UUID`, versions and notification ids as
/// `BIGINT`, payloads as `BYTEA`.
#[derive(Clone)]
pub struct PostgresRecorder {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PostgresRecorder {
    /// Construct a recorder from a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Bound how long an append waits for the writer lock before failing
    /// with an operational error.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Apply the initial schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS stored_events (
                originator_id      UUID NOT NULL,
                originator_version BIGINT NOT NULL,
                topic              TEXT NOT NULL,
                state              BYTEA NOT NULL,
                notification_id    BIGSERIAL,
                PRIMARY KEY (originator_id, originator_version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE UNIQUE INDEX IF NOT EXISTS stored_events_notification_id
              ON stored_events (notification_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS snapshots (
                originator_id      UUID NOT NULL,
                originator_version BIGINT NOT NULL,
                topic              TEXT NOT NULL,
                state              BYTEA NOT NULL,
                PRIMARY KEY (originator_id, originator_version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_stored(row: &PgRow) -> Result<StoredEvent, Error> {
    let originator_version: i64 = row.try_get("originator_version")?;
    Ok(StoredEvent {
        originator_id: row.try_get("originator_id")?,
        originator_version: from_db_position(originator_version)?,
        topic: row.try_get("topic")?,
        state: row.try_get("state")?,
    })
}

impl Recorder for PostgresRecorder {
    type Error = Error;

    #[tracing::instrument(skip(self, batch), fields(event_count = batch.len()))]
    async fn insert_events(
        &self,
        batch: NonEmpty<StoredEvent>,
    ) -> Result<Vec<u64>, InsertError<Self::Error>> {
        check_batch(&batch)?;

        let mut staged = Vec::with_capacity(batch.len());
        for event in &batch {
            let version = to_db_position(event.originator_version)
                .map_err(InsertError::Operation)?;
            staged.push((version, event));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| InsertError::Operation(Error::Database(e)))?;

        if let Some(timeout) = self.lock_timeout {
            sqlx::query(&format!(
                "SET LOCAL lock_timeout = '{}ms'",
                timeout.as_millis()
            ))
            .execute(&mut *tx)
            .await
            .map_err(|e| InsertError::Operation(Error::Database(e)))?;
        }

        // Serialize writers with respect to the notification counter so
        // each committed batch occupies a contiguous id block.
        sqlx::query("LOCK TABLE stored_events IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| InsertError::Operation(Error::Database(e)))?;

        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO stored_events (originator_id, originator_version, topic, state) ",
        );
        qb.push_values(staged, |mut b, (version, event)| {
            b.push_bind(event.originator_id);
            b.push_bind(version);
            b.push_bind(event.topic.clone());
            b.push_bind(event.state.clone());
        });
        qb.push(" RETURNING notification_id");

        let rows: Vec<i64> = qb
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| {
                if e.as_database_error().is_some_and(|db| db.is_unique_violation()) {
                    tracing::debug!("unique violation, rejecting batch");
                    InsertError::Conflict(RecordConflict::for_batch(&batch))
                } else {
                    InsertError::Operation(Error::Database(e))
                }
            })?;

        if rows.len() != batch.len() {
            return Err(InsertError::Operation(Error::MissingReturnedId));
        }

        tx.commit()
            .await
            .map_err(|e| InsertError::Operation(Error::Database(e)))?;

        let ids = rows
            .into_iter()
            .map(from_db_position)
            .collect::<Result<Vec<_>, _>>()
            .map_err(InsertError::Operation)?;
        tracing::debug!(assigned = ?ids, "events recorded");
        Ok(ids)
    }

    #[tracing::instrument(skip(self))]
    async fn select_events(
        &self,
        originator_id: Uuid,
        gt: Option<u64>,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT originator_id, originator_version, topic, state FROM stored_events \
             WHERE originator_id = ",
        );
        qb.push_bind(originator_id);

        if let Some(gt) = gt {
            qb.push(" AND originator_version > ").push_bind(to_db_position(gt)?);
        }
        if let Some(lte) = lte {
            qb.push(" AND originator_version <= ").push_bind(to_db_position(lte)?);
        }
        qb.push(if desc {
            " ORDER BY originator_version DESC"
        } else {
            " ORDER BY originator_version ASC"
        });
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_stored).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn select_notifications(
        &self,
        start: u64,
        limit: usize,
        stop: Option<u64>,
    ) -> Result<Vec<Notification>, Self::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT notification_id, originator_id, originator_version, topic, state \
             FROM stored_events WHERE notification_id >= ",
        );
        qb.push_bind(to_db_position(start)?);
        if let Some(stop) = stop {
            qb.push(" AND notification_id <= ").push_bind(to_db_position(stop)?);
        }
        qb.push(" ORDER BY notification_id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let id: i64 = row.try_get("notification_id")?;
                let stored = decode_stored(row)?;
                Ok(Notification::from_stored(from_db_position(id)?, &stored))
            })
            .collect()
    }

    async fn max_notification_id(&self) -> Result<u64, Self::Error> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(notification_id) FROM stored_events")
                .fetch_one(&self.pool)
                .await?;
        max.map_or(Ok(0), from_db_position)
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(originator_id = %snapshot.originator_id, originator_version = snapshot.originator_version)
    )]
    async fn insert_snapshot(&self, snapshot: StoredEvent) -> Result<(), Self::Error> {
        sqlx::query(
            r"
            INSERT INTO snapshots (originator_id, originator_version, topic, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (originator_id, originator_version)
            DO UPDATE SET topic = EXCLUDED.topic, state = EXCLUDED.state
            ",
        )
        .bind(snapshot.originator_id)
        .bind(to_db_position(snapshot.originator_version)?)
        .bind(&snapshot.topic)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn select_snapshots(
        &self,
        originator_id: Uuid,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT originator_id, originator_version, topic, state FROM snapshots \
             WHERE originator_id = ",
        );
        qb.push_bind(originator_id);
        if let Some(lte) = lte {
            qb.push(" AND originator_version <= ").push_bind(to_db_position(lte)?);
        }
        qb.push(if desc {
            " ORDER BY originator_version DESC"
        } else {
            " ORDER BY originator_version ASC"
        });
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_stored).collect()
    }
}

impl std::fmt::Debug for PostgresRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresRecorder")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
