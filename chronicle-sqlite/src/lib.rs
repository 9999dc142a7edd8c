//! SQLite-backed recorder for Chronicle.
//!
//! This crate implements [`chronicle_core::recorder::Recorder`] over an
//! embedded single-file (or in-memory) SQLite database.
//!
//! Notification ids come from an `INTEGER PRIMARY KEY AUTOINCREMENT`
//! column, so every committed batch occupies a contiguous, monotonically
//! increasing block. Optimistic concurrency rests on the
//! `UNIQUE(originator_id, originator_version)` constraint. The connection
//! pool is capped at a single connection, which doubles as the
//! process-wide write lock the file-backed engine needs.

use std::time::Duration;

use chronicle_core::{
    event::{Notification, StoredEvent},
    recorder::{InsertError, RecordConflict, Recorder, check_batch},
};
use nonempty::NonEmpty;
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

/// Error type for the SQLite recorder.
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
    /// A stored originator id failed to parse.
    #[error("invalid originator id in database: {0}")]
    InvalidOriginatorId(#[from] uuid::Error),
}

fn to_db_position(position: u64) -> Result<i64, Error> {
    i64::try_from(position).map_err(|_| Error::PositionOutOfRange(position))
}

fn from_db_position(position: i64) -> Result<u64, Error> {
    u64::try_from(position).map_err(|_| Error::InvalidPosition(position))
}

/// A SQLite-backed [`Recorder`].
///
/// Originator ids are stored as hyphenated TEXT, versions and notification
/// ids as INTEGER, payloads as BLOB.
#[derive(Clone)]
pub struct SqliteRecorder {
    pool: SqlitePool,
}

impl SqliteRecorder {
    /// Construct a recorder from an existing pool.
    ///
    /// The pool should be capped at one connection; SQLite serializes
    /// writers at the file level anyway, and a larger pool pointed at an
    /// in-memory database would see one private database per connection.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` with a 5 second
    /// busy timeout.
    ///
    /// `url` is a sqlx SQLite URL: `sqlite://path/to/file.db` or
    /// `sqlite::memory:`.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the database cannot be opened.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        Self::connect_with(options).await
    }

    /// Open the database described by `options`.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the database cannot be opened.
    pub async fn connect_with(options: SqliteConnectOptions) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
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
                notification_id    INTEGER PRIMARY KEY AUTOINCREMENT,
                originator_id      TEXT NOT NULL,
                originator_version INTEGER NOT NULL,
                topic              TEXT NOT NULL,
                state              BLOB NOT NULL,
                UNIQUE (originator_id, originator_version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS snapshots (
                originator_id      TEXT NOT NULL,
                originator_version INTEGER NOT NULL,
                topic              TEXT NOT NULL,
                state              BLOB NOT NULL,
                PRIMARY KEY (originator_id, originator_version)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn decode_stored(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEvent, Error> {
    let originator_id: String = row.try_get("originator_id")?;
    let originator_version: i64 = row.try_get("originator_version")?;

    Ok(StoredEvent {
        originator_id: Uuid::parse_str(&originator_id)?,
        originator_version: from_db_position(originator_version)?,
        topic: row.try_get("topic")?,
        state: row.try_get("state")?,
    })
}

impl Recorder for SqliteRecorder {
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
            staged.push((event.originator_id.to_string(), version, event));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| InsertError::Operation(Error::Database(e)))?;

        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO stored_events (originator_id, originator_version, topic, state) ",
        );
        qb.push_values(staged, |mut b, (id, version, event)| {
            b.push_bind(id);
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
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT originator_id, originator_version, topic, state FROM stored_events \
             WHERE originator_id = ",
        );
        qb.push_bind(originator_id.to_string());

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
        let mut qb = QueryBuilder::<Sqlite>::new(
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
            VALUES (?, ?, ?, ?)
            ON CONFLICT (originator_id, originator_version)
            DO UPDATE SET topic = excluded.topic, state = excluded.state
            ",
        )
        .bind(snapshot.originator_id.to_string())
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
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT originator_id, originator_version, topic, state FROM snapshots \
             WHERE originator_id = ",
        );
        qb.push_bind(originator_id.to_string());
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

impl std::fmt::Debug for SqliteRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecorder").finish_non_exhaustive()
    }
}
