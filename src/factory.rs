//! Building blocks from configuration.
//!
//! [`InfrastructureFactory`] turns a [`Config`] into connected, migrated
//! infrastructure: the mapper pipeline (transcoder, optional compression,
//! optional encryption, upcasters) and the selected recorder backend behind
//! the statically dispatched [`AnyRecorder`]. The resulting
//! [`Infrastructure`] hands out event stores, repositories, and
//! notification-log access that all share the same recorder.

use std::convert::Infallible;

use chronicle_core::{
    aggregate::Aggregate,
    cipher::AesGcm,
    compress::Zlib,
    event::{Notification, StoredEvent},
    log::{NotificationLog, NotificationLogReader},
    mapper::Mapper,
    recorder::{InsertError, Recorder, inmemory::InMemoryRecorder},
    repository::Repository,
    snapshot::SnapshotStore,
    store::EventStore,
    transcoder::JsonTranscoder,
    upcast::UpcasterRegistry,
};
use nonempty::NonEmpty;
use uuid::Uuid;

use crate::config::{Backend, Compression, Config};

/// Operational error of whichever backend the configuration selected.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] chronicle_sqlite::Error),
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] chronicle_postgres::Error),
}

impl From<Infallible> for BackendError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// Error from building infrastructure out of a configuration.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// The cipher key is not 64 hex characters.
    #[error("invalid cipher key: {0}")]
    InvalidCipherKey(String),
    /// The selected backend could not be connected or migrated.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The configured recorder backend, statically dispatched.
#[derive(Clone, Debug)]
pub enum AnyRecorder {
    InMemory(InMemoryRecorder),
    #[cfg(feature = "sqlite")]
    Sqlite(chronicle_sqlite::SqliteRecorder),
    #[cfg(feature = "postgres")]
    Postgres(chronicle_postgres::PostgresRecorder),
}

fn widen<E: Into<BackendError> + std::error::Error>(error: InsertError<E>) -> InsertError<BackendError> {
    match error {
        InsertError::Conflict(conflict) => InsertError::Conflict(conflict),
        InsertError::Operation(source) => InsertError::Operation(source.into()),
    }
}

impl Recorder for AnyRecorder {
    type Error = BackendError;

    async fn insert_events(
        &self,
        batch: NonEmpty<StoredEvent>,
    ) -> Result<Vec<u64>, InsertError<Self::Error>> {
        match self {
            Self::InMemory(r) => r.insert_events(batch).await.map_err(widen),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(r) => r.insert_events(batch).await.map_err(widen),
            #[cfg(feature = "postgres")]
            Self::Postgres(r) => r.insert_events(batch).await.map_err(widen),
        }
    }

    async fn select_events(
        &self,
        originator_id: Uuid,
        gt: Option<u64>,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        match self {
            Self::InMemory(r) => r
                .select_events(originator_id, gt, lte, desc, limit)
                .await
                .map_err(Into::into),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(r) => r
                .select_events(originator_id, gt, lte, desc, limit)
                .await
                .map_err(Into::into),
            #[cfg(feature = "postgres")]
            Self::Postgres(r) => r
                .select_events(originator_id, gt, lte, desc, limit)
                .await
                .map_err(Into::into),
        }
    }

    async fn select_notifications(
        &self,
        start: u64,
        limit: usize,
        stop: Option<u64>,
    ) -> Result<Vec<Notification>, Self::Error> {
        match self {
            Self::InMemory(r) => r
                .select_notifications(start, limit, stop)
                .await
                .map_err(Into::into),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(r) => r
                .select_notifications(start, limit, stop)
                .await
                .map_err(Into::into),
            #[cfg(feature = "postgres")]
            Self::Postgres(r) => r
                .select_notifications(start, limit, stop)
                .await
                .map_err(Into::into),
        }
    }

    async fn max_notification_id(&self) -> Result<u64, Self::Error> {
        match self {
            Self::InMemory(r) => r.max_notification_id().await.map_err(Into::into),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(r) => r.max_notification_id().await.map_err(Into::into),
            #[cfg(feature = "postgres")]
            Self::Postgres(r) => r.max_notification_id().await.map_err(Into::into),
        }
    }

    async fn insert_snapshot(&self, snapshot: StoredEvent) -> Result<(), Self::Error> {
        match self {
            Self::InMemory(r) => r.insert_snapshot(snapshot).await.map_err(Into::into),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(r) => r.insert_snapshot(snapshot).await.map_err(Into::into),
            #[cfg(feature = "postgres")]
            Self::Postgres(r) => r.insert_snapshot(snapshot).await.map_err(Into::into),
        }
    }

    async fn select_snapshots(
        &self,
        originator_id: Uuid,
        lte: Option<u64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        match self {
            Self::InMemory(r) => r
                .select_snapshots(originator_id, lte, desc, limit)
                .await
                .map_err(Into::into),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(r) => r
                .select_snapshots(originator_id, lte, desc, limit)
                .await
                .map_err(Into::into),
            #[cfg(feature = "postgres")]
            Self::Postgres(r) => r
                .select_snapshots(originator_id, lte, desc, limit)
                .await
                .map_err(Into::into),
        }
    }
}

/// Builds [`Infrastructure`] from a [`Config`].
#[derive(Clone, Debug)]
pub struct InfrastructureFactory {
    config: Config,
}

impl InfrastructureFactory {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Build the mapper pipeline with the default transcoder and no
    /// upcasters.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::InvalidCipherKey`] when the configured key is
    /// malformed.
    pub fn mapper(&self) -> Result<Mapper, FactoryError> {
        self.mapper_with(JsonTranscoder::with_defaults(), UpcasterRegistry::new())
    }

    /// Build the mapper pipeline around an application-provided transcoder
    /// and upcaster registry.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::InvalidCipherKey`] when the configured key is
    /// malformed.
    pub fn mapper_with(
        &self,
        transcoder: JsonTranscoder,
        upcasters: UpcasterRegistry,
    ) -> Result<Mapper, FactoryError> {
        let mut mapper = Mapper::new(transcoder).with_upcasters(upcasters);

        if let Some(compression) = self.config.compression {
            mapper = match compression {
                Compression::Zlib => mapper.with_compressor(Zlib::new()),
            };
        }

        if let Some(key) = &self.config.cipher_key {
            mapper = mapper.with_cipher(AesGcm::new(&parse_cipher_key(key)?));
        }

        Ok(mapper)
    }

    /// Connect to (and migrate) the configured backend and assemble the
    /// infrastructure.
    ///
    /// # Errors
    ///
    /// Returns a [`FactoryError`] when the cipher key is malformed or the
    /// backend cannot be reached.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<Infrastructure, FactoryError> {
        self.connect_with(JsonTranscoder::with_defaults(), UpcasterRegistry::new())
            .await
    }

    /// Like [`connect`](Self::connect), with an application-provided
    /// transcoder and upcaster registry.
    ///
    /// # Errors
    ///
    /// Returns a [`FactoryError`] when the cipher key is malformed or the
    /// backend cannot be reached.
    pub async fn connect_with(
        &self,
        transcoder: JsonTranscoder,
        upcasters: UpcasterRegistry,
    ) -> Result<Infrastructure, FactoryError> {
        let mapper = self.mapper_with(transcoder, upcasters)?;
        let recorder = self.recorder().await?;
        tracing::info!(config = ?self.config, "infrastructure connected");

        Ok(Infrastructure {
            mapper,
            recorder,
            snapshotting_enabled: self.config.snapshotting_enabled,
        })
    }

    async fn recorder(&self) -> Result<AnyRecorder, FactoryError> {
        match &self.config.backend {
            Backend::InMemory => Ok(AnyRecorder::InMemory(InMemoryRecorder::new())),
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(sqlite) => {
                let recorder = chronicle_sqlite::SqliteRecorder::connect(&sqlite.url())
                    .await
                    .map_err(BackendError::from)?;
                recorder
                    .migrate()
                    .await
                    .map_err(chronicle_sqlite::Error::from)
                    .map_err(BackendError::from)?;
                Ok(AnyRecorder::Sqlite(recorder))
            }
            #[cfg(feature = "postgres")]
            Backend::Postgres(postgres) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .acquire_timeout(postgres.connect_timeout)
                    .connect(&postgres.url())
                    .await
                    .map_err(chronicle_postgres::Error::from)
                    .map_err(BackendError::from)?;
                let recorder = chronicle_postgres::PostgresRecorder::new(pool)
                    .with_lock_timeout(postgres.lock_timeout);
                recorder
                    .migrate()
                    .await
                    .map_err(chronicle_postgres::Error::from)
                    .map_err(BackendError::from)?;
                Ok(AnyRecorder::Postgres(recorder))
            }
        }
    }
}

/// Connected, migrated infrastructure sharing one recorder.
#[derive(Clone, Debug)]
pub struct Infrastructure {
    mapper: Mapper,
    recorder: AnyRecorder,
    snapshotting_enabled: bool,
}

impl Infrastructure {
    #[must_use]
    pub const fn recorder(&self) -> &AnyRecorder {
        &self.recorder
    }

    #[must_use]
    pub const fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    #[must_use]
    pub fn event_store(&self) -> EventStore<AnyRecorder> {
        EventStore::new(self.mapper.clone(), self.recorder.clone())
    }

    #[must_use]
    pub fn snapshot_store(&self) -> SnapshotStore<AnyRecorder> {
        SnapshotStore::new(self.mapper.clone(), self.recorder.clone())
    }

    /// A repository for one aggregate family, consulting the snapshot store
    /// when the configuration enabled snapshotting.
    #[must_use]
    pub fn repository<A: Aggregate>(&self) -> Repository<A, AnyRecorder> {
        let repository = Repository::new(self.event_store());
        if self.snapshotting_enabled {
            repository.with_snapshots(self.snapshot_store())
        } else {
            repository
        }
    }

    #[must_use]
    pub fn notification_log(&self) -> NotificationLog<AnyRecorder> {
        NotificationLog::new(self.recorder.clone())
    }

    #[must_use]
    pub fn notification_reader(&self) -> NotificationLogReader<AnyRecorder> {
        NotificationLogReader::new(self.recorder.clone())
    }
}

fn parse_cipher_key(hex: &str) -> Result<[u8; 32], FactoryError> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(FactoryError::InvalidCipherKey(format!(
            "expected 64 hex characters, got {}",
            hex.len()
        )));
    }

    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16).map_err(|_| {
            FactoryError::InvalidCipherKey(format!("invalid hex at offset {}", 2 * i))
        })?;
    }
    Ok(key)
}
