#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use chronicle_core::test;
pub use chronicle_core::{
    aggregate,
    aggregate::Aggregate,
    cipher, compress, event,
    event::{AggregateEvent, DomainEvent, Notification, StoredEvent},
    log,
    log::{NotificationLog, NotificationLogReader, Section},
    mapper,
    mapper::Mapper,
    repository,
    repository::Repository,
    snapshot,
    snapshot::SnapshotStore,
    store,
    store::EventStore,
    transcoder, upcast,
};

pub mod recorder {

    pub use chronicle_core::recorder::{
        InsertError, RecordConflict, Recorder, check_batch, inmemory,
    };

    #[cfg(feature = "sqlite")]
    pub mod sqlite {
        pub use chronicle_sqlite::{Error, SqliteRecorder};
    }

    #[cfg(feature = "postgres")]
    pub mod postgres {
        pub use chronicle_postgres::{Error, PostgresRecorder};
    }
}

mod config;
mod factory;

pub use config::{Backend, Compression, Config};
#[cfg(feature = "postgres")]
pub use config::PostgresConfig;
#[cfg(feature = "sqlite")]
pub use config::SqliteConfig;
pub use factory::{AnyRecorder, BackendError, FactoryError, Infrastructure, InfrastructureFactory};
