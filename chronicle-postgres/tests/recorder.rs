//! Integration tests for the PostgreSQL recorder.
//!
//! These tests require Docker to be running and will spin up a PostgreSQL
//! container using testcontainers.

extern crate alloc;

use chronicle_core::{
    event::StoredEvent,
    recorder::{InsertError, Recorder},
};
use chronicle_postgres::PostgresRecorder;
use nonempty::{NonEmpty, nonempty};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test helper to set up a PostgreSQL container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }

    async fn recorder(&self) -> PostgresRecorder {
        let recorder = PostgresRecorder::new(self.pool.clone());
        recorder.migrate().await.unwrap();
        recorder
    }
}

fn stored(id: Uuid, version: u64, topic: &str) -> StoredEvent {
    StoredEvent {
        originator_id: id,
        originator_version: version,
        topic: topic.to_string(),
        state: format!("state-{version}").into_bytes(),
    }
}

#[tokio::test]
async fn migrate_is_idempotent() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    recorder.migrate().await.unwrap();
    recorder.migrate().await.unwrap();
}

#[tokio::test]
async fn insert_assigns_contiguous_ids_starting_at_one() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    let id = Uuid::new_v4();

    let first = recorder
        .insert_events(nonempty![stored(id, 1, "world.created")])
        .await
        .unwrap();
    let rest = recorder
        .insert_events(nonempty![
            stored(id, 2, "world.something-happened"),
            stored(id, 3, "world.something-happened"),
        ])
        .await
        .unwrap();

    assert_eq!(first, vec![1]);
    assert_eq!(rest, vec![2, 3]);
    assert_eq!(recorder.max_notification_id().await.unwrap(), 3);
}

#[tokio::test]
async fn select_events_roundtrips_rows() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    let id = Uuid::new_v4();
    let batch = nonempty![
        stored(id, 1, "world.created"),
        stored(id, 2, "world.something-happened"),
    ];
    recorder.insert_events(batch.clone()).await.unwrap();

    let events = recorder
        .select_events(id, None, None, false, None)
        .await
        .unwrap();

    assert_eq!(events, batch.into_iter().collect::<Vec<_>>());
}

#[tokio::test]
async fn duplicate_version_conflicts_and_writes_nothing() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    let id = Uuid::new_v4();

    recorder
        .insert_events(nonempty![stored(id, 1, "world.created")])
        .await
        .unwrap();

    let result = recorder
        .insert_events(nonempty![
            stored(id, 2, "world.something-happened"),
            stored(id, 1, "world.created"),
        ])
        .await;
    assert!(matches!(result, Err(InsertError::Conflict(_))));

    let events = recorder
        .select_events(id, None, None, false, None)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn concurrent_writers_to_one_stream_produce_exactly_one_winner() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    let id = Uuid::new_v4();
    recorder
        .insert_events(nonempty![stored(id, 1, "world.created")])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let recorder = recorder.clone();
        handles.push(tokio::spawn(async move {
            recorder
                .insert_events(nonempty![stored(id, 2, "world.something-happened")])
                .await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(InsertError::Conflict(_)) => conflicts += 1,
            Err(InsertError::Operation(e)) => panic!("unexpected backend error: {e}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 3);
}

#[tokio::test]
async fn committed_batches_occupy_contiguous_blocks_under_concurrency() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let recorder = recorder.clone();
        handles.push(tokio::spawn(async move {
            let id = Uuid::new_v4();
            let batch: Vec<StoredEvent> = (1..=3).map(|v| stored(id, v, "t")).collect();
            recorder
                .insert_events(NonEmpty::from_vec(batch).unwrap())
                .await
                .unwrap()
        }));
    }

    let mut blocks = Vec::new();
    for handle in handles {
        blocks.push(handle.await.unwrap());
    }

    // Every batch's ids are contiguous, and no id is shared across batches.
    let mut all: Vec<u64> = Vec::new();
    for block in &blocks {
        assert!(block.windows(2).all(|w| w[1] == w[0] + 1));
        all.extend(block);
    }
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 18);
    assert_eq!(*all.last().unwrap(), 18);
}

#[tokio::test]
async fn select_notifications_honors_start_stop_and_limit() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    let id = Uuid::new_v4();
    let batch: Vec<StoredEvent> = (1..=6).map(|v| stored(id, v, "t")).collect();
    recorder
        .insert_events(NonEmpty::from_vec(batch).unwrap())
        .await
        .unwrap();

    let page = recorder.select_notifications(2, 3, None).await.unwrap();
    assert_eq!(page.iter().map(|n| n.id).collect::<Vec<_>>(), vec![2, 3, 4]);

    let bounded = recorder.select_notifications(2, 10, Some(3)).await.unwrap();
    assert_eq!(bounded.iter().map(|n| n.id).collect::<Vec<_>>(), vec![2, 3]);
}

#[tokio::test]
async fn snapshots_upsert_and_select_newest_first() {
    let db = TestDb::new().await;
    let recorder = db.recorder().await;
    let id = Uuid::new_v4();

    recorder
        .insert_snapshot(stored(id, 2, "world"))
        .await
        .unwrap();
    recorder
        .insert_snapshot(stored(id, 5, "world"))
        .await
        .unwrap();

    let mut replacement = stored(id, 5, "world");
    replacement.state = b"replaced".to_vec();
    recorder.insert_snapshot(replacement).await.unwrap();

    let newest = recorder
        .select_snapshots(id, None, true, Some(1))
        .await
        .unwrap();
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].originator_version, 5);
    assert_eq!(newest[0].state, b"replaced");

    let bounded = recorder
        .select_snapshots(id, Some(4), true, Some(1))
        .await
        .unwrap();
    assert_eq!(bounded[0].originator_version, 2);
}
