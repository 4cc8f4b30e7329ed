// ABOUTME: End-to-end replication tests over SQLite stores and the in-memory broker
// ABOUTME: Covers insert then update propagation, deletes, no-op cycles and idempotent apply

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use mqtt_replicator::delta::{format_timestamp, frame, Delta, MessageKind, RowSnapshot};
use mqtt_replicator::store::{SqliteStore, TableSpec};
use mqtt_replicator::sync::{Dispatcher, PublisherConfig, PublisherLoop};
use mqtt_replicator::tracker::{ChangeTracker, TrackerConfig, WatermarkStrategy};
use mqtt_replicator::transport::{
    MemoryBroker, MemoryBusClient, PublishOutcome, SessionConfig, TransportSession,
};
use mqtt_replicator::DeltaApplier;
use rusqlite::Connection;
use tempfile::TempDir;

const DDL: &str = "CREATE TABLE RoomTemperatures (
    Id INTEGER PRIMARY KEY,
    RoomName TEXT NOT NULL,
    CurrentTemperature REAL,
    CurrentTime TEXT,
    CreatedAt TEXT,
    UpdatedAt TEXT
);";

const TOPIC: &str = "db/sync";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 29, 9, 0, 0).unwrap()
}

fn open(path: &std::path::Path) -> Connection {
    let conn = Connection::open(path).unwrap();
    conn.busy_timeout(Duration::from_secs(5)).unwrap();
    conn
}

struct Harness {
    _dir: TempDir,
    source: Connection,
    target: Connection,
    broker: MemoryBroker,
    publisher: PublisherLoop<SqliteStore, MemoryBusClient>,
    subscriber: TransportSession<MemoryBusClient>,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let source_path = dir.path().join("source.db");
    let target_path = dir.path().join("target.db");
    let source = open(&source_path);
    let target = open(&target_path);
    source.execute_batch(DDL).unwrap();
    target.execute_batch(DDL).unwrap();

    let broker = MemoryBroker::new();

    let tracker_config = TrackerConfig {
        strategy: WatermarkStrategy::MaxObserved,
        ..TrackerConfig::default()
    };
    let tracker = ChangeTracker::with_watermark(
        SqliteStore::open(&source_path).unwrap(),
        tracker_config,
        t0() - chrono::Duration::minutes(1),
    );
    let pub_session = TransportSession::new(broker.client(), SessionConfig::default());
    pub_session.connect().await.unwrap();
    let publisher = PublisherLoop::new(
        tracker,
        pub_session,
        PublisherConfig {
            topic: TOPIC.to_string(),
            ..PublisherConfig::default()
        },
    );

    let applier = DeltaApplier::new(SqliteStore::open(&target_path).unwrap(), TableSpec::default());
    let subscriber = TransportSession::new(broker.client(), SessionConfig::default());
    subscriber
        .subscribe_with_dispatch(TOPIC, Arc::new(Dispatcher::new(applier, None)))
        .await
        .unwrap();
    subscriber.connect().await.unwrap();

    Harness {
        _dir: dir,
        source,
        target,
        broker,
        publisher,
        subscriber,
    }
}

fn temperature(conn: &Connection, id: i64) -> Option<f64> {
    conn.query_row(
        "SELECT CurrentTemperature FROM RoomTemperatures WHERE Id = ?1",
        [id],
        |row| row.get(0),
    )
    .ok()
}

fn row_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM RoomTemperatures", [], |row| row.get(0))
        .unwrap()
}

/// Wait until the subscriber has applied what was published.
async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_insert_then_update_reaches_target() {
    let mut h = harness().await;
    let created = format_timestamp(&t0());
    h.source
        .execute(
            "INSERT INTO RoomTemperatures VALUES (1, 'Lab', 20.0, ?1, ?1, ?1)",
            [&created],
        )
        .unwrap();

    let stats = h.publisher.run_cycle().await.unwrap();
    assert_eq!(stats.inserts, 1);
    assert_eq!(stats.delta, Some(PublishOutcome::Published));
    wait_for(|| temperature(&h.target, 1) == Some(20.0)).await;

    let updated = format_timestamp(&(t0() + chrono::Duration::hours(1)));
    h.source
        .execute(
            "UPDATE RoomTemperatures SET CurrentTemperature = 22, UpdatedAt = ?1 WHERE Id = 1",
            [&updated],
        )
        .unwrap();

    let stats = h.publisher.run_cycle().await.unwrap();
    assert_eq!(stats.inserts, 0);
    assert_eq!(stats.updates, 1);
    wait_for(|| temperature(&h.target, 1) == Some(22.0)).await;

    let (name, updated_at): (String, String) = h
        .target
        .query_row(
            "SELECT RoomName, UpdatedAt FROM RoomTemperatures WHERE Id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(name, "Lab");
    assert_eq!(updated_at, updated);
    assert_eq!(h.broker.publish_count(), 2);
}

#[tokio::test]
async fn test_quiet_cycles_publish_nothing() {
    let mut h = harness().await;
    for _ in 0..3 {
        let stats = h.publisher.run_cycle().await.unwrap();
        assert!(stats.is_success());
        assert_eq!(stats.delta, None);
    }
    assert_eq!(h.broker.publish_count(), 0);
    assert_eq!(h.publisher.tracker().watermark(), t0() - chrono::Duration::minutes(1));
}

#[tokio::test]
async fn test_deletes_are_applied() {
    let h = harness().await;
    h.target
        .execute_batch(
            "INSERT INTO RoomTemperatures (Id, RoomName) VALUES (1, 'Lab');
             INSERT INTO RoomTemperatures (Id, RoomName) VALUES (2, 'Hall');",
        )
        .unwrap();

    let delta = Delta {
        deletes: vec![2, 99],
        ..Delta::default()
    };
    let sender = TransportSession::new(h.broker.client(), SessionConfig::default());
    sender.connect().await.unwrap();
    sender
        .publish_with_dedup(
            TOPIC,
            MessageKind::Delta,
            frame(MessageKind::Delta, &delta.encode().unwrap()),
        )
        .await
        .unwrap();

    wait_for(|| row_count(&h.target) == 1).await;
    assert_eq!(temperature(&h.target, 2), None);
    h.subscriber.close().await;
}

#[tokio::test]
async fn test_unframed_delta_from_legacy_peer() {
    let h = harness().await;
    let payload = Bytes::from_static(
        br#"{"Inserts":[{"Id":5,"RoomName":"Attic","CurrentTemperature":14.5,"CreatedAt":"2024-10-29T09:00:00.000000Z"}]}"#,
    );
    h.broker.inject(TOPIC, payload);
    wait_for(|| temperature(&h.target, 5) == Some(14.5)).await;
}

#[tokio::test]
async fn test_apply_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("target.db");
    open(&path).execute_batch(DDL).unwrap();
    let applier = DeltaApplier::new(SqliteStore::open(&path).unwrap(), TableSpec::default());

    let delta = Delta {
        inserts: vec![RowSnapshot::new()
            .with("Id", 1)
            .with("RoomName", "Lab")
            .with("CurrentTemperature", 20.0)
            .with("CreatedAt", t0())],
        updates: vec![RowSnapshot::new()
            .with("Id", 2)
            .with("RoomName", "Hall")
            .with("UpdatedAt", t0())],
        deletes: vec![3],
    };

    let first = applier.apply(&delta).await.unwrap();
    let second = applier.apply(&delta).await.unwrap();
    assert!(first.is_clean());
    assert_eq!(first.upserted, second.upserted);
    assert_eq!(second.deleted, 0);

    let conn = open(&path);
    assert_eq!(row_count(&conn), 2);
    assert_eq!(temperature(&conn, 1), Some(20.0));
}
