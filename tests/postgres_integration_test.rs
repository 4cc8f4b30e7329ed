// ABOUTME: Integration tests against real PostgreSQL databases
// ABOUTME: Requires TEST_SOURCE_URL and TEST_TARGET_URL; run with --ignored

use chrono::{Duration, Utc};
use mqtt_replicator::delta::{Delta, RowSnapshot};
use mqtt_replicator::store::{PgStore, StoreReader, TableSpec};
use mqtt_replicator::tracker::{ChangeTracker, TrackerConfig};
use mqtt_replicator::DeltaApplier;
use std::env;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_SOURCE_URL").ok()?;
    let target = env::var("TEST_TARGET_URL").ok()?;
    Some((source, target))
}

fn test_table(suffix: &str) -> TableSpec {
    TableSpec::new(format!("mr_test_{}", suffix))
}

async fn connect(url: &str) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls)
        .await
        .expect("Failed to connect");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {}", e);
        }
    });
    client
}

async fn setup_table(client: &tokio_postgres::Client, table: &TableSpec) {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{name}";
        CREATE TABLE "public"."{name}" (
            "Id" INTEGER PRIMARY KEY,
            "RoomName" TEXT NOT NULL,
            "CurrentTemperature" DOUBLE PRECISION,
            "CurrentTime" TIMESTAMP,
            "CreatedAt" TIMESTAMP,
            "UpdatedAt" TIMESTAMP
        )
        "#,
        name = table.name
    );
    client.batch_execute(&ddl).await.expect("Failed to create table");
}

async fn drop_table(client: &tokio_postgres::Client, table: &TableSpec) {
    let _ = client
        .batch_execute(&format!(r#"DROP TABLE IF EXISTS "public"."{}""#, table.name))
        .await;
}

#[tokio::test]
#[ignore]
async fn test_tracker_reads_inserts_and_updates() {
    let (source_url, _) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let client = connect(&source_url).await;
    let table = test_table("tracker");
    setup_table(&client, &table).await;

    client
        .batch_execute(&format!(
            r#"
            INSERT INTO "public"."{name}" VALUES
                (1, 'Lab', 20.5, NULL, (now() AT TIME ZONE 'UTC'), (now() AT TIME ZONE 'UTC')),
                (2, 'Hall', 18.0, NULL, (now() AT TIME ZONE 'UTC') - interval '1 day',
                    (now() AT TIME ZONE 'UTC'))
            "#,
            name = table.name
        ))
        .await
        .unwrap();

    let store = PgStore::connect(&source_url, false).await.unwrap();
    let config = TrackerConfig {
        table: table.clone(),
        ..TrackerConfig::default()
    };
    let mut tracker =
        ChangeTracker::with_watermark(store, config, Utc::now() - Duration::hours(1));
    let delta = tracker.generate_delta().await.unwrap();

    assert_eq!(delta.inserts.len(), 1);
    assert_eq!(delta.inserts[0].id("Id"), Some(1));
    assert_eq!(delta.updates.len(), 1);
    assert_eq!(delta.updates[0].id("Id"), Some(2));

    // Nothing changed since.
    let delta = tracker.generate_delta().await.unwrap();
    assert!(delta.is_empty());

    drop_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_applier_upserts_and_deletes() {
    let (_, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let client = connect(&target_url).await;
    let table = test_table("applier");
    setup_table(&client, &table).await;

    let store = PgStore::connect(&target_url, false).await.unwrap();
    let applier = DeltaApplier::new(store, table.clone());
    let now = Utc::now();

    let delta = Delta {
        inserts: vec![
            RowSnapshot::new()
                .with("Id", 1)
                .with("RoomName", "Lab")
                .with("CurrentTemperature", 20)
                .with("CreatedAt", now),
            RowSnapshot::new().with("Id", 2).with("RoomName", "Hall"),
        ],
        ..Delta::default()
    };
    let report = applier.apply(&delta).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.upserted, 2);

    let delta = Delta {
        updates: vec![RowSnapshot::new()
            .with("Id", 1)
            .with("CurrentTemperature", 22.0)
            .with("UpdatedAt", "2024-10-29 10:00:00")],
        deletes: vec![2, 42],
        ..Delta::default()
    };
    let report = applier.apply(&delta).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.deleted, 1);

    let row = client
        .query_one(
            &format!(
                r#"SELECT "RoomName", "CurrentTemperature" FROM "public"."{}" WHERE "Id" = 1"#,
                table.name
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>(0), "Lab");
    assert_eq!(row.get::<_, f64>(1), 22.0);

    let count: i64 = client
        .query_one(&format!(r#"SELECT COUNT(*) FROM "public"."{}""#, table.name), &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 1);

    drop_table(&client, &table).await;
}

#[tokio::test]
#[ignore]
async fn test_malformed_timestamp_rejects_only_that_row() {
    let (_, target_url) =
        get_test_urls().expect("TEST_SOURCE_URL and TEST_TARGET_URL must be set");
    let client = connect(&target_url).await;
    let table = test_table("malformed");
    setup_table(&client, &table).await;

    let store = PgStore::connect(&target_url, false).await.unwrap();
    let applier = DeltaApplier::new(store, table.clone());
    let delta = Delta {
        inserts: vec![
            RowSnapshot::new()
                .with("Id", 1)
                .with("RoomName", "Lab")
                .with("CreatedAt", "yesterday"),
            RowSnapshot::new().with("Id", 2).with("RoomName", "Hall"),
        ],
        ..Delta::default()
    };
    let report = applier.apply(&delta).await.unwrap();
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.upserted, 1);

    let store = PgStore::connect(&target_url, false).await.unwrap();
    let changed = store
        .query_changed_since(&table, Utc::now() - Duration::days(365 * 100))
        .await
        .unwrap();
    // Neither row has timestamps set, so neither counts as changed.
    assert!(changed.inserted.is_empty());

    drop_table(&client, &table).await;
}
