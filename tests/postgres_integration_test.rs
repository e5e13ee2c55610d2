// ABOUTME: Integration tests for the PostgreSQL destination
// ABOUTME: Schema creation, page loads, watermark reads, and skip-duplicates mode against a live server

use call_replicator::destination::{CallDestination, PostgresDestination};
use call_replicator::postgres::{connect, ensure_schema};
use call_replicator::{LoadMode, NormalizedCallRecord, Watermark};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::env;

/// Helper to get the test database URL from environment
fn get_test_url() -> Option<String> {
    env::var("TEST_TARGET_URL").ok()
}

/// Connect with `search_path` pointed at a fresh schema so tests don't share a table.
async fn connect_isolated(url: &str, schema: &str) -> anyhow::Result<tokio_postgres::Client> {
    let client = connect(url).await?;
    client
        .batch_execute(&format!(
            r#"DROP SCHEMA IF EXISTS "{schema}" CASCADE;
               CREATE SCHEMA "{schema}";
               SET search_path TO "{schema}";"#
        ))
        .await?;
    Ok(client)
}

async fn cleanup_schema(client: &tokio_postgres::Client, schema: &str) {
    let _ = client
        .batch_execute(&format!(r#"DROP SCHEMA IF EXISTS "{schema}" CASCADE"#))
        .await;
}

fn record(date: &str, time: &str, agent: Option<&str>) -> NormalizedCallRecord {
    NormalizedCallRecord {
        data: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        hora: NaiveTime::parse_from_str(time, "%H:%M:%S").unwrap(),
        duracao: 30,
        fila: Some("10".to_string()),
        holdtime: 2,
        teleatendente: agent.map(str::to_string),
        estado: 1,
        cob: "52".to_string(),
    }
}

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

#[tokio::test]
#[ignore]
async fn test_append_and_watermark() {
    let Some(url) = get_test_url() else {
        println!("Skipping: TEST_TARGET_URL not set");
        return;
    };
    let schema = "call_replicator_append_test";

    let client = connect_isolated(&url, schema).await.unwrap();
    ensure_schema(&client, LoadMode::Append).await.unwrap();
    // Running it twice must be harmless.
    ensure_schema(&client, LoadMode::Append).await.unwrap();
    println!("✓ Schema created");

    let mut destination = PostgresDestination::new(client, LoadMode::Append);
    assert_eq!(destination.newest().await.unwrap(), Watermark::Empty);

    let page = vec![
        record("2024-01-01", "23:59:00", Some("a")),
        record("2024-01-02", "08:15:00", Some("b")),
        record("2024-01-02", "07:00:00", None),
    ];
    let inserted = destination.append(&page).await.unwrap();
    assert_eq!(inserted, 3);
    assert_eq!(destination.row_count().await.unwrap(), 3);
    println!("✓ Page appended");

    // Max date first, then max time on that date.
    assert_eq!(
        destination.newest().await.unwrap(),
        Watermark::At(ts("2024-01-02 08:15:00"))
    );
    assert!(destination.contains(ts("2024-01-02 07:00:00")).await.unwrap());
    assert!(!destination.contains(ts("2024-01-02 07:00:01")).await.unwrap());
    assert!(destination.has_rows_after(ts("2024-01-01 23:59:00")).await.unwrap());
    assert!(!destination.has_rows_after(ts("2024-01-02 08:15:00")).await.unwrap());
    println!("✓ Watermark lookups match");

    // Append mode keeps duplicates.
    destination.append(&page[..1]).await.unwrap();
    assert_eq!(destination.row_count().await.unwrap(), 4);

    cleanup_schema(destination.client(), schema).await;
}

#[tokio::test]
#[ignore]
async fn test_skip_duplicates_mode() {
    let Some(url) = get_test_url() else {
        println!("Skipping: TEST_TARGET_URL not set");
        return;
    };
    let schema = "call_replicator_skip_test";

    let client = connect_isolated(&url, schema).await.unwrap();
    ensure_schema(&client, LoadMode::SkipDuplicates).await.unwrap();

    let mut destination = PostgresDestination::new(client, LoadMode::SkipDuplicates);
    let page = vec![
        record("2024-03-01", "10:00:00", Some("a")),
        record("2024-03-01", "10:00:00", Some("b")),
    ];
    assert_eq!(destination.append(&page).await.unwrap(), 2);

    // Re-delivering the same page inserts nothing.
    assert_eq!(destination.append(&page).await.unwrap(), 0);
    assert_eq!(destination.row_count().await.unwrap(), 2);
    println!("✓ Duplicates skipped");

    cleanup_schema(destination.client(), schema).await;
}

#[tokio::test]
#[ignore]
async fn test_failed_page_leaves_no_rows() {
    let Some(url) = get_test_url() else {
        println!("Skipping: TEST_TARGET_URL not set");
        return;
    };
    let schema = "call_replicator_atomic_test";

    let client = connect_isolated(&url, schema).await.unwrap();
    ensure_schema(&client, LoadMode::Append).await.unwrap();

    let mut destination = PostgresDestination::new(client, LoadMode::Append);
    let mut bad = record("2024-03-01", "10:00:01", Some("b"));
    // Too long for VARCHAR(10), so the statement fails.
    bad.fila = Some("queue-name-too-long".to_string());
    let page = vec![record("2024-03-01", "10:00:00", Some("a")), bad];

    assert!(destination.append(&page).await.is_err());
    assert_eq!(destination.row_count().await.unwrap(), 0);
    println!("✓ Failed page rolled back");

    cleanup_schema(destination.client(), schema).await;
}
